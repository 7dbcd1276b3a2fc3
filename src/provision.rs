//! Creating (Server) or attaching to (Client) the named resources of a
//! channel.

use crate::error::Result;
use crate::event::NamedEvent;
use crate::shm::normalize_name;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    /// Creates the named objects. Must start before any Client. Only one
    /// Server per set of names is supported; a second one silently shares
    /// the first one's objects.
    #[default]
    Server,
    /// Opens objects a Server already created.
    Client,
}

/// The three host-wide names identifying one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelNames {
    pub buffer: String,
    pub ready: String,
    pub ack: String,
}

const DEFAULT_SUFFIX: &str = "53b088df-c8a2-4fff-ba70-dda696778e09";

impl ChannelNames {
    /// Derives all three names from one prefix, so several channels can run
    /// side by side on one host.
    pub fn with_prefix(prefix: &str) -> Self {
        let prefix = prefix.trim_start_matches('/');
        ChannelNames {
            buffer: format!("/{prefix}-buffer"),
            ready: format!("/{prefix}-ready"),
            ack: format!("/{prefix}-ack"),
        }
    }

    pub(crate) fn normalized(&self) -> Result<Self> {
        Ok(ChannelNames {
            buffer: normalize_name(&self.buffer)?,
            ready: normalize_name(&self.ready)?,
            ack: normalize_name(&self.ack)?,
        })
    }
}

impl Default for ChannelNames {
    fn default() -> Self {
        ChannelNames {
            buffer: format!("/shmpoke-{DEFAULT_SUFFIX}"),
            ready: format!("/shmpoke-ready-{DEFAULT_SUFFIX}"),
            ack: format!("/shmpoke-ack-{DEFAULT_SUFFIX}"),
        }
    }
}

/// The event pair of a channel. Either side may be missing on a Client that
/// started before its Server.
#[derive(Debug, Default)]
pub struct Provisioned {
    pub ready: Option<NamedEvent>,
    pub ack: Option<NamedEvent>,
}

/// Acquires both events of `names` for `role`.
///
/// A Client treats a missing event as an expected startup-ordering
/// condition: it is logged and left out of the result. Every other failure
/// is returned to the caller and never retried.
pub fn provision(role: Role, names: &ChannelNames) -> Result<Provisioned> {
    let ready = acquire(role, &names.ready)?;
    let ack = acquire(role, &names.ack)?;
    Ok(Provisioned { ready, ack })
}

fn acquire(role: Role, name: &str) -> Result<Option<NamedEvent>> {
    match role {
        Role::Server => {
            let (event, created) = NamedEvent::create(name)?;
            if created {
                tracing::debug!(name = %event.name(), "event created");
            } else {
                tracing::warn!(
                    name = %event.name(),
                    "event already existed, another server may be running on this channel"
                );
            }
            Ok(Some(event))
        }
        Role::Client => {
            let event = NamedEvent::open(name)?;
            match &event {
                Some(event) => tracing::debug!(name = %event.name(), "event opened"),
                None => tracing::warn!(name, "event does not exist, is the server running?"),
            }
            Ok(event)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names() -> ChannelNames {
        ChannelNames::with_prefix(&format!("shmpoke-prov-{}", uuid::Uuid::new_v4()))
    }

    #[test]
    fn with_prefix_derives_three_names() {
        let names = ChannelNames::with_prefix("/demo");
        assert_eq!(names.buffer, "/demo-buffer");
        assert_eq!(names.ready, "/demo-ready");
        assert_eq!(names.ack, "/demo-ack");
    }

    #[test]
    fn default_names_are_valid() {
        let names = ChannelNames::default();
        assert_eq!(names.normalized().unwrap(), names);
    }

    #[test]
    fn client_without_server_gets_nothing() {
        let provisioned = provision(Role::Client, &names()).unwrap();
        assert!(provisioned.ready.is_none());
        assert!(provisioned.ack.is_none());
    }

    #[test]
    fn client_attaches_after_server() {
        let names = names();
        let server = provision(Role::Server, &names).unwrap();
        assert!(server.ready.is_some() && server.ack.is_some());

        let client = provision(Role::Client, &names).unwrap();
        let (ready, ack) = (client.ready.unwrap(), client.ack.unwrap());
        server.ready.as_ref().unwrap().set().unwrap();
        assert!(ready.is_signaled());
        assert!(!ack.is_signaled());
    }

    #[test]
    fn second_server_acquires_existing_events() {
        let names = names();
        let first = provision(Role::Server, &names).unwrap();
        let second = provision(Role::Server, &names).unwrap();
        first.ack.as_ref().unwrap().set().unwrap();
        assert!(second.ack.unwrap().is_signaled());
    }
}
