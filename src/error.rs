use std::io;
use std::time::Duration;

use nix::errno::Errno;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("named object {name} does not exist")]
    NotFound { name: String },

    #[error("named object {name} already exists")]
    AlreadyExists { name: String },

    #[error("permission denied on named object {name}")]
    PermissionDenied { name: String },

    #[error("named object {name} is incompatible: {reason}")]
    Incompatible { name: String, reason: &'static str },

    /// The object exists but its creator has not sized it yet.
    #[error("named object {name} has not been sized yet")]
    Unsized { name: String },

    #[error("invalid object name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },

    /// A named event was never acquired, usually because the Client started
    /// before the Server.
    #[error("channel is not provisioned: {name} is missing")]
    NotProvisioned { name: String },

    #[error("payload of {len} bytes plus terminator exceeds capacity of {capacity} bytes")]
    PayloadTooLarge { len: usize, capacity: usize },

    #[error("invalid payload: {0}")]
    InvalidPayload(&'static str),

    #[error("shared buffer holds no terminated message")]
    Unterminated,

    /// The peer did not acknowledge within the bound. Whether it read the
    /// buffer is unknown.
    #[error("no acknowledgment within {0:?}")]
    Timeout(Duration),

    #[error("listener is already running")]
    AlreadyListening,

    #[error("channel has been shut down")]
    Closed,

    #[error("listener did not exit within {0:?}")]
    ShutdownTimeout(Duration),

    #[error("failed to spawn listener thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("{op} failed: {source}")]
    Os {
        op: &'static str,
        #[source]
        source: Errno,
    },
}

impl Error {
    /// Maps an errno from an operation on the named object `name`.
    pub(crate) fn named(op: &'static str, name: &str, errno: Errno) -> Self {
        match errno {
            Errno::ENOENT => Error::NotFound { name: name.into() },
            Errno::EEXIST => Error::AlreadyExists { name: name.into() },
            Errno::EACCES | Errno::EPERM => Error::PermissionDenied { name: name.into() },
            source => Error::Os { op, source },
        }
    }

    pub(crate) fn os(op: &'static str) -> impl FnOnce(Errno) -> Self {
        move |source| Error::Os { op, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_maps_well_known_errnos() {
        assert!(matches!(
            Error::named("shm_open", "/x", Errno::ENOENT),
            Error::NotFound { name } if name == "/x"
        ));
        assert!(matches!(
            Error::named("shm_open", "/x", Errno::EEXIST),
            Error::AlreadyExists { .. }
        ));
        assert!(matches!(
            Error::named("shm_open", "/x", Errno::EACCES),
            Error::PermissionDenied { .. }
        ));
        assert!(matches!(
            Error::named("shm_open", "/x", Errno::EMFILE),
            Error::Os { op: "shm_open", source: Errno::EMFILE }
        ));
    }

    #[test]
    fn payload_too_large_message_names_both_sizes() {
        let err = Error::PayloadTooLarge { len: 1024, capacity: 1024 };
        assert_eq!(
            err.to_string(),
            "payload of 1024 bytes plus terminator exceeds capacity of 1024 bytes"
        );
    }
}
