use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use crate::buffer::{self, BufferTarget, MAX_LENGTH};
use crate::error::{Error, Result};
use crate::listener::{EventPair, Listener, ListenerState, StateCell};
use crate::notify::{CallbackError, Notification, SubscriptionId, Subscribers};
use crate::provision::{provision, ChannelNames, Provisioned, Role};
use crate::shm;

/// How long [`Channel::send`] waits for the peer to acknowledge.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_millis(20_000);

/// How long [`Channel::shutdown`] waits for the listener thread to exit.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_millis(5_000);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    pub role: Role,
    pub names: ChannelNames,
    /// Buffer size in bytes, terminator included.
    pub capacity: usize,
    pub send_timeout: Duration,
    pub join_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            role: Role::default(),
            names: ChannelNames::default(),
            capacity: MAX_LENGTH,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }
}

pub struct OpenOptions {
    config: ChannelConfig,
}

impl OpenOptions {
    pub fn new() -> Self {
        OpenOptions {
            config: ChannelConfig::default(),
        }
    }

    pub fn open(self) -> Result<Channel> {
        Channel::with_config(self.config)
    }

    pub fn role(mut self, role: Role) -> Self {
        self.config.role = role;
        self
    }

    pub fn names(mut self, names: ChannelNames) -> Self {
        self.config.names = names;
        self
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.config.capacity = capacity;
        self
    }

    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.config.send_timeout = timeout;
        self
    }

    pub fn join_timeout(mut self, timeout: Duration) -> Self {
        self.config.join_timeout = timeout;
        self
    }
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self::new()
    }
}

enum Slot {
    Ready(Arc<EventPair>),
    /// Provisioning found no event under this name.
    Missing(String),
    Released,
}

/// One end of a single-slot notification channel.
///
/// Either role may [`send`](Channel::send); only a channel that called
/// [`init`](Channel::init) receives notifications. Both ends share one pair
/// of events, so an end that listens should leave sending to its peer,
/// otherwise its own listener consumes what it sends.
///
/// `send` is serialized per `Channel` only. Nothing stops a second process
/// from writing to the same buffer concurrently; each channel must have a
/// single writing process.
pub struct Channel {
    config: ChannelConfig,
    events: RwLock<Slot>,
    send_lock: Mutex<()>,
    listener: Mutex<Option<Listener>>,
    listener_state: Arc<StateCell>,
    subscribers: Arc<Subscribers>,
}

impl Channel {
    pub fn options() -> OpenOptions {
        OpenOptions::new()
    }

    /// Creates the default channel.
    pub fn server() -> Result<Self> {
        Self::options().role(Role::Server).open()
    }

    /// Attaches to the default channel.
    pub fn client() -> Result<Self> {
        Self::options().role(Role::Client).open()
    }

    /// Provisions the named events for `config.role`.
    ///
    /// # Errors
    ///
    /// Fails on invalid names or capacity, and on any provisioning error
    /// other than a Client finding no event, which leaves the channel
    /// unprovisioned instead (see [`Channel::is_provisioned`]).
    pub fn with_config(mut config: ChannelConfig) -> Result<Self> {
        if config.capacity == 0 {
            return Err(Error::InvalidConfig("capacity must hold at least the terminator"));
        }
        config.names = config.names.normalized()?;

        let Provisioned { ready, ack } = provision(config.role, &config.names)?;
        let events = match (ready, ack) {
            (Some(ready), Some(ack)) => Slot::Ready(Arc::new(EventPair { ready, ack })),
            (None, _) => Slot::Missing(config.names.ready.clone()),
            (_, None) => Slot::Missing(config.names.ack.clone()),
        };
        if let Slot::Ready(_) = events {
            if config.role == Role::Server {
                BufferTarget::for_role(config.role, &config.names.buffer, config.capacity)
                    .ensure()?;
            }
            tracing::info!(role = ?config.role, buffer = %config.names.buffer, "channel provisioned");
        }

        Ok(Channel {
            config,
            events: RwLock::new(events),
            send_lock: Mutex::new(()),
            listener: Mutex::new(None),
            listener_state: Arc::default(),
            subscribers: Arc::default(),
        })
    }

    pub fn role(&self) -> Role {
        self.config.role
    }

    pub fn names(&self) -> &ChannelNames {
        &self.config.names
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    pub fn is_provisioned(&self) -> bool {
        matches!(*self.read_events(), Slot::Ready(_))
    }

    pub fn is_listening(&self) -> bool {
        self.lock_listener().is_some()
    }

    pub fn listener_state(&self) -> ListenerState {
        self.listener_state.get()
    }

    /// Registers a callback run on the listener thread for every message.
    /// No ordering between callbacks is guaranteed.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Notification) -> std::result::Result<(), CallbackError> + Send + Sync + 'static,
    {
        self.subscribers.add(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.remove(id)
    }

    /// Starts the listener thread.
    ///
    /// # Errors
    ///
    /// [`Error::NotProvisioned`] if an event is missing, [`Error::Closed`]
    /// after shutdown, [`Error::AlreadyListening`] on a second call.
    pub fn init(&self) -> Result<()> {
        let mut listener = self.lock_listener();
        if listener.is_some() {
            return Err(Error::AlreadyListening);
        }
        let events = self.events().inspect_err(|err| {
            tracing::error!(error = %err, "cannot start listener");
        })?;
        *listener = Some(Listener::spawn(
            events,
            self.buffer(),
            Arc::clone(&self.subscribers),
            Arc::clone(&self.listener_state),
        )?);
        Ok(())
    }

    /// Delivers `text` to the peer's listener and waits for its
    /// acknowledgment.
    ///
    /// # Errors
    ///
    /// Invalid or oversized text is rejected before anything is written.
    /// [`Error::Timeout`] means no acknowledgment arrived within the send
    /// timeout; the peer may or may not have read the message.
    pub fn send(&self, text: &str) -> Result<()> {
        let frame = buffer::encode(text, self.config.capacity)?;
        let _guard = self.send_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let events = self.events()?;

        // A listener that answered after an earlier timeout leaves ack set.
        events.ack.reset()?;
        self.buffer().write_frame(&frame)?;
        events.ready.set()?;

        if events.ack.wait_timeout(self.config.send_timeout)? {
            events.ack.reset()?;
            tracing::debug!(len = text.len(), "message acknowledged");
            Ok(())
        } else {
            // Withdraw the message so a later listener does not pick it up.
            if let Err(err) = events.ready.reset() {
                tracing::error!(error = %err, "failed to reset ready after timeout");
            }
            tracing::warn!(timeout = ?self.config.send_timeout, "message not acknowledged");
            Err(Error::Timeout(self.config.send_timeout))
        }
    }

    /// Formatted variant of [`Channel::send`].
    pub fn send_fmt(&self, args: fmt::Arguments<'_>) -> Result<()> {
        self.send(&fmt::format(args))
    }

    /// Reads whatever message the shared buffer currently holds. A Client
    /// gets [`Error::NotFound`] once the Server has removed the buffer.
    pub fn peek(&self) -> Result<String> {
        self.buffer().read_message()
    }

    /// Stops the listener, waiting at most the join timeout, and releases
    /// the named events. A Server also removes the names. Calling it again
    /// does nothing.
    ///
    /// # Errors
    ///
    /// [`Error::ShutdownTimeout`] if the listener did not exit in time. The
    /// resources are released anyway.
    pub fn shutdown(&self) -> Result<()> {
        let listener = self.lock_listener().take();
        let stopped = match listener {
            Some(listener) => listener.stop(self.config.join_timeout),
            None => Ok(()),
        };
        self.release();
        stopped
    }

    fn release(&self) {
        let previous = {
            let mut events = self.events.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *events, Slot::Released)
        };
        if let Slot::Ready(events) = previous {
            drop(events);
            if self.config.role == Role::Server {
                if let Err(err) = shm::unlink(&self.config.names.buffer) {
                    tracing::warn!(error = %err, "failed to unlink buffer");
                }
            }
            tracing::info!(role = ?self.config.role, "channel released");
        }
    }

    fn buffer(&self) -> BufferTarget {
        BufferTarget::for_role(self.config.role, &self.config.names.buffer, self.config.capacity)
    }

    fn events(&self) -> Result<Arc<EventPair>> {
        match &*self.read_events() {
            Slot::Ready(events) => Ok(Arc::clone(events)),
            Slot::Missing(name) => Err(Error::NotProvisioned { name: name.clone() }),
            Slot::Released => Err(Error::Closed),
        }
    }

    fn read_events(&self) -> std::sync::RwLockReadGuard<'_, Slot> {
        self.events.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_listener(&self) -> MutexGuard<'_, Option<Listener>> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("config", &self.config)
            .field("provisioned", &self.is_provisioned())
            .field("listener_state", &self.listener_state())
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            tracing::warn!(error = %err, "channel shutdown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names() -> ChannelNames {
        ChannelNames::with_prefix(&format!("shmpoke-channel-{}", uuid::Uuid::new_v4()))
    }

    #[test]
    fn defaults_match_reference_sizing() {
        let config = ChannelConfig::default();
        assert_eq!(config.role, Role::Server);
        assert_eq!(config.capacity, 1024);
        assert_eq!(config.send_timeout, Duration::from_secs(20));
        assert_eq!(config.join_timeout, Duration::from_secs(5));
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let res = Channel::options().names(names()).capacity(0).open();
        assert!(matches!(res, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn invalid_names_are_rejected() {
        let mut bad = names();
        bad.ack = "a/b".into();
        let res = Channel::options().names(bad).open();
        assert!(matches!(res, Err(Error::InvalidName { .. })));
    }

    #[test]
    fn client_without_server_cannot_listen_or_send() {
        let client = Channel::options()
            .role(Role::Client)
            .names(names())
            .open()
            .unwrap();
        assert!(!client.is_provisioned());
        assert!(matches!(client.init(), Err(Error::NotProvisioned { .. })));
        assert!(!client.is_listening());
        assert_eq!(client.listener_state(), ListenerState::Idle);
        assert!(matches!(client.send("hi"), Err(Error::NotProvisioned { .. })));
    }

    #[test]
    fn init_twice_is_an_error() {
        let server = Channel::options().names(names()).open().unwrap();
        server.init().unwrap();
        assert!(matches!(server.init(), Err(Error::AlreadyListening)));
        server.shutdown().unwrap();
    }

    #[test]
    fn closed_channel_rejects_everything() {
        let server = Channel::options().names(names()).open().unwrap();
        server.shutdown().unwrap();
        assert!(!server.is_provisioned());
        assert!(matches!(server.init(), Err(Error::Closed)));
        assert!(matches!(server.send("late"), Err(Error::Closed)));
    }

    #[test]
    fn server_shutdown_removes_names() {
        let names = names();
        let server = Channel::options().names(names.clone()).open().unwrap();
        server.shutdown().unwrap();
        let client = Channel::options()
            .role(Role::Client)
            .names(names)
            .open()
            .unwrap();
        assert!(!client.is_provisioned());
    }
}
