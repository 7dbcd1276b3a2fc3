//! Single-slot cross-process notifications over POSIX shared memory.
//!
//! A [`Channel`] is three host-wide names: a shared buffer and two named
//! manual-reset events, `ready` and `ack`. The [`Role::Server`] end creates
//! them, world-accessible; the [`Role::Client`] end opens them. A writer puts
//! one ASCII message into the buffer, sets `ready` and waits for `ack`. The
//! listener thread of the other end wakes on `ready`, hands the message to
//! its subscribers, resets `ready` and sets `ack`.
//!
//! ```no_run
//! use shmpoke::{Channel, Role};
//!
//! # fn main() -> shmpoke::Result<()> {
//! let server = Channel::server()?;
//! server.subscribe(|msg| {
//!     println!("got {}", msg.data());
//!     Ok(())
//! });
//! server.init()?;
//!
//! // In another process:
//! let client = Channel::options().role(Role::Client).open()?;
//! client.send("hello")?;
//! # Ok(())
//! # }
//! ```
//!
//! Exactly one message is in flight at a time and there is no queue.

#[cfg(not(target_os = "linux"))]
compile_error!("shmpoke needs Linux process-shared robust pthread mutexes");

pub mod buffer;
mod channel;
pub mod error;
pub mod event;
mod listener;
mod mmap_raw;
mod notify;
pub mod provision;
mod shm;
mod sync;

pub use buffer::MAX_LENGTH;
pub use channel::{
    Channel, ChannelConfig, OpenOptions, DEFAULT_JOIN_TIMEOUT, DEFAULT_SEND_TIMEOUT,
};
pub use error::{Error, Result};
pub use event::{NamedEvent, Wake};
pub use listener::ListenerState;
pub use notify::{CallbackError, Notification, SubscriptionId};
pub use provision::{ChannelNames, Role};
pub use shm::normalize_name;
