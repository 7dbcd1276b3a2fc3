//! The background thread that turns the `ready` event into notifications.
//!
//! ```text
//! Idle -> Waiting -> Dispatching -> Waiting -> ... -> Terminated
//! ```
//!
//! The thread blocks on `ready` or the local stop flag, never polls. After
//! every wake on `ready` it resets `ready` and sets `ack`, whether or not the
//! read and the callbacks succeeded; a writer is never left waiting on a
//! listener that saw its message.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::buffer::BufferTarget;
use crate::error::{Error, Result};
use crate::event::{NamedEvent, Wake};
use crate::notify::{Notification, Subscribers};

const THREAD_NAME: &str = "shmpoke-listener";

/// The rendezvous events of one channel.
#[derive(Debug)]
pub(crate) struct EventPair {
    /// Set by a writer once the buffer holds a message.
    pub ready: NamedEvent,
    /// Set by the listener once the message was consumed.
    pub ack: NamedEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ListenerState {
    Idle = 0,
    Waiting = 1,
    Dispatching = 2,
    Terminated = 3,
}

#[derive(Debug, Default)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub fn get(&self) -> ListenerState {
        match self.0.load(Ordering::Acquire) {
            0 => ListenerState::Idle,
            1 => ListenerState::Waiting,
            2 => ListenerState::Dispatching,
            _ => ListenerState::Terminated,
        }
    }

    fn set(&self, state: ListenerState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Handle to a running listener thread.
pub(crate) struct Listener {
    handle: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    events: Arc<EventPair>,
    exited: mpsc::Receiver<()>,
}

impl Listener {
    pub fn spawn(
        events: Arc<EventPair>,
        buffer: BufferTarget,
        subscribers: Arc<Subscribers>,
        state: Arc<StateCell>,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let (exited_tx, exited) = mpsc::channel();
        let worker = Worker {
            events: Some(Arc::clone(&events)),
            stop: Arc::clone(&stop),
            buffer,
            subscribers,
            state,
            exited: exited_tx,
        };
        let handle = thread::Builder::new()
            .name(THREAD_NAME.into())
            .spawn(move || worker.run())
            .map_err(Error::Spawn)?;
        Ok(Listener {
            handle: Some(handle),
            stop,
            events,
            exited,
        })
    }

    /// Asks the thread to stop and waits up to `timeout` for it to finish
    /// its teardown. A thread that misses the bound is detached, not killed.
    pub fn stop(mut self, timeout: Duration) -> Result<()> {
        self.stop.store(true, Ordering::Release);
        if let Err(err) = self.events.ready.interrupt() {
            tracing::error!(error = %err, "failed to wake listener");
        }
        match self.exited.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(handle) = self.handle.take() {
                    if handle.join().is_err() {
                        tracing::error!("listener thread panicked");
                    }
                }
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(?timeout, "listener did not exit in time, detaching it");
                Err(Error::ShutdownTimeout(timeout))
            }
        }
    }
}

struct Worker {
    /// Taken during teardown so the handles are released before the exit is
    /// reported.
    events: Option<Arc<EventPair>>,
    stop: Arc<AtomicBool>,
    buffer: BufferTarget,
    subscribers: Arc<Subscribers>,
    state: Arc<StateCell>,
    exited: mpsc::Sender<()>,
}

impl Worker {
    fn run(self) {
        let Some(events) = self.events.clone() else {
            return;
        };
        tracing::info!(ready = %events.ready.name(), "listener started");
        loop {
            self.state.set(ListenerState::Waiting);
            match events.ready.wait_or_stop(&self.stop) {
                Ok(Wake::Stopped) => break,
                Ok(Wake::Signaled) => {}
                Err(err) => {
                    tracing::error!(error = %err, "listener wait failed");
                    break;
                }
            }
            self.state.set(ListenerState::Dispatching);
            self.dispatch(&events);
        }
        // Teardown runs in Drop, which also covers unwinding.
    }

    fn dispatch(&self, events: &EventPair) {
        match self.buffer.read_message() {
            Ok(data) => {
                tracing::debug!(len = data.len(), "message received");
                let failed = self.subscribers.dispatch(&Notification::new(data));
                if failed > 0 {
                    tracing::warn!(failed, "some subscribers failed");
                }
            }
            Err(err) => tracing::error!(error = %err, "failed to read shared buffer"),
        }
        if let Err(err) = events.ready.reset() {
            tracing::error!(error = %err, "failed to reset ready");
        }
        if let Err(err) = events.ack.set() {
            tracing::error!(error = %err, "failed to signal ack");
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if let Some(events) = self.events.take() {
            // Release a writer that may be parked on ack.
            for event in [&events.ready, &events.ack] {
                if let Err(err) = event.set() {
                    tracing::error!(name = %event.name(), error = %err, "teardown signal failed");
                }
            }
        }
        self.state.set(ListenerState::Terminated);
        tracing::info!("listener stopped");
        let _ = self.exited.send(());
    }
}
