//! Named manual-reset events.
//!
//! An event is a small shared-memory object holding a flag guarded by a
//! process-shared mutex, plus a condition variable that waiters block on.
//! Any process that knows the name can set, reset or wait on it. Once set,
//! an event stays set until someone resets it, and every waiter observes it.

use std::mem::size_of;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::shm::{self, Shm};
use crate::sync::{deadline_after, deadline_passed, PosixCondition, PosixMutex};

/// Marks a fully initialized event object.
const EVENT_MAGIC: u32 = 0x7370_6576;

const MANUAL_RESET: u32 = 1;

#[repr(C)]
struct EventState {
    magic: AtomicU32,
    reset_mode: AtomicU32,
    /// Only written with `mutex` held.
    signaled: AtomicU32,
    mutex: PosixMutex,
    cond: PosixCondition,
}

/// Why a [`NamedEvent::wait_or_stop`] call returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Signaled,
    Stopped,
}

pub struct NamedEvent {
    shm: Shm,
    owner: bool,
}

impl NamedEvent {
    /// Creates the event, or acquires it if it already exists. The flag
    /// tells which happened. Either way this handle unlinks the name when
    /// dropped.
    pub fn create(name: &str) -> Result<(Self, bool)> {
        let created = Shm::options()
            .create(true)
            .exclusive(true)
            .mode(shm::WORLD_ACCESSIBLE)
            .len(size_of::<EventState>())
            .open(name);
        match created {
            Ok(shm) => {
                let event = NamedEvent { shm, owner: true };
                event.initialize()?;
                Ok((event, true))
            }
            Err(Error::AlreadyExists { .. }) => {
                let shm = match Shm::options().len(size_of::<EventState>()).open(name) {
                    Ok(shm) => shm,
                    Err(Error::Unsized { name }) => return Err(Self::initializing(name)),
                    Err(err) => return Err(err),
                };
                // Not owned until validated, so a rejected object keeps its name.
                let mut event = NamedEvent { shm, owner: false };
                if !event.validate()? {
                    return Err(Self::initializing(event.shm.name().into()));
                }
                event.owner = true;
                Ok((event, false))
            }
            Err(err) => Err(err),
        }
    }

    /// Opens an existing event. Returns `None` if no event with this name
    /// exists yet, or if its creator has not finished setting it up.
    pub fn open(name: &str) -> Result<Option<Self>> {
        let shm = match Shm::options().len(size_of::<EventState>()).open(name) {
            Ok(shm) => shm,
            Err(Error::NotFound { .. } | Error::Unsized { .. }) => return Ok(None),
            Err(err) => return Err(err),
        };
        let event = NamedEvent { shm, owner: false };
        if event.validate()? {
            Ok(Some(event))
        } else {
            Ok(None)
        }
    }

    pub fn name(&self) -> &str {
        self.shm.name()
    }

    pub fn set(&self) -> Result<()> {
        let state = self.state();
        let _guard = state.mutex.lock().map_err(Error::os("event lock"))?;
        state.signaled.store(1, Ordering::Relaxed);
        state.cond.broadcast().map_err(Error::os("event broadcast"))
    }

    pub fn reset(&self) -> Result<()> {
        let state = self.state();
        let _guard = state.mutex.lock().map_err(Error::os("event lock"))?;
        state.signaled.store(0, Ordering::Relaxed);
        Ok(())
    }

    pub fn is_signaled(&self) -> bool {
        self.state().signaled.load(Ordering::Relaxed) != 0
    }

    /// Blocks until the event is set or `timeout` elapses. Returns whether
    /// the event was set. The event is left as is. Timeouts longer than a
    /// century wait until the event is set.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool> {
        let state = self.state();
        let deadline = deadline_after(timeout).map_err(Error::os("clock_gettime"))?;
        let mut guard = state.mutex.lock().map_err(Error::os("event lock"))?;
        loop {
            if state.signaled.load(Ordering::Relaxed) != 0 {
                return Ok(true);
            }
            let Some(deadline) = &deadline else {
                state.cond.wait(&mut guard).map_err(Error::os("event wait"))?;
                continue;
            };
            let timed_out = state
                .cond
                .wait_until(&mut guard, deadline)
                .map_err(Error::os("event wait"))?;
            if timed_out || deadline_passed(deadline).map_err(Error::os("clock_gettime"))? {
                return Ok(state.signaled.load(Ordering::Relaxed) != 0);
            }
        }
    }

    /// Blocks until the event is set or `stop` becomes true. `stop` wins if
    /// both hold. Whoever sets `stop` must call [`NamedEvent::interrupt`]
    /// afterwards.
    pub fn wait_or_stop(&self, stop: &AtomicBool) -> Result<Wake> {
        let state = self.state();
        let mut guard = state.mutex.lock().map_err(Error::os("event lock"))?;
        loop {
            if stop.load(Ordering::Acquire) {
                return Ok(Wake::Stopped);
            }
            if state.signaled.load(Ordering::Relaxed) != 0 {
                return Ok(Wake::Signaled);
            }
            state.cond.wait(&mut guard).map_err(Error::os("event wait"))?;
        }
    }

    /// Wakes every waiter without changing the event. Waiters re-check their
    /// conditions and go back to sleep if nothing changed.
    pub fn interrupt(&self) -> Result<()> {
        let state = self.state();
        let _guard = state.mutex.lock().map_err(Error::os("event lock"))?;
        state.cond.broadcast().map_err(Error::os("event broadcast"))
    }

    fn initializing(name: String) -> Error {
        Error::Incompatible {
            name,
            reason: "event is still being initialized by another process",
        }
    }

    fn state(&self) -> &EventState {
        unsafe { &*(self.shm.as_mut_ptr() as *const EventState) }
    }

    fn initialize(&self) -> Result<()> {
        let ptr = self.shm.as_mut_ptr() as *mut EventState;
        debug_assert!(ptr.is_aligned());
        unsafe {
            PosixMutex::init(&raw mut (*ptr).mutex).map_err(Error::os("pthread_mutex_init"))?;
            PosixCondition::init(&raw mut (*ptr).cond).map_err(Error::os("pthread_cond_init"))?;
        }
        let state = self.state();
        state.signaled.store(0, Ordering::Relaxed);
        state.reset_mode.store(MANUAL_RESET, Ordering::Relaxed);
        // Published last: openers treat anything else as not ready.
        state.magic.store(EVENT_MAGIC, Ordering::Release);
        Ok(())
    }

    /// `Ok(false)` while the creator has not finished initialization.
    fn validate(&self) -> Result<bool> {
        let state = self.state();
        match state.magic.load(Ordering::Acquire) {
            EVENT_MAGIC => {}
            0 => return Ok(false),
            _ => {
                return Err(Error::Incompatible {
                    name: self.name().into(),
                    reason: "object is not an event",
                })
            }
        }
        if state.reset_mode.load(Ordering::Relaxed) != MANUAL_RESET {
            return Err(Error::Incompatible {
                name: self.name().into(),
                reason: "event is not manual-reset",
            });
        }
        Ok(true)
    }
}

impl std::fmt::Debug for NamedEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedEvent")
            .field("name", &self.name())
            .field("owner", &self.owner)
            .field("signaled", &self.is_signaled())
            .finish()
    }
}

impl Drop for NamedEvent {
    fn drop(&mut self) {
        if self.owner {
            if let Err(err) = shm::unlink(self.shm.name()) {
                tracing::warn!(name = %self.shm.name(), error = %err, "failed to unlink event");
            }
        }
    }
}
