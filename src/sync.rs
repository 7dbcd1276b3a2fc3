//! Process-shared pthread primitives living inside a shared-memory mapping.
//!
//! Both types are initialized in place and never moved afterwards; they are
//! only ever reached through a pointer into the mapping.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::time::Duration;

use nix::errno::Errno;
use nix::libc::{
    self, pthread_cond_broadcast, pthread_cond_init, pthread_cond_t, pthread_cond_timedwait,
    pthread_cond_wait, pthread_condattr_destroy, pthread_condattr_init,
    pthread_condattr_setclock, pthread_condattr_setpshared, pthread_mutex_consistent,
    pthread_mutex_init, pthread_mutex_lock, pthread_mutex_t, pthread_mutex_unlock,
    pthread_mutexattr_destroy, pthread_mutexattr_init, pthread_mutexattr_setpshared,
    pthread_mutexattr_setrobust, timespec, PTHREAD_MUTEX_ROBUST, PTHREAD_PROCESS_SHARED,
};
use nix::sys::time::TimeSpec;
use nix::time::{clock_gettime, ClockId};

macro_rules! check_err {
    ($call:expr) => {
        match $call {
            0 => {}
            err => return Err(Errno::from_raw(err)),
        }
    };
}

/// Clock used for every timed wait. Must match the clock bound to the
/// condition attribute.
const WAIT_CLOCK: ClockId = ClockId::CLOCK_MONOTONIC;

#[repr(C)]
pub(crate) struct PosixMutex {
    mtx: UnsafeCell<pthread_mutex_t>,
}

impl PosixMutex {
    /// # Safety
    ///
    /// `this` must point to writable, suitably aligned memory that no other
    /// thread or process is using yet.
    pub unsafe fn init(this: *mut Self) -> nix::Result<()> {
        let mut attr = MaybeUninit::uninit();
        check_err!(pthread_mutexattr_init(attr.as_mut_ptr()));
        let res = (|| unsafe {
            check_err!(pthread_mutexattr_setpshared(
                attr.as_mut_ptr(),
                PTHREAD_PROCESS_SHARED
            ));
            check_err!(pthread_mutexattr_setrobust(
                attr.as_mut_ptr(),
                PTHREAD_MUTEX_ROBUST
            ));
            check_err!(pthread_mutex_init(
                UnsafeCell::raw_get(&raw mut (*this).mtx),
                attr.as_ptr()
            ));
            Ok(())
        })();
        pthread_mutexattr_destroy(attr.as_mut_ptr());
        res
    }

    pub fn lock(&self) -> nix::Result<PosixMutexGuard<'_>> {
        let ret = unsafe { pthread_mutex_lock(self.mtx.get()) };
        self.recover(ret)?;
        Ok(PosixMutexGuard { mutex: self })
    }

    /// Accepts `EOWNERDEAD`: the previous owner died holding the lock, so the
    /// protected state is taken as-is and the mutex is made usable again.
    fn recover(&self, ret: i32) -> nix::Result<()> {
        match ret {
            0 => Ok(()),
            libc::EOWNERDEAD => {
                tracing::warn!("previous owner of a shared mutex died, recovering");
                check_err!(unsafe { pthread_mutex_consistent(self.mtx.get()) });
                Ok(())
            }
            err => Err(Errno::from_raw(err)),
        }
    }
}

pub(crate) struct PosixMutexGuard<'a> {
    mutex: &'a PosixMutex,
}

impl Drop for PosixMutexGuard<'_> {
    fn drop(&mut self) {
        unsafe {
            pthread_mutex_unlock(self.mutex.mtx.get());
        }
    }
}

#[repr(C)]
pub(crate) struct PosixCondition {
    cond: UnsafeCell<pthread_cond_t>,
}

impl PosixCondition {
    /// # Safety
    ///
    /// Same contract as [`PosixMutex::init`].
    pub unsafe fn init(this: *mut Self) -> nix::Result<()> {
        let mut attr = MaybeUninit::uninit();
        check_err!(pthread_condattr_init(attr.as_mut_ptr()));
        let res = (|| unsafe {
            check_err!(pthread_condattr_setpshared(
                attr.as_mut_ptr(),
                PTHREAD_PROCESS_SHARED
            ));
            check_err!(pthread_condattr_setclock(
                attr.as_mut_ptr(),
                libc::CLOCK_MONOTONIC
            ));
            check_err!(pthread_cond_init(
                UnsafeCell::raw_get(&raw mut (*this).cond),
                attr.as_ptr()
            ));
            Ok(())
        })();
        pthread_condattr_destroy(attr.as_mut_ptr());
        res
    }

    pub fn wait(&self, guard: &mut PosixMutexGuard<'_>) -> nix::Result<()> {
        let ret = unsafe { pthread_cond_wait(self.cond.get(), guard.mutex.mtx.get()) };
        guard.mutex.recover(ret)
    }

    /// Returns `true` if the deadline passed.
    pub fn wait_until(
        &self,
        guard: &mut PosixMutexGuard<'_>,
        deadline: &TimeSpec,
    ) -> nix::Result<bool> {
        let abstime: &timespec = deadline.as_ref();
        let ret = unsafe { pthread_cond_timedwait(self.cond.get(), guard.mutex.mtx.get(), abstime) };
        match ret {
            libc::ETIMEDOUT => Ok(true),
            ret => guard.mutex.recover(ret).map(|()| false),
        }
    }

    pub fn broadcast(&self) -> nix::Result<()> {
        check_err!(unsafe { pthread_cond_broadcast(self.cond.get()) });
        Ok(())
    }
}

/// Longest wait that is turned into an absolute deadline. `TimeSpec`
/// arithmetic goes through `i64` nanoseconds, so anything much past this
/// would overflow; longer timeouts wait without a deadline instead.
pub(crate) const MAX_TIMED_WAIT: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// `None` means the timeout is too long to express and the caller should
/// wait untimed.
pub(crate) fn deadline_after(timeout: Duration) -> nix::Result<Option<TimeSpec>> {
    if timeout > MAX_TIMED_WAIT {
        return Ok(None);
    }
    Ok(Some(clock_gettime(WAIT_CLOCK)? + TimeSpec::from_duration(timeout)))
}

pub(crate) fn deadline_passed(deadline: &TimeSpec) -> nix::Result<bool> {
    Ok(clock_gettime(WAIT_CLOCK)? >= *deadline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    struct Pair {
        mutex: PosixMutex,
        cond: PosixCondition,
        flag: UnsafeCell<bool>,
    }

    unsafe impl Send for Pair {}
    unsafe impl Sync for Pair {}

    fn pair() -> Arc<Pair> {
        let mut pair = Arc::new(MaybeUninit::<Pair>::uninit());
        let ptr = Arc::get_mut(&mut pair).unwrap().as_mut_ptr();
        unsafe {
            PosixMutex::init(&raw mut (*ptr).mutex).unwrap();
            PosixCondition::init(&raw mut (*ptr).cond).unwrap();
            (&raw mut (*ptr).flag).write(UnsafeCell::new(false));
            Arc::from_raw(Arc::into_raw(pair).cast::<Pair>())
        }
    }

    #[test]
    fn timed_wait_reports_deadline() {
        let pair = pair();
        let mut guard = pair.mutex.lock().unwrap();
        let start = Instant::now();
        let deadline = deadline_after(Duration::from_millis(50)).unwrap().unwrap();
        let mut timed_out = false;
        while !timed_out {
            timed_out = pair.cond.wait_until(&mut guard, &deadline).unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(deadline_passed(&deadline).unwrap());
    }

    #[test]
    fn huge_timeouts_have_no_deadline() {
        assert!(deadline_after(Duration::MAX).unwrap().is_none());
        assert!(deadline_after(Duration::from_secs(u64::MAX / 2)).unwrap().is_none());
        assert!(deadline_after(MAX_TIMED_WAIT + Duration::from_nanos(1))
            .unwrap()
            .is_none());
    }

    #[test]
    fn longest_timed_wait_lies_in_the_future() {
        let deadline = deadline_after(MAX_TIMED_WAIT).unwrap().unwrap();
        assert!(!deadline_passed(&deadline).unwrap());
    }

    #[test]
    fn broadcast_wakes_waiter() {
        let pair = pair();
        let waiter = {
            let pair = Arc::clone(&pair);
            thread::spawn(move || {
                let mut guard = pair.mutex.lock().unwrap();
                while !unsafe { *pair.flag.get() } {
                    pair.cond.wait(&mut guard).unwrap();
                }
            })
        };
        {
            let _guard = pair.mutex.lock().unwrap();
            unsafe { *pair.flag.get() = true };
            pair.cond.broadcast().unwrap();
        }
        waiter.join().unwrap();
    }
}
