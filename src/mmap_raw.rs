use std::num::NonZero;
use std::ops::{Deref, DerefMut};
use std::os::fd::AsFd;
use std::ptr::NonNull;

use nix::libc::c_void;
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};

/// A shared, read/write mapping that is unmapped on drop.
#[derive(Debug)]
pub(crate) struct MmapRaw {
    pub ptr: NonNull<c_void>,
    pub len: usize,
}

// The mapping is plain shared memory; synchronization is up to its users.
unsafe impl Send for MmapRaw {}
unsafe impl Sync for MmapRaw {}

impl MmapRaw {
    pub fn shared<F: AsFd>(file: &F, len: NonZero<usize>) -> nix::Result<Self> {
        let ptr = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                file,
                0,
            )?
        };
        Ok(MmapRaw {
            ptr,
            len: len.get(),
        })
    }
}

impl Drop for MmapRaw {
    fn drop(&mut self) {
        if let Err(err) = unsafe { munmap(self.ptr, self.len) } {
            tracing::error!(error = %err, len = self.len, "munmap failed");
        }
    }
}

impl Deref for MmapRaw {
    type Target = [u8];
    fn deref(&self) -> &Self::Target {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr() as *const u8, self.len) }
    }
}

impl DerefMut for MmapRaw {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr() as *mut u8, self.len) }
    }
}
