use std::num::NonZero;
use std::ops::{Deref, DerefMut};
use std::os::fd::{AsRawFd, OwnedFd};

use nix::errno::Errno;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::{fchmod, fstat, Mode};
use nix::unistd::ftruncate;
use nix::{fcntl::OFlag, libc::off_t};

use crate::error::{Error, Result};
use crate::mmap_raw::MmapRaw;

/// Longest name accepted after the leading slash.
const NAME_MAX: usize = 255;

/// Read/write/read-write for owner, group and everyone else, so that a
/// process running as a different user can still open the object.
pub const WORLD_ACCESSIBLE: u32 = 0o666;

pub(crate) struct OpenOptions {
    mode: Mode,
    oflg: OFlag,
    len: usize,
}

impl OpenOptions {
    pub fn open(self, name: &str) -> Result<Shm> {
        let name = normalize_name(name)?;
        let len = NonZero::new(self.len)
            .ok_or(Error::InvalidConfig("segment length cannot be zero"))?;
        let creating = self.oflg.contains(OFlag::O_CREAT);

        let fd = shm_open(name.as_str(), self.oflg, self.mode)
            .map_err(|errno| Error::named("shm_open", &name, errno))?;
        if creating {
            force_mode(&fd, self.mode, &name)?;
        }

        let statbuf = fstat(fd.as_raw_fd()).map_err(|errno| Error::named("fstat", &name, errno))?;
        let size = usize::try_from(statbuf.st_size).unwrap_or(0);
        if size < self.len {
            if size == 0 && !creating {
                return Err(Error::Unsized { name });
            }
            if !creating {
                return Err(Error::Incompatible {
                    name,
                    reason: "segment is smaller than expected",
                });
            }
            ftruncate(&fd, self.len as off_t)
                .map_err(|errno| Error::named("ftruncate", &name, errno))?;
        }

        // The descriptor can be closed once mapped; the mapping keeps the
        // object alive.
        let map = MmapRaw::shared(&fd, len).map_err(Error::os("mmap"))?;
        Ok(Shm { name, map })
    }

    pub fn new() -> Self {
        OpenOptions {
            mode: Mode::from_bits_truncate(WORLD_ACCESSIBLE),
            oflg: OFlag::O_RDWR,
            len: 0,
        }
    }

    pub fn mode(mut self, mode: u32) -> Self {
        self.mode = Mode::from_bits_truncate(mode);
        self
    }

    pub fn create(mut self, create: bool) -> Self {
        if create {
            self.oflg |= OFlag::O_CREAT;
        } else {
            self.oflg &= !OFlag::O_CREAT;
        }
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        if exclusive {
            self.oflg |= OFlag::O_EXCL;
        } else {
            self.oflg &= !OFlag::O_EXCL;
        }
        self
    }

    pub fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }
}

/// `shm_open` applies the umask; set the requested mode explicitly. Only the
/// owner may do so, so `EPERM` on an object created by someone else is fine.
fn force_mode(fd: &OwnedFd, mode: Mode, name: &str) -> Result<()> {
    match fchmod(fd.as_raw_fd(), mode) {
        Ok(()) | Err(Errno::EPERM) => Ok(()),
        Err(errno) => Err(Error::named("fchmod", name, errno)),
    }
}

/// A mapped named shared-memory object. Dropping it unmaps the memory but
/// leaves the name in place; see [`unlink`].
pub(crate) struct Shm {
    name: String,
    map: MmapRaw,
}

impl Shm {
    pub fn options() -> OpenOptions {
        OpenOptions::new()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.map.ptr.as_ptr().cast()
    }
}

impl Deref for Shm {
    type Target = [u8];
    fn deref(&self) -> &Self::Target {
        &self.map
    }
}

impl DerefMut for Shm {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.map
    }
}

/// Removes a name. A name that is already gone is not an error.
pub(crate) fn unlink(name: &str) -> Result<()> {
    let name = normalize_name(name)?;
    match shm_unlink(name.as_str()) {
        Ok(()) | Err(Errno::ENOENT) => Ok(()),
        Err(errno) => Err(Error::named("shm_unlink", &name, errno)),
    }
}

/// Returns `name` with exactly one leading slash.
pub fn normalize_name(name: &str) -> Result<String> {
    let bare = name.strip_prefix('/').unwrap_or(name);
    let reason = if bare.is_empty() {
        Some("name is empty")
    } else if bare.contains('/') {
        Some("name cannot contain '/' past the leading slash")
    } else if bare.contains('\0') {
        Some("name cannot contain a NUL byte")
    } else if bare.len() > NAME_MAX {
        Some("name is longer than 255 bytes")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(Error::InvalidName {
            name: name.into(),
            reason,
        }),
        None => Ok(format!("/{bare}")),
    }
}
