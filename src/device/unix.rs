//! POSIX file device: `pread`/`pwrite`/`ftruncate`/`fsync`, trimmed to the
//! core's narrow contract (no locking, no shared memory — this engine is
//! single-process).

use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::sync::Mutex;

use crate::device::Device;
use crate::error::{Error, ErrorCode, Result};

#[cfg(target_os = "linux")]
fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

#[cfg(not(target_os = "linux"))]
fn errno() -> i32 {
    unsafe { *libc::__error() }
}

fn io_error(context: &str) -> Error {
    let e = std::io::Error::from_raw_os_error(errno());
    Error::with_context(ErrorCode::IoError, format!("{context}: {e}"))
}

/// A real file on disk, opened once and shared behind a mutex so the single
/// `&self` API surface above it stays synchronous and call-serialized —
/// this engine is single-writer, single-process.
pub struct FileDevice {
    fd: RawFd,
    // Guards nothing but ordering of the syscalls themselves; the engine's
    // single-threaded-cooperative contract means contention here is a bug
    // upstream, not expected steady-state behavior.
    _lock: Mutex<()>,
}

impl FileDevice {
    pub fn open(path: &str, create: bool, read_only: bool) -> Result<Self> {
        let c_path = CString::new(path)
            .map_err(|_| Error::with_context(ErrorCode::InvParameter, "path contains NUL"))?;
        let mut flags = if read_only {
            libc::O_RDONLY
        } else {
            libc::O_RDWR
        };
        if create {
            flags |= libc::O_CREAT;
        }
        let fd = unsafe { libc::open(c_path.as_ptr(), flags, 0o644) };
        if fd < 0 {
            return Err(io_error("open"));
        }
        Ok(Self {
            fd,
            _lock: Mutex::new(()),
        })
    }
}

impl Drop for FileDevice {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

impl Device for FileDevice {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let _guard = self._lock.lock().unwrap();
        let mut done = 0usize;
        while done < buf.len() {
            let n = unsafe {
                libc::pread(
                    self.fd,
                    buf[done..].as_mut_ptr() as *mut libc::c_void,
                    buf.len() - done,
                    (offset as i64 + done as i64) as libc::off_t,
                )
            };
            if n < 0 {
                return Err(io_error("pread"));
            }
            if n == 0 {
                // Short read past EOF: zero-fill the remainder.
                buf[done..].fill(0);
                break;
            }
            done += n as usize;
        }
        Ok(())
    }

    fn write(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let _guard = self._lock.lock().unwrap();
        let mut done = 0usize;
        while done < buf.len() {
            let n = unsafe {
                libc::pwrite(
                    self.fd,
                    buf[done..].as_ptr() as *const libc::c_void,
                    buf.len() - done,
                    (offset as i64 + done as i64) as libc::off_t,
                )
            };
            if n < 0 {
                return Err(io_error("pwrite"));
            }
            done += n as usize;
        }
        Ok(())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        let _guard = self._lock.lock().unwrap();
        let rc = unsafe { libc::ftruncate(self.fd, len as libc::off_t) };
        if rc != 0 {
            return Err(io_error("ftruncate"));
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let _guard = self._lock.lock().unwrap();
        let rc = unsafe { libc::fsync(self.fd) };
        if rc != 0 {
            return Err(io_error("fsync"));
        }
        Ok(())
    }

    fn file_size(&self) -> Result<u64> {
        let _guard = self._lock.lock().unwrap();
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::fstat(self.fd, &mut stat) };
        if rc != 0 {
            return Err(io_error("fstat"));
        }
        Ok(stat.st_size as u64)
    }
}
