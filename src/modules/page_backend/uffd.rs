/*
 *  Copyright (C) 2025  Markus Elias Gerber
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  You should have received a copy of the GNU General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use std::io;
use std::mem::size_of;
use std::os::unix::io::RawFd;
use std::ptr::null_mut;

use libc::{c_int, c_void};
use log::trace;
use static_assertions::const_assert_eq;

use super::{FaultWait, PageBackendModule};
use crate::vlm_error::VLMError;

// ---------------------------------------------------------------------------
// userfaultfd ABI (linux/userfaultfd.h). libc carries the syscall number but
// not the ioctl structs, so they are pinned here.
// ---------------------------------------------------------------------------

const UFFD_API: u64 = 0xAA;
/// Flag to the userfaultfd syscall: only trap faults from user-mode
/// accesses. Required for unprivileged use since Linux 5.11.
const UFFD_USER_MODE_ONLY: c_int = 1;

const UFFD_EVENT_PAGEFAULT: u8 = 0x12;
const UFFDIO_REGISTER_MODE_MISSING: u64 = 1 << 0;

#[repr(C)]
struct UffdioRange {
    start: u64,
    len: u64,
}

#[repr(C)]
struct UffdioApi {
    api: u64,
    features: u64,
    ioctls: u64,
}

#[repr(C)]
struct UffdioRegister {
    range: UffdioRange,
    mode: u64,
    ioctls: u64,
}

#[repr(C)]
struct UffdioCopy {
    dst: u64,
    src: u64,
    len: u64,
    mode: u64,
    /// out: bytes copied, or negated errno
    copy: i64,
}

#[repr(C)]
struct UffdioZeropage {
    range: UffdioRange,
    mode: u64,
    /// out: bytes zeroed, or negated errno
    zeropage: i64,
}

/// Fault notification message. The kernel writes exactly one of these per
/// read; the union arg is modeled as three words, the pagefault variant
/// keeps the address in the second.
#[repr(C)]
struct UffdMsg {
    event: u8,
    reserved1: u8,
    reserved2: u16,
    reserved3: u32,
    arg: [u64; 3],
}

const_assert_eq!(size_of::<UffdioRange>(), 16);
const_assert_eq!(size_of::<UffdioApi>(), 24);
const_assert_eq!(size_of::<UffdioRegister>(), 32);
const_assert_eq!(size_of::<UffdioCopy>(), 40);
const_assert_eq!(size_of::<UffdioZeropage>(), 32);
const_assert_eq!(size_of::<UffdMsg>(), 32);

const IOC_WRITE: u64 = 1;
const IOC_READ: u64 = 2;

const fn ioc(dir: u64, nr: u64, size: usize) -> u64 {
    (dir << 30) | ((size as u64) << 16) | (UFFD_API << 8) | nr
}

const UFFDIO_API_IOCTL: u64 = ioc(IOC_READ | IOC_WRITE, 0x3F, size_of::<UffdioApi>());
const UFFDIO_REGISTER_IOCTL: u64 = ioc(IOC_READ | IOC_WRITE, 0x00, size_of::<UffdioRegister>());
const UFFDIO_UNREGISTER_IOCTL: u64 = ioc(IOC_READ, 0x01, size_of::<UffdioRange>());
const UFFDIO_WAKE_IOCTL: u64 = ioc(IOC_READ, 0x02, size_of::<UffdioRange>());
const UFFDIO_COPY_IOCTL: u64 = ioc(IOC_READ | IOC_WRITE, 0x03, size_of::<UffdioCopy>());
const UFFDIO_ZEROPAGE_IOCTL: u64 = ioc(IOC_READ | IOC_WRITE, 0x04, size_of::<UffdioZeropage>());

fn uffd_error(op: &'static str) -> VLMError {
    VLMError::KernelUserfault {
        op,
        source: io::Error::last_os_error(),
    }
}

/// Demand paging on Linux userfaultfd.
///
/// One file descriptor serves the whole arena; faults are read as
/// messages, pages are installed with `UFFDIO_COPY`/`UFFDIO_ZEROPAGE`
/// and dropped with `madvise(MADV_DONTNEED)`. A self-pipe unblocks the
/// dispatcher for shutdown.
pub struct UffdPageBackend {
    uffd: RawFd,
    pipe_read: RawFd,
    pipe_write: RawFd,
    page_size: usize,
}

// Only raw fds inside; every operation goes through &self syscalls.
unsafe impl Send for UffdPageBackend {}
unsafe impl Sync for UffdPageBackend {}

impl UffdPageBackend {
    fn ioctl<T>(&self, op: &'static str, request: u64, arg: &mut T) -> Result<(), VLMError> {
        let ret = unsafe { libc::ioctl(self.uffd, request as libc::c_ulong, arg as *mut T) };
        if ret == -1 {
            return Err(uffd_error(op));
        }
        Ok(())
    }

    fn read_event(&self) -> Result<Option<UffdMsg>, VLMError> {
        let mut msg = UffdMsg {
            event: 0,
            reserved1: 0,
            reserved2: 0,
            reserved3: 0,
            arg: [0; 3],
        };

        let ret = unsafe {
            libc::read(
                self.uffd,
                &mut msg as *mut UffdMsg as *mut c_void,
                size_of::<UffdMsg>(),
            )
        };
        if ret == -1 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EINTR) => Ok(None),
                _ => Err(VLMError::KernelUserfault {
                    op: "read",
                    source: err,
                }),
            };
        }
        debug_assert_eq!(ret as usize, size_of::<UffdMsg>());
        Ok(Some(msg))
    }
}

impl PageBackendModule for UffdPageBackend {
    fn new() -> Result<Self, VLMError> {
        let flags = libc::O_CLOEXEC | libc::O_NONBLOCK;

        // user-mode-only first; kernels before 5.11 reject the flag
        let mut uffd =
            unsafe { libc::syscall(libc::SYS_userfaultfd, flags | UFFD_USER_MODE_ONLY) };
        if uffd == -1 && io::Error::last_os_error().raw_os_error() == Some(libc::EINVAL) {
            uffd = unsafe { libc::syscall(libc::SYS_userfaultfd, flags) };
        }
        if uffd == -1 {
            return Err(uffd_error("userfaultfd"));
        }
        let uffd = uffd as RawFd;

        let mut pipe_fds = [0 as RawFd; 2];
        if unsafe { libc::pipe2(pipe_fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) } == -1 {
            let err = uffd_error("pipe2");
            unsafe { libc::close(uffd) };
            return Err(err);
        }

        let backend = UffdPageBackend {
            uffd,
            pipe_read: pipe_fds[0],
            pipe_write: pipe_fds[1],
            page_size: unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) } as usize,
        };

        let mut api = UffdioApi {
            api: UFFD_API,
            features: 0,
            ioctls: 0,
        };
        backend.ioctl("UFFDIO_API", UFFDIO_API_IOCTL, &mut api)?;

        Ok(backend)
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn map_arena(&self, len: usize) -> Result<usize, VLMError> {
        let addr = unsafe {
            libc::mmap(
                null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(uffd_error("mmap"));
        }
        Ok(addr as usize)
    }

    fn unmap_arena(&self, addr: usize, len: usize) {
        let code = unsafe { libc::munmap(addr as *mut c_void, len) };
        if code != 0 {
            log::warn!("could not unmap arena at {:#x} ({} bytes)", addr, len);
        }
    }

    fn register_range(&self, addr: usize, len: usize) -> Result<(), VLMError> {
        let mut register = UffdioRegister {
            range: UffdioRange {
                start: addr as u64,
                len: len as u64,
            },
            mode: UFFDIO_REGISTER_MODE_MISSING,
            ioctls: 0,
        };
        self.ioctl("UFFDIO_REGISTER", UFFDIO_REGISTER_IOCTL, &mut register)
    }

    fn unregister_range(&self, addr: usize, len: usize) -> Result<(), VLMError> {
        let mut range = UffdioRange {
            start: addr as u64,
            len: len as u64,
        };
        self.ioctl("UFFDIO_UNREGISTER", UFFDIO_UNREGISTER_IOCTL, &mut range)
    }

    fn await_fault(&self, timeout_ms: i32) -> Result<FaultWait, VLMError> {
        let mut fds = [
            libc::pollfd {
                fd: self.uffd,
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: self.pipe_read,
                events: libc::POLLIN,
                revents: 0,
            },
        ];

        let ret = unsafe { libc::poll(fds.as_mut_ptr(), 2, timeout_ms) };
        if ret == -1 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(FaultWait::Timeout);
            }
            return Err(VLMError::KernelUserfault {
                op: "poll",
                source: err,
            });
        }
        if ret == 0 {
            return Ok(FaultWait::Timeout);
        }

        if fds[1].revents & libc::POLLIN != 0 {
            return Ok(FaultWait::Shutdown);
        }

        match self.read_event()? {
            Some(msg) if msg.event == UFFD_EVENT_PAGEFAULT => {
                // pagefault arg: [flags, address, ptid]
                let addr = msg.arg[1] as usize;
                trace!("page fault at {:#x}", addr);
                Ok(FaultWait::Fault { addr })
            }
            // fork/remap/... events are not armed, spurious wakeup otherwise
            _ => Ok(FaultWait::Timeout),
        }
    }

    fn signal_shutdown(&self) {
        let byte = 1u8;
        unsafe { libc::write(self.pipe_write, &byte as *const u8 as *const c_void, 1) };
    }

    fn install_pages(&self, dst: usize, src: &[u8]) -> Result<(), VLMError> {
        debug_assert!(src.len() % self.page_size == 0);
        debug_assert!(dst % self.page_size == 0);

        let mut done = 0usize;
        while done < src.len() {
            let mut copy = UffdioCopy {
                dst: (dst + done) as u64,
                src: src[done..].as_ptr() as u64,
                len: (src.len() - done) as u64,
                mode: 0,
                copy: 0,
            };
            let ret = unsafe {
                libc::ioctl(
                    self.uffd,
                    UFFDIO_COPY_IOCTL as libc::c_ulong,
                    &mut copy as *mut UffdioCopy,
                )
            };
            if ret != -1 {
                return Ok(());
            }

            match io::Error::last_os_error().raw_os_error() {
                // raced with an already-present page: everything up to the
                // collision was copied, waking the range covers the rest
                Some(libc::EEXIST) => {
                    return self.wake_range(dst + done, src.len() - done);
                }
                Some(libc::EAGAIN) => {
                    // partial progress is reported through `copy`
                    if copy.copy > 0 {
                        done += copy.copy as usize;
                    }
                }
                _ => return Err(uffd_error("UFFDIO_COPY")),
            }
        }
        Ok(())
    }

    fn install_zero_pages(&self, dst: usize, len: usize) -> Result<(), VLMError> {
        debug_assert!(len % self.page_size == 0);
        debug_assert!(dst % self.page_size == 0);

        let mut done = 0usize;
        while done < len {
            let mut zero = UffdioZeropage {
                range: UffdioRange {
                    start: (dst + done) as u64,
                    len: (len - done) as u64,
                },
                mode: 0,
                zeropage: 0,
            };
            let ret = unsafe {
                libc::ioctl(
                    self.uffd,
                    UFFDIO_ZEROPAGE_IOCTL as libc::c_ulong,
                    &mut zero as *mut UffdioZeropage,
                )
            };
            if ret != -1 {
                return Ok(());
            }

            match io::Error::last_os_error().raw_os_error() {
                Some(libc::EEXIST) => {
                    return self.wake_range(dst + done, len - done);
                }
                Some(libc::EAGAIN) => {
                    if zero.zeropage > 0 {
                        done += zero.zeropage as usize;
                    }
                }
                _ => return Err(uffd_error("UFFDIO_ZEROPAGE")),
            }
        }
        Ok(())
    }

    fn wake_range(&self, addr: usize, len: usize) -> Result<(), VLMError> {
        let mut range = UffdioRange {
            start: addr as u64,
            len: len as u64,
        };
        self.ioctl("UFFDIO_WAKE", UFFDIO_WAKE_IOCTL, &mut range)
    }

    fn drop_pages(&self, addr: usize, len: usize) -> Result<(), VLMError> {
        let ret = unsafe { libc::madvise(addr as *mut c_void, len, libc::MADV_DONTNEED) };
        if ret == -1 {
            return Err(uffd_error("madvise"));
        }
        Ok(())
    }
}

impl Drop for UffdPageBackend {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.uffd);
            libc::close(self.pipe_read);
            libc::close(self.pipe_write);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_ioctl_encoding_matches_kernel_headers() {
        // values from linux/userfaultfd.h on 64 bit
        assert_eq!(UFFDIO_API_IOCTL, 0xc018_aa3f);
        assert_eq!(UFFDIO_REGISTER_IOCTL, 0xc020_aa00);
        assert_eq!(UFFDIO_UNREGISTER_IOCTL, 0x8010_aa01);
        assert_eq!(UFFDIO_WAKE_IOCTL, 0x8010_aa02);
        assert_eq!(UFFDIO_COPY_IOCTL, 0xc028_aa03);
        assert_eq!(UFFDIO_ZEROPAGE_IOCTL, 0xc020_aa04);
    }

    #[test]
    fn test_map_register_install_drop_cycle() {
        let backend = match UffdPageBackend::new() {
            Ok(backend) => backend,
            // environments without userfaultfd (sysctl, seccomp) skip here
            Err(err) => {
                eprintln!("skipping uffd backend test: {}", err);
                return;
            }
        };
        let page_size = backend.page_size();

        let arena = backend.map_arena(4 * page_size).unwrap();
        backend.register_range(arena, 4 * page_size).unwrap();

        // install content into page 1 before anything touches it, then read
        // it back through plain memory access: no fault is raised because
        // the page is present
        let content = vec![0x5Au8; page_size];
        backend.install_pages(arena + page_size, &content).unwrap();
        let installed =
            unsafe { std::slice::from_raw_parts((arena + page_size) as *const u8, page_size) };
        assert!(installed.iter().all(|&b| b == 0x5A));

        // a second install on the same page degrades to a wake
        backend.install_pages(arena + page_size, &content).unwrap();

        backend.install_zero_pages(arena + 2 * page_size, page_size).unwrap();
        let zeroed =
            unsafe { std::slice::from_raw_parts((arena + 2 * page_size) as *const u8, page_size) };
        assert!(zeroed.iter().all(|&b| b == 0));

        backend.drop_pages(arena + page_size, page_size).unwrap();

        backend.unregister_range(arena, 4 * page_size).unwrap();
        backend.unmap_arena(arena, 4 * page_size);
    }

    #[test]
    fn test_shutdown_signal_unblocks_wait() {
        let backend = match UffdPageBackend::new() {
            Ok(backend) => backend,
            Err(err) => {
                eprintln!("skipping uffd backend test: {}", err);
                return;
            }
        };

        assert_eq!(backend.await_fault(0).unwrap(), FaultWait::Timeout);

        backend.signal_shutdown();
        assert_eq!(backend.await_fault(1000).unwrap(), FaultWait::Shutdown);
    }
}
