// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmbus contributors
//
// Owns the two mmap-backed files that form the shared address space.
// Port of shm_mgr.cpp's block handling; mmap/shm_open plumbing follows
// platform/posix.rs's PlatformShm, which speaks the same syscalls.

use std::ffi::CString;
use std::io;

use crate::alloc::address::{ShmAddress, METADATA_SERIAL, USERDATA_SERIAL};
use crate::alloc::size_class::PAGE_SIZE;

pub const METADATA_BLOCK: u8 = 0;
pub const USERDATA_BLOCK: u8 = 1;

/// Pages requested from the OS at a time when `sbrk` needs more room.
/// spec.md's "configurable increment" — see SPEC_FULL.md 4.D.1.
const GROWTH_INCREMENT_PAGES: u64 = 64;

fn page_align(n: u64) -> u64 {
    n.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

struct Block {
    fd: libc::c_int,
    posix_name: CString,
    mem: *mut u8,
    real_size: u64,
    mmap_size: u64,
    used_size: u64,
}

unsafe impl Send for Block {}

impl Block {
    fn create(posix_name: CString, initial_size: u64, reserve_size: u64) -> io::Result<Self> {
        let real_size = page_align(initial_size.max(1));
        let mmap_size = page_align(reserve_size.max(real_size));

        let fd = unsafe {
            libc::shm_open(posix_name.as_ptr(), libc::O_RDWR | libc::O_CREAT | libc::O_EXCL, 0o666)
        };
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }
        unsafe { libc::fchmod(fd, 0o666) };
        if unsafe { libc::ftruncate(fd, real_size as libc::off_t) } != 0 {
            let e = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(e);
        }

        let mem = unsafe {
            libc::mmap(std::ptr::null_mut(), mmap_size as usize, libc::PROT_READ | libc::PROT_WRITE, libc::MAP_SHARED, fd, 0)
        };
        if mem == libc::MAP_FAILED {
            let e = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(e);
        }

        Ok(Block { fd, posix_name, mem: mem as *mut u8, real_size, mmap_size, used_size: 0 })
    }

    fn attach(posix_name: CString, reserve_size: u64) -> io::Result<Self> {
        let fd = unsafe { libc::shm_open(posix_name.as_ptr(), libc::O_RDWR, 0o666) };
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }

        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut stat) } != 0 {
            let e = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(e);
        }
        let real_size = stat.st_size as u64;
        let mmap_size = page_align(reserve_size.max(real_size));

        let mem = unsafe {
            libc::mmap(std::ptr::null_mut(), mmap_size as usize, libc::PROT_READ | libc::PROT_WRITE, libc::MAP_SHARED, fd, 0)
        };
        if mem == libc::MAP_FAILED {
            let e = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(e);
        }

        Ok(Block { fd, posix_name, mem: mem as *mut u8, real_size, mmap_size, used_size: real_size })
    }

    fn resize(&mut self, new_size: u64) -> io::Result<()> {
        let new_size = page_align(new_size);
        if new_size > self.mmap_size {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "new_size exceeds mmap reservation"));
        }
        if new_size <= self.real_size {
            return Ok(());
        }
        if unsafe { libc::ftruncate(self.fd, new_size as libc::off_t) } != 0 {
            return Err(io::Error::last_os_error());
        }
        self.real_size = new_size;
        Ok(())
    }

    fn unlink(&self) {
        unsafe {
            libc::munmap(self.mem as *mut libc::c_void, self.mmap_size as usize);
            libc::close(self.fd);
            libc::shm_unlink(self.posix_name.as_ptr());
        }
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.mem as *mut libc::c_void, self.mmap_size as usize);
            libc::close(self.fd);
        }
    }
}

/// Owns the METADATA and USERDATA mmap-backed blocks. `serial` 1 and 2
/// (`METADATA_SERIAL`/`USERDATA_SERIAL`) address them directly.
pub struct BlockManager {
    metadata: Block,
    userdata: Block,
}

impl BlockManager {
    pub fn create(basename: &str, metadata_initial: u64, metadata_reserve: u64, userdata_initial: u64, userdata_reserve: u64) -> io::Result<Self> {
        let metadata = Block::create(block_posix_name(basename, "metadata")?, metadata_initial, metadata_reserve)?;
        let userdata = Block::create(block_posix_name(basename, "userdata")?, userdata_initial, userdata_reserve)?;
        Ok(BlockManager { metadata, userdata })
    }

    pub fn attach(basename: &str, metadata_reserve: u64, userdata_reserve: u64) -> io::Result<Self> {
        let metadata = Block::attach(block_posix_name(basename, "metadata")?, metadata_reserve)?;
        let userdata = Block::attach(block_posix_name(basename, "userdata")?, userdata_reserve)?;
        Ok(BlockManager { metadata, userdata })
    }

    fn block_mut(&mut self, block: u8) -> &mut Block {
        match block {
            METADATA_BLOCK => &mut self.metadata,
            USERDATA_BLOCK => &mut self.userdata,
            _ => panic!("unknown block id {block}"),
        }
    }

    fn block(&self, block: u8) -> &Block {
        match block {
            METADATA_BLOCK => &self.metadata,
            USERDATA_BLOCK => &self.userdata,
            _ => panic!("unknown block id {block}"),
        }
    }

    pub fn base_ptr(&self, block: u8) -> *mut u8 {
        self.block(block).mem
    }

    pub fn used_size(&self, block: u8) -> u64 {
        self.block(block).used_size
    }

    pub fn real_size(&self, block: u8) -> u64 {
        self.block(block).real_size
    }

    /// Bump-allocate `bytes` from `block`, growing the backing file by
    /// `GROWTH_INCREMENT_PAGES`-page increments until the request fits.
    pub fn sbrk(&mut self, block: u8, bytes: u64) -> io::Result<ShmAddress> {
        let b = self.block_mut(block);
        let old_used = b.used_size;
        let new_used = old_used + bytes;

        if new_used > b.real_size {
            let mut grown = b.real_size;
            let increment = GROWTH_INCREMENT_PAGES * PAGE_SIZE;
            while grown < new_used {
                grown += increment;
            }
            b.resize(grown)?;
        }

        b.used_size = new_used;
        let serial = if block == METADATA_BLOCK { METADATA_SERIAL } else { USERDATA_SERIAL };
        Ok(ShmAddress::new(serial, old_used))
    }

    pub fn resolve(&self, block: u8, offset: u64) -> *mut u8 {
        unsafe { self.block(block).mem.add(offset as usize) }
    }

    pub fn unlink(&self) {
        self.metadata.unlink();
        self.userdata.unlink();
    }
}

fn block_posix_name(basename: &str, suffix: &str) -> io::Result<CString> {
    let name = crate::shm_name::make_shm_name(&format!("{basename}.{suffix}"));
    CString::new(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}
