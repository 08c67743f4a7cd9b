// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmbus contributors
//
// Shared table of channel descriptors: one (read-ring, write-ring) pair per
// registered busid. Port of sk::detail::channel_mgr
// (src/bus/detail/channel_mgr.{h,cpp}).

use std::sync::atomic::{fence, Ordering};

use log::{info, warn};

use crate::bus::channel::{Channel, MAGIC as CHANNEL_MAGIC};
use crate::error::{BusError, BusResult};
use crate::spin_lock::SpinLock;

pub const MAX_DESCRIPTOR_COUNT: usize = 128;

/// One slot of the shared descriptor table. The read/write assignment is
/// from the *owner's* perspective: the owning process reads `r_offset`'s
/// ring and writes into `w_offset`'s ring; the router does the inverse.
#[repr(C)]
#[derive(Clone, Copy)]
struct ChannelDescriptor {
    owner_busid: i32,
    owner_pid: i32,
    r_offset: u64,
    w_offset: u64,
    closed: u32,
    _pad: u32,
}

impl ChannelDescriptor {
    const fn zeroed() -> Self {
        ChannelDescriptor { owner_busid: 0, owner_pid: 0, r_offset: 0, w_offset: 0, closed: 0, _pad: 0 }
    }
}

/// Fixed header of the shared channel-manager region. Descriptor array
/// follows immediately; ring storage for registered channels follows that,
/// bump-allocated via `used_size`.
#[repr(C)]
struct ManagerHeader {
    magic: u32,
    shmid: i32,
    shm_size: u64,
    used_size: u64,
    daemon_pid: i32,
    changed: u32,
    lock: SpinLock,
    descriptor_count: u32,
    descriptors: [ChannelDescriptor; MAX_DESCRIPTOR_COUNT],
}

/// A view over the channel manager's shared-memory region.
pub struct ChannelMgr {
    base: *mut u8,
}

unsafe impl Send for ChannelMgr {}
unsafe impl Sync for ChannelMgr {}

impl ChannelMgr {
    pub const HEADER_SIZE: usize = std::mem::size_of::<ManagerHeader>();

    /// Wrap an existing region.
    ///
    /// # Safety
    /// `base` must point to at least `shm_size` bytes of valid shared
    /// memory outliving the returned `ChannelMgr`.
    pub unsafe fn from_raw(base: *mut u8) -> Self {
        ChannelMgr { base }
    }

    fn header(&self) -> &ManagerHeader {
        unsafe { &*(self.base as *const ManagerHeader) }
    }

    #[allow(clippy::mut_from_ref)]
    fn header_mut(&self) -> &mut ManagerHeader {
        unsafe { &mut *(self.base as *mut ManagerHeader) }
    }

    /// `resume=false`: fresh init, capture current pid as `daemon_pid`.
    /// `resume=true`: validate `magic`/`shmid`/`shm_size`, overwrite
    /// `daemon_pid` (this process is the new router incarnation).
    pub fn init(&self, shmid: i32, shm_size: u64, resume: bool) -> BusResult<()> {
        let pid = current_pid();
        if resume {
            let h = self.header_mut();
            if h.magic != MAGIC {
                return Err(BusError::FatalInit("channel manager magic mismatch on resume".into()));
            }
            if h.shmid != shmid || h.shm_size != shm_size {
                return Err(BusError::FatalInit("channel manager shmid/shm_size mismatch on resume".into()));
            }
            h.daemon_pid = pid;
            return Ok(());
        }

        let h = self.header_mut();
        h.shmid = shmid;
        h.shm_size = shm_size;
        h.used_size = Self::HEADER_SIZE as u64;
        h.daemon_pid = pid;
        h.changed = 0;
        h.lock = SpinLock::new();
        h.descriptor_count = 0;
        for d in h.descriptors.iter_mut() {
            *d = ChannelDescriptor::zeroed();
        }

        // Full barrier so no other process observes a non-zero magic
        // before the rest of the struct is initialized.
        fence(Ordering::Release);
        h.magic = MAGIC;
        Ok(())
    }

    fn channel_at(&self, offset: u64) -> Channel {
        unsafe { Channel::from_raw(self.base.add(offset as usize)) }
    }

    pub fn report(&self) {
        let h = self.header();
        info!("===================================");
        for i in 0..h.descriptor_count as usize {
            let d = h.descriptors[i];
            let rc = self.channel_at(d.r_offset);
            let wc = self.channel_at(d.w_offset);
            info!(
                "channel<{:x}>, r<{}>, w<{}>, closed<{}>.",
                d.owner_busid,
                rc.message_count(),
                wc.message_count(),
                d.closed != 0
            );
        }
        info!("===================================");
    }

    /// Register (or idempotently re-register, or reopen) the channel pair
    /// owned by `busid`. Returns the descriptor index ("fd").
    pub fn register_channel(&self, busid: i32, pid: i32, node_size: u64, node_count: u64) -> BusResult<usize> {
        if self.header().magic != MAGIC {
            return Err(BusError::FatalInit("channel manager not initialized".into()));
        }
        if node_size & (node_size - 1) != 0 {
            return Err(BusError::FatalInit("node_size must be a power of two".into()));
        }

        let h = self.header_mut();
        h.lock.lock();
        let result = self.register_channel_locked(h, busid, pid, node_size, node_count);
        h.lock.unlock();
        result
    }

    fn register_channel_locked(
        &self,
        h: &mut ManagerHeader,
        busid: i32,
        pid: i32,
        node_size: u64,
        node_count: u64,
    ) -> BusResult<usize> {
        for i in 0..h.descriptor_count as usize {
            if h.descriptors[i].owner_busid != busid {
                continue;
            }

            if h.descriptors[i].closed == 0 {
                info!("channel already exists, bus<{:x}>.", busid);
                h.descriptors[i].owner_pid = pid;
                return Ok(i);
            }

            info!("channel<{:x}> closed, reopen it.", busid);
            let d = h.descriptors[i];
            let rc = self.channel_at(d.r_offset);
            let wc = self.channel_at(d.w_offset);
            rc.clear()?;
            wc.clear()?;

            if rc.node_size() != node_size || rc.node_count() != node_count {
                warn!(
                    "configuration change<{}:{} -> {}:{}> is not supported.",
                    rc.node_size(),
                    rc.node_count(),
                    node_size,
                    node_count
                );
            }

            notify_channel_change(h.daemon_pid, i as i32);
            h.descriptors[i].closed = 0;
            h.descriptors[i].owner_pid = pid;
            h.changed = 1;
            return Ok(i);
        }

        let channel_size = Channel::calc_space(node_size, node_count);
        let left_size = h.shm_size.saturating_sub(h.used_size);
        if left_size < channel_size * 2 {
            return Err(BusError::OutOfMemory);
        }

        let fd = h.descriptor_count as usize;
        let r_offset = h.used_size;
        h.used_size += channel_size;
        let w_offset = h.used_size;
        h.used_size += channel_size;

        h.descriptors[fd] = ChannelDescriptor {
            owner_busid: busid,
            owner_pid: pid,
            r_offset,
            w_offset,
            closed: 0,
            _pad: 0,
        };
        h.descriptor_count += 1;

        self.channel_at(r_offset).init(node_size, node_count)?;
        self.channel_at(w_offset).init(node_size, node_count)?;

        notify_channel_change(h.daemon_pid, fd as i32);
        h.changed = 1;
        info!("new channel, fd<{}>, owner<{:x}>, read offset<{}>, write offset<{}>.", fd, busid, r_offset, w_offset);
        Ok(fd)
    }

    pub fn deregister_channel(&self, busid: i32) {
        let h = self.header_mut();
        h.lock.lock();
        for i in 0..h.descriptor_count as usize {
            if h.descriptors[i].owner_busid != busid {
                continue;
            }
            if h.descriptors[i].closed != 0 {
                warn!("channel<{:x}> has already been closed.", busid);
                break;
            }
            h.descriptors[i].closed = 1;
            h.descriptors[i].owner_pid = 0;
            h.changed = 1;
            notify_channel_change(h.daemon_pid, i as i32);
            info!("channel<{:x}> gets closed.", busid);
            break;
        }
        h.lock.unlock();
    }

    pub fn get_read_channel(&self, fd: usize) -> BusResult<Channel> {
        let h = self.header();
        if fd >= h.descriptor_count as usize {
            return Err(BusError::FatalInit("descriptor index out of range".into()));
        }
        let d = h.descriptors[fd];
        if d.closed != 0 {
            return Err(BusError::RouteUnknown);
        }
        Ok(self.channel_at(d.r_offset))
    }

    pub fn get_write_channel(&self, fd: usize) -> BusResult<Channel> {
        let h = self.header();
        if fd >= h.descriptor_count as usize {
            return Err(BusError::FatalInit("descriptor index out of range".into()));
        }
        let d = h.descriptors[fd];
        if d.closed != 0 {
            return Err(BusError::RouteUnknown);
        }
        Ok(self.channel_at(d.w_offset))
    }

    pub fn get_owner_busid(&self, fd: usize) -> Option<i32> {
        let h = self.header();
        if fd >= h.descriptor_count as usize {
            return None;
        }
        Some(h.descriptors[fd].owner_busid)
    }

    pub fn find_read_channel(&self, busid: i32) -> Option<(usize, Channel)> {
        let h = self.header();
        for i in 0..h.descriptor_count as usize {
            if h.descriptors[i].owner_busid == busid {
                return self.get_read_channel(i).ok().map(|c| (i, c));
            }
        }
        None
    }

    pub fn descriptor_count(&self) -> usize {
        self.header().descriptor_count as usize
    }

    /// Pid of the router process currently owning this segment.
    pub fn daemon_pid(&self) -> i32 {
        self.header().daemon_pid
    }

    pub fn is_closed(&self, fd: usize) -> bool {
        self.header().descriptors[fd].closed != 0
    }

    /// Take and clear the "something changed" flag.
    pub fn take_changed(&self) -> bool {
        let h = self.header_mut();
        let was = h.changed != 0;
        h.changed = 0;
        was
    }
}

pub const MAGIC: u32 = CHANNEL_MAGIC;

fn current_pid() -> i32 {
    #[cfg(unix)]
    {
        unsafe { libc::getpid() }
    }
    #[cfg(not(unix))]
    {
        1
    }
}

/// Advisory wake-up: signal the router that a descriptor changed. Purely a
/// nudge — the router's round-robin sweep discovers the change either way.
fn notify_channel_change(daemon_pid: i32, fd: i32) {
    #[cfg(unix)]
    {
        if daemon_pid <= 0 {
            return;
        }
        unsafe {
            let mut value: libc::sigval = std::mem::zeroed();
            value.sival_int = fd;
            libc::sigqueue(daemon_pid, crate::bus::registration_signo(), value);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (daemon_pid, fd);
    }
}
