// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmbus contributors
//
// Process-side API: the library surface a sender process links against to
// talk to the bus without going through the router's TCP path. Port of the
// `sk::bus` facade used by client code in the original (src/bus/bus.cpp).

use std::thread;
use std::time::Duration;

use log::warn;

use crate::bus::channel_mgr::ChannelMgr;
use crate::bus::outgoing_signo;
use crate::error::{BusError, BusResult};
use crate::shm::{ShmHandle, ShmOpenMode};

const SEND_RETRIES: u32 = 3;
const SEND_RETRY_DELAY: Duration = Duration::from_millis(1);

/// A process's attachment to the bus: its own (read, write) descriptor in
/// the shared channel-manager segment, plus the router's pid to signal.
pub struct BusClient {
    _shm: ShmHandle,
    mgr: ChannelMgr,
    fd: usize,
    busid: i32,
}

impl BusClient {
    /// Attach to the channel-manager segment at `shm_path` (already created
    /// by the router, `shm_size` bytes as configured in its `bus_shm_size`)
    /// and register (or re-register/reopen) this process's ring pair.
    pub fn register_bus(
        shm_path: &str,
        shm_size: usize,
        busid: i32,
        node_size: u64,
        node_count: u64,
    ) -> BusResult<Self> {
        let shm = ShmHandle::acquire(shm_path, shm_size, ShmOpenMode::Open)
            .map_err(|e| BusError::FatalInit(format!("attach to {shm_path}: {e}")))?;
        let mgr = unsafe { ChannelMgr::from_raw(shm.as_mut_ptr()) };
        let pid = current_pid();
        let fd = mgr.register_channel(busid, pid, node_size, node_count)?;
        Ok(BusClient { _shm: shm, mgr, fd, busid })
    }

    pub fn fd(&self) -> usize {
        self.fd
    }

    /// Push `data` addressed to `dst_busid` into this process's write-ring.
    /// Retries up to `SEND_RETRIES` times on `OutOfMemory` (ring momentarily
    /// full), then gives up and returns the error — matching the original's
    /// "three local retries, then the caller's problem" contract.
    pub fn send(&self, dst_busid: i32, data: &[u8]) -> BusResult<()> {
        let channel = self.mgr.get_write_channel(self.fd)?;
        let ctime_ns = now_ns();

        let mut attempt = 0;
        loop {
            match channel.push(self.busid, dst_busid, ctime_ns, data) {
                Ok(()) => {
                    self.signal_router(outgoing_signo());
                    return Ok(());
                }
                Err(BusError::OutOfMemory) if attempt < SEND_RETRIES => {
                    attempt += 1;
                    thread::sleep(SEND_RETRY_DELAY);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Pop the next message from this process's read-ring into `out`.
    /// Returns `Ok(None)` if empty, the record on success, or
    /// `Err(BufferTooSmall{required})` without consuming the record.
    pub fn recv(&self, out: &mut [u8]) -> BusResult<Option<(usize, i32)>> {
        let channel = self.mgr.get_read_channel(self.fd)?;
        match channel.pop(out)? {
            Some((len, src_busid, _dst_busid, _ctime_ns)) => Ok(Some((len, src_busid))),
            None => Ok(None),
        }
    }

    /// Mark this descriptor closed and notify the router.
    pub fn deregister_bus(self) {
        self.mgr.deregister_channel(self.busid);
    }

    fn signal_router(&self, signo: i32) {
        let Some(daemon_pid) = self.daemon_pid() else { return };
        #[cfg(unix)]
        unsafe {
            if libc::kill(daemon_pid, signo) != 0 {
                warn!("failed to signal router pid {daemon_pid} with signal {signo}");
            }
        }
        #[cfg(not(unix))]
        {
            let _ = (daemon_pid, signo);
        }
    }

    fn daemon_pid(&self) -> Option<i32> {
        let pid = self.mgr.daemon_pid();
        if pid > 0 {
            Some(pid)
        } else {
            None
        }
    }
}

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

fn now_ns() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos() as u64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::channel_mgr::ChannelMgr as RawMgr;

    fn make_segment(shm_size: u64) -> Vec<u8> {
        let mut buf = vec![0u8; shm_size as usize];
        let mgr = unsafe { RawMgr::from_raw(buf.as_mut_ptr()) };
        mgr.init(1, shm_size, false).unwrap();
        buf
    }

    #[test]
    fn send_then_recv_roundtrips_via_raw_mgr() {
        let mut buf = make_segment(1 << 20);
        let mgr = unsafe { RawMgr::from_raw(buf.as_mut_ptr()) };
        let fd = mgr.register_channel(0x01010110, 100, 64, 8).unwrap();

        // A real BusClient wraps an acquired ShmHandle; here we exercise
        // the same channel-level push/pop path client.rs drives.
        let wc = mgr.get_write_channel(fd).unwrap();
        wc.push(0x01010110, 0x01010120, 0, b"ping").unwrap();

        let rc = mgr.get_write_channel(fd).unwrap();
        let mut out = [0u8; 64];
        let (len, src, dst, _ctime) = rc.pop(&mut out).unwrap().unwrap();
        assert_eq!(&out[..len], b"ping");
        assert_eq!((src, dst), (0x01010110, 0x01010120));
    }
}
