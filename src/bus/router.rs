// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmbus contributors
//
// The busd daemon's main loop: report/update_route/run_agent/fetch_msg/
// process_msg, exactly the five phases of bus_router.cpp's per-iteration
// work. Single-threaded, cooperative, non-blocking throughout — see
// SPEC_FULL.md's concurrency section.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::{Duration, Instant};

use log::{error, info, warn};
use mio::net::TcpListener as MioListener;
use mio::{Events, Interest, Poll, Token};

use crate::bus::channel_mgr::ChannelMgr;
use crate::bus::directory::{bus_key, Directory};
use crate::bus::wire::WireMessage;
use crate::error::BusError;

const LISTENER_TOKEN: Token = Token(0);
const INITIAL_SCRATCH_CAPACITY: usize = 2 * 1024 * 1024;
const FAST_UPDATE_INTERVAL: Duration = Duration::from_secs(1);
const SLOW_UPDATE_INTERVAL: Duration = Duration::from_secs(10);
const FAST_UPDATE_ROUNDS: u64 = 60;

/// Everything the router needs to run one iteration. Owns the channel
/// manager's shared memory, the local directory cache, the listening
/// socket, and per-host outbound connections.
pub struct Router {
    mgr: ChannelMgr,
    directory: Box<dyn Directory>,
    local_host: String,
    listen_addr: SocketAddr,

    poll: Poll,
    listener: MioListener,
    peers: HashMap<String, TcpStream>,
    route_table: HashMap<i32, String>,
    local_procs: std::collections::HashSet<i32>,

    scratch: Vec<u8>,
    inbound: Vec<u8>,

    report_interval: u64,
    msg_per_run: u64,
    iteration: u64,
    updates_done: u64,
    last_update: Instant,
}

impl Router {
    pub fn new(
        mgr: ChannelMgr,
        directory: Box<dyn Directory>,
        local_host: String,
        listen_port: u16,
        report_interval: u64,
        msg_per_run: u64,
    ) -> std::io::Result<Self> {
        let listen_addr: SocketAddr = format!("0.0.0.0:{listen_port}").parse().unwrap();
        let std_listener = TcpListener::bind(listen_addr)?;
        std_listener.set_nonblocking(true)?;
        let mut listener = MioListener::from_std(std_listener);

        let poll = Poll::new()?;
        poll.registry().register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        Ok(Router {
            mgr,
            directory,
            local_host,
            listen_addr,
            poll,
            listener,
            peers: HashMap::new(),
            route_table: HashMap::new(),
            local_procs: std::collections::HashSet::new(),
            scratch: vec![0u8; INITIAL_SCRATCH_CAPACITY],
            inbound: Vec::new(),
            report_interval,
            msg_per_run,
            iteration: 0,
            updates_done: 0,
            last_update: Instant::now() - SLOW_UPDATE_INTERVAL,
        })
    }

    /// Run one iteration of the five phases. Called in a loop by `bin/busd`
    /// until a stop signal is observed.
    pub fn tick(&mut self) {
        self.iteration += 1;
        if self.report_interval > 0 && self.iteration % self.report_interval == 0 {
            self.report();
        }
        self.update_route();
        self.run_agent();
        self.fetch_msg();
        self.process_msg();
    }

    fn report(&self) {
        self.mgr.report();
    }

    /// update_route(): publish/retract this host's descriptors in the KV
    /// store when the descriptor table changed, or on the pacing interval
    /// (1s for the first 60 updates after start, then 10s), then refresh the
    /// full directory from `KV.get_all("bus/")`.
    fn update_route(&mut self) {
        let interval = if self.updates_done < FAST_UPDATE_ROUNDS { FAST_UPDATE_INTERVAL } else { SLOW_UPDATE_INTERVAL };
        let due = self.last_update.elapsed() >= interval;
        if !self.mgr.take_changed() && !due {
            return;
        }

        for fd in 0..self.mgr.descriptor_count() {
            let Some(busid) = self.mgr.get_owner_busid(fd) else { continue };
            let open = !self.mgr.is_closed(fd);
            let known_local = self.local_procs.contains(&busid);
            if open && !known_local {
                if let Err(e) = self.directory.set(&bus_key(busid), &self.local_host) {
                    warn!("directory publish failed for busid {busid:x}: {e}");
                } else {
                    self.local_procs.insert(busid);
                }
            } else if !open && known_local {
                if let Err(e) = self.directory.del(&bus_key(busid), false) {
                    warn!("directory retract failed for busid {busid:x}: {e}");
                }
                self.local_procs.remove(&busid);
            }
        }

        match self.directory.get_all("bus/") {
            Ok(entries) => {
                self.route_table.clear();
                for (key, host) in entries {
                    if let Some(id_str) = key.strip_prefix("bus/") {
                        if let Ok(busid) = u32::from_str_radix(id_str, 16) {
                            self.route_table.insert(busid as i32, host);
                        }
                    }
                }
            }
            Err(e) => warn!("directory refresh failed: {e}"),
        }

        self.updates_done += 1;
        self.last_update = Instant::now();
    }

    /// run_agent(): the `ureq`-based directory client has no async handles
    /// to drive (unlike the original's libcurl multi-interface) — each KV
    /// call in `update_route` already runs to completion inline. Kept as an
    /// explicit phase to mirror the five-phase loop structure.
    fn run_agent(&mut self) {}

    /// fetch_msg(): non-blocking read of at most one inbound TCP message.
    fn fetch_msg(&mut self) {
        let mut events = Events::with_capacity(16);
        if self.poll.poll(&mut events, Some(Duration::from_millis(0))).is_err() {
            return;
        }

        for event in events.iter() {
            if event.token() == LISTENER_TOKEN {
                while let Ok((mut stream, addr)) = self.listener.accept() {
                    info!("accepted inbound connection from {addr}");
                    let mut buf = [0u8; 65536];
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => continue,
                        Ok(n) => self.inbound.extend_from_slice(&buf[..n]),
                    }
                }
            }
        }

        let Some((msg, consumed)) = (match WireMessage::decode(&self.inbound) {
            Ok(v) => v,
            Err(e) => {
                error!("bad inbound frame, dropping buffered bytes: {e}");
                self.inbound.clear();
                return;
            }
        }) else {
            return;
        };
        self.inbound.drain(..consumed);

        match self.mgr.find_read_channel(msg.dst_busid) {
            Some((_fd, channel)) => {
                if let Err(e) = channel.push(msg.src_busid, msg.dst_busid, now_ns(), &msg.payload) {
                    warn!("push of inbound message for busid {:x} failed: {e}", msg.dst_busid);
                }
            }
            None => warn!("inbound message for unknown local busid {:x}, dropping", msg.dst_busid),
        }
    }

    /// process_msg(): round-robin drain of local write-rings, up to
    /// `msg_per_run` records, dispatching each by destination.
    fn process_msg(&mut self) {
        let count = self.mgr.descriptor_count();
        if count == 0 {
            return;
        }

        let mut drained = 0u64;
        let mut empty_since_progress = 0usize;
        let mut fd = 0usize;

        while drained < self.msg_per_run && empty_since_progress < count {
            if self.mgr.is_closed(fd) {
                fd = (fd + 1) % count;
                empty_since_progress += 1;
                continue;
            }

            let popped = match self.mgr.get_write_channel(fd) {
                Ok(channel) => self.pop_with_growth(&channel),
                Err(_) => None,
            };

            match popped {
                Some((len, src_busid, dst_busid, _ctime_ns)) => {
                    self.dispatch(src_busid, dst_busid, len);
                    drained += 1;
                    empty_since_progress = 0;
                }
                None => {
                    empty_since_progress += 1;
                }
            }

            fd = (fd + 1) % count;
        }
    }

    fn pop_with_growth(&mut self, channel: &crate::bus::Channel) -> Option<(usize, i32, i32, u64)> {
        match channel.pop(&mut self.scratch) {
            Ok(result) => result,
            Err(BusError::BufferTooSmall { required }) => {
                self.scratch.resize(required, 0);
                channel.pop(&mut self.scratch).ok().flatten()
            }
            Err(e) => {
                warn!("pop failed: {e}");
                None
            }
        }
    }

    fn dispatch(&mut self, src_busid: i32, dst_busid: i32, len: usize) {
        if let Some((_fd, channel)) = self.mgr.find_read_channel(dst_busid) {
            if let Err(e) = channel.push(src_busid, dst_busid, now_ns(), &self.scratch[..len]) {
                warn!("local dispatch to busid {dst_busid:x} failed: {e}");
            }
            return;
        }

        match self.route_table.get(&dst_busid).cloned() {
            Some(host) if host == self.local_host => {
                warn!("directory says busid {dst_busid:x} is local but no channel is registered; dropping");
            }
            Some(host) => self.send_remote(&host, src_busid, dst_busid, len),
            None => warn!("busid {dst_busid:x} not in directory, dropping message"),
        }
    }

    fn send_remote(&mut self, host: &str, src_busid: i32, dst_busid: i32, len: usize) {
        let msg = WireMessage { src_busid, dst_busid, payload: self.scratch[..len].to_vec() };
        let frame = msg.encode();

        if self.write_to_peer(host, &frame) {
            return;
        }
        // The receiver accepts one connection per message and closes it
        // once read, so a cached stream from a prior send is routinely
        // already dead; write_to_peer evicted it above, so this dials
        // fresh before giving up.
        if !self.write_to_peer(host, &frame) {
            warn!("send to {host} dropped after reconnect");
        }
    }

    /// Writes one frame to `host`'s cached (or freshly dialed) connection.
    /// A hard write error evicts the cached connection so the next call
    /// dials a new one; a `WouldBlock` gets one same-connection retry per
    /// spec.md's EAGAIN policy and does not evict.
    fn write_to_peer(&mut self, host: &str, frame: &[u8]) -> bool {
        let stream = match self.fetch_socket(host) {
            Ok(s) => s,
            Err(e) => {
                warn!("cannot reach router at {host}: {e}");
                return false;
            }
        };

        match stream.write_all(frame) {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::yield_now();
                match stream.write_all(frame) {
                    Ok(()) => true,
                    Err(e2) => {
                        warn!("send to {host} dropped after EAGAIN retry: {e2}");
                        false
                    }
                }
            }
            Err(e) => {
                warn!("connection to {host} broken ({e}), evicting cached socket");
                self.peers.remove(host);
                false
            }
        }
    }

    fn fetch_socket(&mut self, host: &str) -> std::io::Result<&mut TcpStream> {
        if !self.peers.contains_key(host) {
            let addr: SocketAddr = if host.contains(':') { host.parse() } else { format!("{host}:{}", self.listen_addr.port()).parse() }
                .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad host address"))?;
            let stream = TcpStream::connect(addr)?;
            stream.set_nonblocking(true)?;
            self.peers.insert(host.to_string(), stream);
        }
        Ok(self.peers.get_mut(host).unwrap())
    }
}

fn now_ns() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos() as u64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::directory::Directory;
    use std::collections::HashMap as Map;
    use std::sync::Mutex;

    struct FakeDirectory(Mutex<Map<String, String>>);

    impl Directory for FakeDirectory {
        fn set(&self, key: &str, value: &str) -> crate::error::BusResult<()> {
            self.0.lock().unwrap().insert(key.to_string(), value.to_string());
            Ok(())
        }
        fn del(&self, key: &str, _recursive: bool) -> crate::error::BusResult<()> {
            self.0.lock().unwrap().remove(key);
            Ok(())
        }
        fn get_all(&self, prefix: &str) -> crate::error::BusResult<Map<String, String>> {
            Ok(self.0.lock().unwrap().iter().filter(|(k, _)| k.starts_with(prefix)).map(|(k, v)| (k.clone(), v.clone())).collect())
        }
    }

    fn make_router(port: u16) -> (Vec<u8>, Router) {
        let shm_size = 1 << 20;
        let mut buf = vec![0u8; shm_size];
        let mgr = unsafe { ChannelMgr::from_raw(buf.as_mut_ptr()) };
        mgr.init(1, shm_size as u64, false).unwrap();
        let dir = Box::new(FakeDirectory(Mutex::new(Map::new())));
        let router = Router::new(mgr, dir, "127.0.0.1".into(), port, 1000, 200).unwrap();
        (buf, router)
    }

    #[test]
    fn update_route_publishes_new_local_descriptor() {
        let (mut buf, mut router) = make_router(0);
        let mgr = unsafe { ChannelMgr::from_raw(buf.as_mut_ptr()) };
        mgr.register_channel(0x01010110, 100, 64, 8).unwrap();
        router.mgr = mgr;
        router.update_route();
        assert!(router.local_procs.contains(&0x01010110));
    }

    #[test]
    fn process_msg_dispatches_local_to_local() {
        let (mut buf, mut router) = make_router(0);
        let mgr = unsafe { ChannelMgr::from_raw(buf.as_mut_ptr()) };
        let sender_fd = mgr.register_channel(0x01010110, 100, 64, 8).unwrap();
        let receiver_fd = mgr.register_channel(0x01010120, 200, 64, 8).unwrap();
        mgr.get_write_channel(sender_fd).unwrap().push(0x01010110, 0x01010120, 0, b"hi").unwrap();
        router.mgr = mgr;

        router.process_msg();

        let mgr2 = unsafe { ChannelMgr::from_raw(buf.as_mut_ptr()) };
        let rc = mgr2.get_read_channel(receiver_fd).unwrap();
        let mut out = [0u8; 64];
        let (len, ..) = rc.pop(&mut out).unwrap().unwrap();
        assert_eq!(&out[..len], b"hi");
    }
}
