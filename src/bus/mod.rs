// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmbus contributors
//
// The bus: process identity, SPSC ring channels, the shared channel table,
// wire framing between routers, the directory client, and the router's main
// loop. Port of src/bus/ and bus/ from the original sources.

pub mod busid;
pub mod channel;
pub mod channel_mgr;
pub mod client;
pub mod directory;
pub mod router;
pub mod wire;

pub use busid::BusId;
pub use channel::Channel;
pub use channel_mgr::ChannelMgr;

/// Advisory signal sent by a process to the router on (de)registration.
/// Real-time signal on Linux (room for a second, distinct advisory signal);
/// SIGUSR2 elsewhere, where only one portable custom signal is available.
#[cfg(target_os = "linux")]
pub fn registration_signo() -> i32 {
    unsafe { libc::SIGRTMIN() }
}
#[cfg(not(target_os = "linux"))]
pub fn registration_signo() -> i32 {
    libc::SIGUSR2
}

/// Advisory signal sent by a process after pushing into its write-ring.
/// Purely a wake hint — the router's sweep finds the message regardless.
#[cfg(target_os = "linux")]
pub fn outgoing_signo() -> i32 {
    unsafe { libc::SIGRTMIN() + 1 }
}
#[cfg(not(target_os = "linux"))]
pub fn outgoing_signo() -> i32 {
    libc::SIGUSR2
}
