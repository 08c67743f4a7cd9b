// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmbus contributors
//
// shmbus: a shared-memory inter-process message bus. A process-crash-safe
// shared-memory allocator (`alloc`), lock-free SPSC ring channels and the
// shared channel table (`bus::channel`, `bus::channel_mgr`), the process-
// side client API (`bus::client`), and the router daemon's main loop
// (`bus::router`) that moves messages between local rings and across hosts
// over TCP, keeping a distributed busid-to-host directory in sync.

pub mod alloc;
pub mod bus;
pub mod cli;
pub mod config;
pub mod error;
pub mod hash;
pub mod pidfile;
pub mod shm_name;
pub mod signals;

mod spin_lock;
pub use spin_lock::SpinLock;

mod platform;

mod shm;
pub use shm::{ShmHandle, ShmOpenMode};

mod mutex;
pub use mutex::IpcMutex;

mod scoped_access;
pub use scoped_access::ScopedAccess;
