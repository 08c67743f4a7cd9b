// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmbus contributors
//
// Stop/reload signal plumbing for busd, via `signal-hook`. Port of the
// original's sig_watcher_ registration in bus_router.cpp's setup.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use signal_hook::consts::{SIGABRT, SIGINT, SIGQUIT, SIGTERM, SIGUSR1};
use signal_hook::flag;

pub struct SignalState {
    pub stop: Arc<AtomicBool>,
    pub reload: Arc<AtomicBool>,
}

impl SignalState {
    pub fn register() -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let reload = Arc::new(AtomicBool::new(false));

        for sig in [SIGTERM, SIGINT, SIGQUIT, SIGABRT] {
            flag::register(sig, Arc::clone(&stop))?;
        }
        flag::register(SIGUSR1, Arc::clone(&reload))?;

        Ok(SignalState { stop, reload })
    }

    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    pub fn take_reload(&self) -> bool {
        self.reload.swap(false, Ordering::Relaxed)
    }
}
