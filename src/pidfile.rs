// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmbus contributors
//
// Write-pid-at-start, remove-at-clean-exit PID file handling for the
// `--pid-file` flag named in spec.md §6.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{BusError, BusResult};

pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn create(path: &Path) -> BusResult<Self> {
        let pid = current_pid();
        fs::write(path, pid.to_string())
            .map_err(|e| BusError::FatalInit(format!("writing pid file {}: {e}", path.display())))?;
        Ok(PidFile { path: path.to_path_buf() })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn current_pid() -> i32 {
    #[cfg(unix)]
    {
        unsafe { libc::getpid() }
    }
    #[cfg(not(unix))]
    {
        std::process::id() as i32
    }
}
