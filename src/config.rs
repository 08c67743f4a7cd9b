// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmbus contributors
//
// busd's configuration file: TOML via serde, fields exactly as spec.md §6
// names them. Port of bus_config.h.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::{BusError, BusResult};

fn default_msg_per_run() -> u64 {
    200
}

fn default_report_interval() -> u64 {
    100
}

#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    pub bus_shm_key: String,
    #[serde(default = "default_msg_per_run")]
    pub msg_per_run: u64,
    pub listen_port: u16,
    pub shm_size: u64,
    pub bus_shm_size: u64,
    #[serde(default = "default_report_interval")]
    pub report_interval: u64,
    pub consul_addr_list: Vec<String>,
}

impl BusConfig {
    pub fn load(path: &Path) -> BusResult<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| BusError::FatalInit(format!("reading config {}: {e}", path.display())))?;
        toml::from_str(&text).map_err(|e| BusError::FatalInit(format!("parsing config {}: {e}", path.display())))
    }
}
