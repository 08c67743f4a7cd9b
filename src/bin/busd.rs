// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmbus contributors
//
// The bus router daemon. Port of bus_router.cpp's main(): parse CLI/config,
// bring up (or resume) the channel-manager segment and the listen socket,
// then run the five-phase loop until a stop signal arrives.

use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use clap::Parser;
use log::{error, info};

use shmbus::bus::channel_mgr::ChannelMgr;
use shmbus::bus::directory::HttpDirectory;
use shmbus::bus::router::Router;
use shmbus::bus::BusId;
use shmbus::cli::Cli;
use shmbus::config::BusConfig;
use shmbus::pidfile::PidFile;
use shmbus::signals::SignalState;
use shmbus::{ShmHandle, ShmOpenMode};

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let busid: BusId = match cli.id.parse() {
        Ok(id) => id,
        Err(e) => {
            error!("invalid --id {:?}: {e}", cli.id);
            return ExitCode::FAILURE;
        }
    };

    let config = match BusConfig::load(&cli.proc_conf) {
        Ok(c) => c,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let _pidfile = match cli.pid_file.as_deref().map(PidFile::create).transpose() {
        Ok(pf) => pf,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let signals = match SignalState::register() {
        Ok(s) => s,
        Err(e) => {
            error!("failed to register signal handlers: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mode = if cli.resume { ShmOpenMode::Open } else { ShmOpenMode::Create };
    let shm = match ShmHandle::acquire(&config.bus_shm_key, config.bus_shm_size as usize, mode) {
        Ok(shm) => shm,
        Err(e) => {
            error!("failed to {} channel manager segment {}: {e}", if cli.resume { "attach" } else { "create" }, config.bus_shm_key);
            return ExitCode::FAILURE;
        }
    };

    let mgr = unsafe { ChannelMgr::from_raw(shm.as_mut_ptr()) };
    if let Err(e) = mgr.init(1, config.bus_shm_size, cli.resume) {
        error!("channel manager init failed: {e}");
        return ExitCode::FAILURE;
    }

    info!("busd starting, id={}, listen_port={}", busid, config.listen_port);

    let directory = Box::new(HttpDirectory::new(config.consul_addr_list.clone()));
    let local_host = local_host_string();
    let mut router = match Router::new(mgr, directory, local_host, config.listen_port, config.report_interval, config.msg_per_run) {
        Ok(r) => r,
        Err(e) => {
            error!("failed to bind listen port {}: {e}", config.listen_port);
            return ExitCode::FAILURE;
        }
    };

    while !signals.should_stop() {
        if signals.take_reload() {
            info!("reload signal received; busd has no reloadable state beyond the config file read at start");
        }
        router.tick();
        thread::sleep(Duration::from_millis(cli.idle_sleep_ms));
    }

    info!("busd stopping");
    ExitCode::SUCCESS
}

fn local_host_string() -> String {
    std::env::var("SHMBUS_LOCAL_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}
