// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmbus contributors
//
// Minimal process-side receiver: registers a bus identity and prints every
// message that arrives on its read-ring until interrupted.

use std::env;
use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use shmbus::bus::client::BusClient;
use shmbus::error::BusError;

fn main() -> ExitCode {
    env_logger::init();
    let mut args = env::args().skip(1);

    let (shm_path, shm_size, busid) = match (args.next(), args.next(), args.next()) {
        (Some(p), Some(sz), Some(id)) => (p, sz, id),
        _ => {
            eprintln!("usage: bus_recv <shm_path> <shm_size> <busid>");
            return ExitCode::FAILURE;
        }
    };

    let shm_size: usize = match shm_size.parse() {
        Ok(v) => v,
        Err(_) => {
            eprintln!("shm_size must be a number");
            return ExitCode::FAILURE;
        }
    };
    let busid: i32 = match busid.parse::<shmbus::bus::BusId>() {
        Ok(id) => id.as_u32() as i32,
        Err(e) => {
            eprintln!("bad busid: {e}");
            return ExitCode::FAILURE;
        }
    };

    let client = match BusClient::register_bus(&shm_path, shm_size, busid, 256, 64) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("register_bus failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut buf = vec![0u8; 4096];
    loop {
        match client.recv(&mut buf) {
            Ok(Some((len, src))) => println!("from {src:#x}: {:?}", String::from_utf8_lossy(&buf[..len])),
            Ok(None) => thread::sleep(Duration::from_millis(50)),
            Err(BusError::BufferTooSmall { required }) => buf.resize(required, 0),
            Err(e) => {
                eprintln!("recv failed: {e}");
                return ExitCode::FAILURE;
            }
        }
    }
}
