// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmbus contributors
//
// Minimal process-side sender: registers a bus identity and pushes one
// message per command-line argument into its write-ring.

use std::env;
use std::process::ExitCode;

use shmbus::bus::client::BusClient;

fn main() -> ExitCode {
    env_logger::init();
    let mut args = env::args().skip(1);

    let (shm_path, shm_size, src, dst) = match (args.next(), args.next(), args.next(), args.next()) {
        (Some(p), Some(sz), Some(s), Some(d)) => (p, sz, s, d),
        _ => {
            eprintln!("usage: bus_send <shm_path> <shm_size> <src_busid> <dst_busid> [message...]");
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
    let src_busid: i32 = match src.parse::<shmbus::bus::BusId>() {
        Ok(id) => id.as_u32() as i32,
        Err(e) => {
            eprintln!("bad src busid: {e}");
            return ExitCode::FAILURE;
        }
    };
    let dst_busid: i32 = match dst.parse::<shmbus::bus::BusId>() {
        Ok(id) => id.as_u32() as i32,
        Err(e) => {
            eprintln!("bad dst busid: {e}");
            return ExitCode::FAILURE;
        }
    };

    let client = match BusClient::register_bus(&shm_path, shm_size, src_busid, 256, 64) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("register_bus failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    for word in args {
        if let Err(e) = client.send(dst_busid, word.as_bytes()) {
            eprintln!("send failed: {e}");
            return ExitCode::FAILURE;
        }
        println!("sent {word:?} to {dst}");
    }

    client.deregister_bus();
    ExitCode::SUCCESS
}
