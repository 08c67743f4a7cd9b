// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmbus contributors
//
// busd's command line, exactly the flags named in spec.md §6. Port of
// src/server/option_parser.h's templated parser, replaced with `clap`.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "busd", about = "Shared-memory bus router daemon")]
pub struct Cli {
    /// This router's bus identity, "area.zone.func.inst".
    #[arg(long)]
    pub id: String,

    #[arg(long = "pid-file")]
    pub pid_file: Option<PathBuf>,

    #[arg(long = "log-conf")]
    pub log_conf: Option<PathBuf>,

    #[arg(long = "proc-conf")]
    pub proc_conf: PathBuf,

    /// Attach to an existing channel-manager segment instead of creating one.
    #[arg(long)]
    pub resume: bool,

    #[arg(long = "idle-count", default_value_t = 32)]
    pub idle_count: u32,

    #[arg(long = "idle-sleep", default_value_t = 1)]
    pub idle_sleep_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_required_and_default_flags() {
        let cli = Cli::parse_from(["busd", "--id", "1.1.1.1", "--proc-conf", "busd.toml"]);
        assert_eq!(cli.id, "1.1.1.1");
        assert_eq!(cli.idle_count, 32);
        assert!(!cli.resume);
    }

    #[test]
    fn parses_resume_flag() {
        let cli = Cli::parse_from(["busd", "--id", "1.1.1.1", "--proc-conf", "busd.toml", "--resume"]);
        assert!(cli.resume);
    }
}
