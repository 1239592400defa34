// Copyright 2024-2026 GG-CORE Contributors
// SPDX-License-Identifier: Apache-2.0

//! CLI subcommands for the `gg-ctx-cli` binary.
//!
//! ## Usage
//!
//! ```bash
//! gg-ctx-cli demo              # Run a scripted orchestration scenario
//! gg-ctx-cli config show       # Print effective configuration
//! gg-ctx-cli config validate   # Check configuration, exit 1 on warnings
//! ```

pub mod config_cmd;
pub mod demo_cmd;

pub use config_cmd::{run_defaults, run_show, run_validate};
pub use demo_cmd::{run_demo, DemoOptions};

/// Find `--config FILE` in `args`.
pub fn config_file_arg(args: &[String]) -> Option<std::path::PathBuf> {
    args.iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(std::path::PathBuf::from)
}

/// `args` with `--config FILE` removed.
pub fn strip_config_arg(args: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" {
            iter.next();
            continue;
        }
        out.push(arg.clone());
    }
    out
}
