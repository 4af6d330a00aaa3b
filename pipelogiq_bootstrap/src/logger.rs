// /////////////////////////////////////////////////////////////////////////////
// Pipelogiq
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Logging Initialization
//!
//! Installs the process-wide `tracing` subscriber. The filter chain is, in
//! order of precedence: `RUST_LOG`, then the level passed by configuration,
//! then `info`.
//!
//! Called exactly once at startup, before any component is constructed, so
//! bind failures and config errors are already visible in logs.

use tracing_subscriber::{fmt, EnvFilter};

/// Initializes the global tracing subscriber.
///
/// `default_level` comes from configuration (e.g. `"info"`,
/// `"pipelogiq=debug,sqlx=warn"`) and is used when `RUST_LOG` is unset.
/// Returns an error string when a subscriber is already installed.
pub fn init_tracing(default_level: &str) -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| format!("invalid log filter {:?}: {}", default_level, e))?;

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| format!("failed to install tracing subscriber: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_an_error() {
        // The first install wins; a second install must surface as an
        // error, not a panic.
        let _ = init_tracing("info");
        assert!(init_tracing("info").is_err());
    }
}
