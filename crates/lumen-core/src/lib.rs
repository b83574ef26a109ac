// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
//! Bits every Lumen binary shares.
use std::str::FromStr;

use tracing::warn;

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Installs the global `fmt` subscriber. Safe to call more than once; only
/// the first call wins.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init();
}

/// Reads and parses an environment override. Unset or empty variables give
/// `None`; unparsable ones are logged and ignored.
pub fn env_override<T: FromStr>(name: &str) -> Option<T>
where
    T::Err: std::fmt::Display,
{
    let raw = std::env::var(name).ok()?;
    parse_override(name, &raw)
}

fn parse_override<T: FromStr>(name: &str, raw: &str) -> Option<T>
where
    T::Err: std::fmt::Display,
{
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    match raw.parse() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("ignoring {name}={raw:?}: {e}");
            None
        }
    }
}
