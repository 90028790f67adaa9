use std::path::PathBuf;
use std::str::FromStr;

use tracing::warn;

use crate::limits::{DEFAULT_MAX_INSTANCES, MAX_OVERLAPS, MAX_SAVE_ATTEMPTS, MAX_SERIES_INSTANCES};

/// Runtime settings. Read once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    /// Distinct overlaps collected before a check reports too many.
    pub max_overlaps: usize,
    /// Size of a new series, anchor included.
    pub max_instances: u32,
    /// Attempts a series save makes against concurrent writers.
    pub save_attempts: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            max_overlaps: MAX_OVERLAPS,
            max_instances: DEFAULT_MAX_INSTANCES,
            save_attempts: MAX_SAVE_ATTEMPTS,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unset keys keep their defaults; values
    /// that do not parse or fall out of range are logged and ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            data_dir: lookup("VETSLOT_DATA_DIR").map_or(defaults.data_dir, PathBuf::from),
            max_overlaps: setting(&lookup, "VETSLOT_MAX_OVERLAPS", defaults.max_overlaps, |v| *v > 0),
            max_instances: setting(&lookup, "VETSLOT_MAX_INSTANCES", defaults.max_instances, |v| {
                (1..=MAX_SERIES_INSTANCES).contains(v)
            }),
            save_attempts: setting(&lookup, "VETSLOT_SAVE_ATTEMPTS", defaults.save_attempts, |v| *v > 0),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("vetslot.wal")
    }
}

fn setting<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
    valid: impl Fn(&T) -> bool,
) -> T
where
    T: FromStr + std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(value) if valid(&value) => value,
        _ => {
            warn!(key, value = %raw, default = %default, "invalid setting, using default");
            default
        }
    }
}
