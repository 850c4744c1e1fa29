//! Parses the `Nm`/`Nh`/`Nd` idle-destroy-timeout strings carried on
//! `SandboxConfig` (spec.md §4.6). `humantime` already accepts this exact
//! unit family (`m`/`min`, `h`/`hour`, `d`/`day`), so no hand-rolled
//! grammar is needed.

use std::time::Duration;

use crate::error::{Result, SandboxError};

pub fn parse_idle_timeout(raw: &str) -> Result<Duration> {
    humantime::parse_duration(raw).map_err(|e| SandboxError::InvalidDuration {
        raw: raw.to_string(),
        reason: e.to_string(),
    })
}
