// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Gateway configuration
//!
//! Every knob has a default; a file is optional. Validation failures are
//! fatal at startup and map to exit code 1.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_LISTEN_PORT: u16 = 5023;
pub const DEFAULT_BACKLOG: usize = 1024;
pub const DEFAULT_IDLE_TIMEOUT_SECONDS: u64 = 600;
pub const DEFAULT_SESSION_IDLE_TIMEOUT_SECONDS: u64 = 1800;
pub const DEFAULT_MAX_SESSIONS: usize = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// TCP accept port.
    pub listen_port: u16,
    /// Accept-side threads. Kept for operational parity; the runtime drives
    /// accepts from a single task.
    pub boss_threads: usize,
    /// Runtime worker threads; 0 means the CPU count.
    pub worker_threads: usize,
    /// Bound on concurrent connections.
    pub backlog: usize,
    /// Connection-level idle timeout.
    pub idle_timeout_seconds: u64,
    /// Session eviction threshold.
    pub session_idle_timeout_seconds: u64,
    /// Registry capacity.
    pub max_sessions: usize,
    /// Selects the wire codec. GT06 is the only registered protocol.
    pub default_protocol: String,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            listen_port: DEFAULT_LISTEN_PORT,
            boss_threads: 1,
            worker_threads: 0,
            backlog: DEFAULT_BACKLOG,
            idle_timeout_seconds: DEFAULT_IDLE_TIMEOUT_SECONDS,
            session_idle_timeout_seconds: DEFAULT_SESSION_IDLE_TIMEOUT_SECONDS,
            max_sessions: DEFAULT_MAX_SESSIONS,
            default_protocol: "GT06".to_string(),
        }
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Config> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Config = serde_yaml::from_str(&raw)
            .map_err(|e| Error::Config(format!("{}: {}", path.as_ref().display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_port == 0 {
            return Err(Error::Config("listen_port must be 1-65535".to_string()));
        }
        if self.boss_threads == 0 {
            return Err(Error::Config("boss_threads must be >= 1".to_string()));
        }
        if self.backlog == 0 {
            return Err(Error::Config("backlog must be >= 1".to_string()));
        }
        if self.idle_timeout_seconds == 0 {
            return Err(Error::Config(
                "idle_timeout_seconds must be >= 1".to_string(),
            ));
        }
        if self.session_idle_timeout_seconds < 300 {
            return Err(Error::Config(
                "session_idle_timeout_seconds must be >= 300".to_string(),
            ));
        }
        if !(100..=100_000).contains(&self.max_sessions) {
            return Err(Error::Config(
                "max_sessions must be within 100-100000".to_string(),
            ));
        }
        if protocol_config(&self.default_protocol).is_none() {
            return Err(Error::Config(format!(
                "unknown protocol {:?}",
                self.default_protocol
            )));
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_seconds)
    }
}

/// Framing description for one registered protocol. Immutable after
/// registration.
#[derive(Debug, Clone, Copy)]
pub struct ProtocolConfig {
    pub name: &'static str,
    /// GT06 frames its own length; generic length-field framing is off.
    pub use_length_field_framing: bool,
    pub custom_framer: bool,
    pub length_field: Option<LengthField>,
}

#[derive(Debug, Clone, Copy)]
pub struct LengthField {
    pub offset: usize,
    pub width: usize,
    pub adjustment: isize,
    pub strip: bool,
}

static PROTOCOLS: [ProtocolConfig; 1] = [ProtocolConfig {
    name: "GT06",
    use_length_field_framing: false,
    custom_framer: true,
    length_field: None,
}];

pub fn protocol_config(name: &str) -> Option<&'static ProtocolConfig> {
    PROTOCOLS.iter().find(|p| p.name.eq_ignore_ascii_case(name))
}
