//! Per-connection configuration.
//!
//! Values left unset fall back to what the instrument vocabulary declares for
//! each command. Durations are expressed in milliseconds so configuration
//! files stay plain JSON.
//!
//! ```
//! use marine_driver::ProtocolConfig;
//! use marine_core::ParamValue;
//!
//! let config = ProtocolConfig::from_json(r#"{
//!     "startup": { "navg": 4 },
//!     "timeout_ms": 5000,
//!     "commands": { "ds": { "retries": 1 } }
//! }"#).unwrap();
//!
//! assert_eq!(config.startup["navg"], ParamValue::Int(4));
//! assert_eq!(config.timeout_ms, Some(5000));
//! assert_eq!(config.break_attempts, 5);
//! ```

use marine_core::constants::{
    DEFAULT_BREAK_ATTEMPTS, DEFAULT_EVENT_CHANNEL_CAPACITY, DEFAULT_SELF_TEST_DELAY_MS, MAX_CHUNKER_BUFFER,
};
use marine_core::{Error, ParamValue, Result};
use marine_protocol::CommandSpec;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Overrides for a single command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandOverride {
    pub timeout_ms: Option<u64>,
    pub retries: Option<u32>,
    pub write_delay_ms: Option<u64>,
}

/// Construction-time configuration of a protocol engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Values applied to startup parameters on first entry to Command.
    /// Entries here take precedence over the vocabulary defaults.
    pub startup: BTreeMap<String, ParamValue>,
    /// Deadline applied to every command, unless overridden per command.
    pub timeout_ms: Option<u64>,
    pub retries: Option<u32>,
    pub write_delay_ms: Option<u64>,
    /// Per-command overrides keyed by vocabulary command name.
    pub commands: HashMap<String, CommandOverride>,
    /// Upper bound on break/wakeup attempts during discovery and autosample stop.
    pub break_attempts: u32,
    /// Delay between entering Test and running the diagnostics.
    pub self_test_delay_ms: u64,
    pub event_channel_capacity: usize,
    pub max_chunker_buffer: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            startup: BTreeMap::new(),
            timeout_ms: None,
            retries: None,
            write_delay_ms: None,
            commands: HashMap::new(),
            break_attempts: DEFAULT_BREAK_ATTEMPTS,
            self_test_delay_ms: DEFAULT_SELF_TEST_DELAY_MS,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            max_chunker_buffer: MAX_CHUNKER_BUFFER,
        }
    }
}

impl ProtocolConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    ///
    /// # Errors
    /// Returns `Error::Config` if the document is malformed or a value is out
    /// of range.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::config(format!("invalid protocol config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.break_attempts == 0 {
            return Err(Error::config("break_attempts must be at least 1"));
        }
        if self.event_channel_capacity == 0 {
            return Err(Error::config("event_channel_capacity must be at least 1"));
        }
        if self.max_chunker_buffer == 0 {
            return Err(Error::config("max_chunker_buffer must be at least 1"));
        }
        if self.timeout_ms == Some(0) || self.commands.values().any(|c| c.timeout_ms == Some(0)) {
            return Err(Error::config("command timeouts must be positive"));
        }
        Ok(())
    }

    #[must_use]
    pub fn with_startup(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.startup.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    #[must_use]
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay_ms = Some(delay.as_millis() as u64);
        self
    }

    #[must_use]
    pub fn with_command_override(mut self, command: impl Into<String>, command_override: CommandOverride) -> Self {
        self.commands.insert(command.into(), command_override);
        self
    }

    #[must_use]
    pub fn with_break_attempts(mut self, attempts: u32) -> Self {
        self.break_attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_self_test_delay(mut self, delay: Duration) -> Self {
        self.self_test_delay_ms = delay.as_millis() as u64;
        self
    }

    #[must_use]
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity;
        self
    }

    pub fn self_test_delay(&self) -> Duration {
        Duration::from_millis(self.self_test_delay_ms)
    }

    /// Apply connection-wide then per-command overrides to `spec`.
    pub fn apply(&self, command: &str, spec: &mut CommandSpec) {
        if let Some(ms) = self.timeout_ms {
            spec.timeout = Duration::from_millis(ms);
        }
        if let Some(retries) = self.retries {
            spec.retries = retries;
        }
        if let Some(ms) = self.write_delay_ms {
            spec.write_delay = Duration::from_millis(ms);
        }
        if let Some(o) = self.commands.get(command) {
            if let Some(ms) = o.timeout_ms {
                spec.timeout = Duration::from_millis(ms);
            }
            if let Some(retries) = o.retries {
                spec.retries = retries;
            }
            if let Some(ms) = o.write_delay_ms {
                spec.write_delay = Duration::from_millis(ms);
            }
        }
    }
}
