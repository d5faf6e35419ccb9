//! Engine-wide defaults.
//!
//! Instrument vocabularies override most of these per command, and the
//! driver configuration overrides them per connection. All durations are expressed in milliseconds.
//!
//! ```
//! use marine_core::constants::*;
//! use std::time::Duration;
//!
//! let timeout = Duration::from_millis(DEFAULT_COMMAND_TIMEOUT_MS);
//! assert_eq!(timeout.as_secs(), 10);
//! ```

// ============================================================================
// Command dialogue
// ============================================================================

/// Default per-call deadline for a command/response exchange.
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 10_000;

/// Default number of extra attempts after a device rejection.
pub const DEFAULT_COMMAND_RETRIES: u32 = 3;

/// Default pause between transmitting a command and listening for the reply.
pub const DEFAULT_WRITE_DELAY_MS: u64 = 0;

/// Upper bound on wake/break attempts made by discovery and autosample stop.
pub const DEFAULT_BREAK_ATTEMPTS: u32 = 5;

// ============================================================================
// Buffers and channels
// ============================================================================

/// Maximum bytes the chunker retains while waiting for a complete unit.
///
/// Once exceeded the oldest bytes are dropped. Instruments emit samples well
/// below this size, so only a runaway noise stream reaches the cap.
pub const MAX_CHUNKER_BUFFER: usize = 64 * 1024;

/// Maximum bytes a single dispatch accumulates while waiting for its prompt.
pub const MAX_RESPONSE_BUFFER: usize = 64 * 1024;

/// Capacity of the upward event channel.
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Capacity of the inbound transport channel.
pub const DEFAULT_INBOUND_CHANNEL_CAPACITY: usize = 256;

/// Capacity of the driver command channel.
pub const DEFAULT_COMMAND_CHANNEL_CAPACITY: usize = 32;

/// Number of state transitions kept for diagnostics.
pub const MAX_TRANSITION_HISTORY: usize = 100;

// ============================================================================
// Timers
// ============================================================================

/// Delay between entering the Test state and firing the test run.
pub const DEFAULT_SELF_TEST_DELAY_MS: u64 = 1_000;
