//! Mock implementations for testing and development.
//!
//! These stand in for the port agent so protocol engines and instrument
//! vocabularies can be exercised without hardware.

pub mod port_agent;

pub use port_agent::{MockPortAgent, MockPortAgentHandle, MockTransport};
