use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Operating state of an instrument as tracked by its protocol engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolState {
    /// State not yet established; only discovery is legal.
    Unknown,
    /// Instrument is idle at its command prompt.
    Command,
    /// Instrument streams samples on its own.
    Autosample,
    /// Instrument is running its built-in diagnostics.
    Test,
    /// Instrument is running a calibration routine.
    Calibrate,
    /// An operator session owns the link.
    DirectAccess,
}

impl ProtocolState {
    pub const ALL: [ProtocolState; 6] = [
        ProtocolState::Unknown,
        ProtocolState::Command,
        ProtocolState::Autosample,
        ProtocolState::Test,
        ProtocolState::Calibrate,
        ProtocolState::DirectAccess,
    ];
}

impl fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ProtocolState::Unknown => "Unknown",
            ProtocolState::Command => "Command",
            ProtocolState::Autosample => "Autosample",
            ProtocolState::Test => "Test",
            ProtocolState::Calibrate => "Calibrate",
            ProtocolState::DirectAccess => "DirectAccess",
        };
        f.write_str(name)
    }
}

/// Events that drive the protocol state machine.
///
/// `Enter` and `Exit` are pseudo-events fired around every transition.
/// `Custom` names an instrument-specific command declared by a vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolEvent {
    Enter,
    Exit,
    Get,
    Set,
    Discover,
    StartAutosample,
    StopAutosample,
    StartDirect,
    ExecuteDirect,
    StopDirect,
    Test,
    RunTest,
    AcquireSample,
    Custom(&'static str),
}

impl fmt::Display for ProtocolEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProtocolEvent::Enter => f.write_str("Enter"),
            ProtocolEvent::Exit => f.write_str("Exit"),
            ProtocolEvent::Get => f.write_str("Get"),
            ProtocolEvent::Set => f.write_str("Set"),
            ProtocolEvent::Discover => f.write_str("Discover"),
            ProtocolEvent::StartAutosample => f.write_str("StartAutosample"),
            ProtocolEvent::StopAutosample => f.write_str("StopAutosample"),
            ProtocolEvent::StartDirect => f.write_str("StartDirect"),
            ProtocolEvent::ExecuteDirect => f.write_str("ExecuteDirect"),
            ProtocolEvent::StopDirect => f.write_str("StopDirect"),
            ProtocolEvent::Test => f.write_str("Test"),
            ProtocolEvent::RunTest => f.write_str("RunTest"),
            ProtocolEvent::AcquireSample => f.write_str("AcquireSample"),
            ProtocolEvent::Custom(name) => write!(f, "Custom({name})"),
        }
    }
}

/// Declared type of a configuration parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    Int,
    Float,
    Bool,
    Str,
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ParamType::Int => "int",
            ParamType::Float => "float",
            ParamType::Bool => "bool",
            ParamType::Str => "string",
        };
        f.write_str(name)
    }
}

/// Typed value of a configuration parameter.
///
/// # Examples
///
/// ```
/// use marine_core::{ParamType, ParamValue};
///
/// let v = ParamValue::from(2.5);
/// assert_eq!(v.value_type(), ParamType::Float);
/// assert_eq!(v.as_f64(), Some(2.5));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl ParamValue {
    #[must_use]
    pub fn value_type(&self) -> ParamType {
        match self {
            ParamValue::Int(_) => ParamType::Int,
            ParamValue::Float(_) => ParamType::Float,
            ParamValue::Bool(_) => ParamType::Bool,
            ParamValue::Str(_) => ParamType::Str,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric view; integers widen to `f64`.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Float(v) => Some(*v),
            ParamValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Str(v) => Some(v),
            _ => None,
        }
    }

    /// Coerce into `expected`, accepting integer literals for float parameters.
    ///
    /// # Errors
    /// Returns `Error::Parameter` when the value cannot represent `expected`.
    pub fn coerce(self, expected: ParamType) -> Result<ParamValue> {
        match (self, expected) {
            (ParamValue::Int(v), ParamType::Float) => Ok(ParamValue::Float(v as f64)),
            (v, t) if v.value_type() == t => Ok(v),
            (v, t) => Err(Error::parameter(format!(
                "type mismatch: expected {t}, got {} ({v})",
                v.value_type()
            ))),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Float(v) => write!(f, "{v}"),
            ParamValue::Bool(v) => write!(f, "{v}"),
            ParamValue::Str(v) => f.write_str(v),
        }
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Str(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Str(v)
    }
}

/// One named value inside a [`Particle`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticleField {
    pub value_id: String,
    pub value: serde_json::Value,
}

/// Structured record decoded from one chunk or command response.
///
/// Fields keep the order in which the decoder appended them.
///
/// # Examples
///
/// ```
/// use marine_core::Particle;
/// use chrono::Utc;
///
/// let particle = Particle::new("ctd_parsed", Utc::now())
///     .with_field("temperature", 12.5)
///     .with_field("conductivity", 0.00247);
///
/// assert_eq!(particle.field("temperature").and_then(|v| v.as_f64()), Some(12.5));
/// assert!(particle.to_json().contains("conductivity"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Particle {
    pub particle_type: String,
    pub timestamp: DateTime<Utc>,
    pub values: Vec<ParticleField>,
}

impl Particle {
    pub fn new(particle_type: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            particle_type: particle_type.into(),
            timestamp,
            values: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_field(mut self, value_id: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.push(value_id, value);
        self
    }

    pub fn push(&mut self, value_id: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.values.push(ParticleField {
            value_id: value_id.into(),
            value: value.into(),
        });
    }

    /// First field named `value_id`.
    #[must_use]
    pub fn field(&self, value_id: &str) -> Option<&serde_json::Value> {
        self.values
            .iter()
            .find(|f| f.value_id == value_id)
            .map(|f| &f.value)
    }

    #[must_use]
    pub fn to_json(&self) -> String {
        // Serializing plain strings, numbers and timestamps cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Outcome of a single built-in diagnostic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub name: String,
    pub passed: bool,
    pub response: String,
}

/// Aggregated result of a self-test run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelfTestReport {
    pub outcomes: Vec<TestOutcome>,
    pub completed_at: DateTime<Utc>,
}

impl SelfTestReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        !self.outcomes.is_empty() && self.outcomes.iter().all(|o| o.passed)
    }
}
