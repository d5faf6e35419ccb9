//! Typed cache of instrument configuration parameters.
//!
//! Every [`ParameterEntry`] knows how to recognize its value inside a status
//! line, how to parse the captured text into a [`ParamValue`], and how to
//! format a value back into the text the instrument accepts in a set command.
//!
//! The dictionary is populated from the instrument, never from requests: a
//! cached value changes only when a status line matching the entry's pattern
//! is reparsed.
//!
//! # Example
//!
//! ```
//! use marine_protocol::{ParamDict, ParameterEntry, ParamVisibility};
//! use marine_core::{ParamType, ParamValue};
//!
//! let mut dict = ParamDict::new();
//! dict.add(
//!     ParameterEntry::new("navg", r"number of measurements per sample = (\d+)", ParamType::Int)
//!         .unwrap()
//!         .with_default(ParamValue::Int(4))
//!         .startup(),
//! )
//! .unwrap();
//! dict.add(
//!     ParameterEntry::new("samples", r"samples = (\d+), free", ParamType::Int)
//!         .unwrap()
//!         .with_visibility(ParamVisibility::ReadOnly),
//! )
//! .unwrap();
//!
//! assert!(dict.update("number of measurements per sample = 2").unwrap());
//! assert_eq!(dict.get("navg").unwrap(), &ParamValue::Int(2));
//! assert!(dict.is_read_only("samples").unwrap());
//! assert_eq!(dict.format("navg", &ParamValue::Int(8)).unwrap(), "8");
//! ```

use marine_core::{Error, ParamType, ParamValue, Result};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::{debug, warn};

/// Turns a pattern match into a typed value.
pub type ParseFn = fn(&Captures<'_>) -> Result<ParamValue>;

/// Turns a typed value into the wire text of a set command.
pub type FormatFn = fn(&ParamValue) -> Result<String>;

/// Whether a parameter may be written from above.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamVisibility {
    #[default]
    ReadWrite,
    ReadOnly,
}

/// One named instrument parameter.
#[derive(Clone)]
pub struct ParameterEntry {
    name: String,
    pattern: Regex,
    parse: ParseFn,
    format: FormatFn,
    value_type: ParamType,
    default: Option<ParamValue>,
    visibility: ParamVisibility,
    startup: bool,
    display_name: String,
    value: Option<ParamValue>,
}

impl ParameterEntry {
    /// Create an entry whose first capture group holds the value.
    ///
    /// The parse and format functions default to [`parsers`] and
    /// [`formatters`] helpers matching `value_type`.
    ///
    /// # Errors
    /// Returns `Error::Config` if the pattern does not compile.
    pub fn new(name: impl Into<String>, pattern: &str, value_type: ParamType) -> Result<Self> {
        let name = name.into();
        let pattern = Regex::new(pattern)
            .map_err(|e| Error::config(format!("invalid pattern for parameter '{name}': {e}")))?;
        let (parse, format): (ParseFn, FormatFn) = match value_type {
            ParamType::Int => (parsers::int, formatters::plain),
            ParamType::Float => (parsers::float, formatters::plain),
            ParamType::Bool => (parsers::yes_no, formatters::yes_no),
            ParamType::Str => (parsers::string, formatters::plain),
        };
        Ok(Self {
            display_name: name.clone(),
            name,
            pattern,
            parse,
            format,
            value_type,
            default: None,
            visibility: ParamVisibility::ReadWrite,
            startup: false,
            value: None,
        })
    }

    #[must_use]
    pub fn with_parse(mut self, parse: ParseFn) -> Self {
        self.parse = parse;
        self
    }

    #[must_use]
    pub fn with_format(mut self, format: FormatFn) -> Self {
        self.format = format;
        self
    }

    #[must_use]
    pub fn with_default(mut self, default: ParamValue) -> Self {
        self.default = Some(default);
        self
    }

    #[must_use]
    pub fn with_visibility(mut self, visibility: ParamVisibility) -> Self {
        self.visibility = visibility;
        self
    }

    #[must_use]
    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    /// Mark the entry as applied when the instrument is first configured.
    #[must_use]
    pub fn startup(mut self) -> Self {
        self.startup = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn value_type(&self) -> ParamType {
        self.value_type
    }

    pub fn default_value(&self) -> Option<&ParamValue> {
        self.default.as_ref()
    }

    pub fn visibility(&self) -> ParamVisibility {
        self.visibility
    }

    pub fn is_startup(&self) -> bool {
        self.startup
    }

    pub fn value(&self) -> Option<&ParamValue> {
        self.value.as_ref()
    }

    /// Parse `text` without touching the cache.
    ///
    /// Returns `Ok(None)` if the pattern does not match.
    pub fn parse(&self, text: &str) -> Result<Option<ParamValue>> {
        match self.pattern.captures(text) {
            Some(caps) => (self.parse)(&caps)
                .and_then(|v| v.coerce(self.value_type))
                .map(Some),
            None => Ok(None),
        }
    }

    /// Format `value` for transmission.
    ///
    /// # Errors
    /// Returns `Error::Parameter` if the value's type disagrees with the
    /// declared type.
    pub fn format(&self, value: &ParamValue) -> Result<String> {
        let value = value.clone().coerce(self.value_type).map_err(|_| {
            Error::parameter(format!(
                "type mismatch for '{}': expected {}, got {}",
                self.name,
                self.value_type,
                value.value_type()
            ))
        })?;
        (self.format)(&value)
    }
}

impl fmt::Debug for ParameterEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParameterEntry")
            .field("name", &self.name)
            .field("pattern", &self.pattern.as_str())
            .field("value_type", &self.value_type)
            .field("visibility", &self.visibility)
            .field("startup", &self.startup)
            .field("value", &self.value)
            .finish()
    }
}

/// Registry of parameter entries in registration order.
#[derive(Debug, Default, Clone)]
pub struct ParamDict {
    entries: Vec<ParameterEntry>,
    index: HashMap<String, usize>,
}

impl ParamDict {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entry.
    ///
    /// # Errors
    /// Returns `Error::Config` if an entry with the same name exists.
    pub fn add(&mut self, entry: ParameterEntry) -> Result<()> {
        if self.index.contains_key(&entry.name) {
            return Err(Error::config(format!("duplicate parameter '{}'", entry.name)));
        }
        self.index.insert(entry.name.clone(), self.entries.len());
        self.entries.push(entry);
        Ok(())
    }

    /// Scan one line against every pattern.
    ///
    /// The first matching entry is reparsed and overwritten. Returns whether
    /// its cached value changed.
    ///
    /// # Errors
    /// Returns `Error::Parameter` if a pattern matched but the captured text
    /// could not be parsed. The cache is left untouched.
    pub fn update(&mut self, line: &str) -> Result<bool> {
        for entry in &mut self.entries {
            let Some(value) = entry.parse(line)? else {
                continue;
            };
            let changed = entry.value.as_ref() != Some(&value);
            if changed {
                debug!(param = %entry.name, old = ?entry.value, new = %value, "parameter updated");
            }
            entry.value = Some(value);
            return Ok(changed);
        }
        Ok(false)
    }

    /// Apply [`update`](Self::update) to every line of `text`.
    ///
    /// Lines that fail to parse are logged and skipped. Returns whether any
    /// cached value changed.
    pub fn update_lines(&mut self, text: &str) -> bool {
        let mut changed = false;
        for line in text.lines() {
            match self.update(line) {
                Ok(c) => changed |= c,
                Err(e) => warn!(line = %line.trim_end(), error = %e, "unparseable parameter line"),
            }
        }
        changed
    }

    /// Cached value of `name`.
    ///
    /// # Errors
    /// Returns `Error::UnknownParameter` if the name is not registered or the
    /// value has never been read from the instrument.
    pub fn get(&self, name: &str) -> Result<&ParamValue> {
        self.entry(name)?
            .value
            .as_ref()
            .ok_or_else(|| Error::UnknownParameter(format!("{name} (not yet read)")))
    }

    /// Snapshot of every populated value.
    pub fn get_config(&self) -> BTreeMap<String, ParamValue> {
        self.entries
            .iter()
            .filter_map(|e| e.value.clone().map(|v| (e.name.clone(), v)))
            .collect()
    }

    /// Format `value` for the set command of `name`.
    pub fn format(&self, name: &str, value: &ParamValue) -> Result<String> {
        self.entry(name)?.format(value)
    }

    pub fn entry(&self, name: &str) -> Result<&ParameterEntry> {
        self.index
            .get(name)
            .map(|&i| &self.entries[i])
            .ok_or_else(|| Error::UnknownParameter(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn is_read_only(&self, name: &str) -> Result<bool> {
        Ok(self.entry(name)?.visibility == ParamVisibility::ReadOnly)
    }

    /// Names of every entry flagged for startup configuration.
    pub fn startup_parameters(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| e.startup)
            .map(|e| e.name.as_str())
            .collect()
    }

    /// Declared defaults keyed by name.
    pub fn defaults(&self) -> BTreeMap<String, ParamValue> {
        self.entries
            .iter()
            .filter_map(|e| e.default.clone().map(|v| (e.name.clone(), v)))
            .collect()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    pub fn entries(&self) -> &[ParameterEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether every registered entry has been read at least once.
    pub fn is_populated(&self) -> bool {
        self.entries.iter().all(|e| e.value.is_some())
    }

    /// Forget every cached value.
    pub fn invalidate(&mut self) {
        for entry in &mut self.entries {
            entry.value = None;
        }
    }
}

/// Parse functions for common status line shapes. Each reads capture group 1.
pub mod parsers {
    use super::*;

    fn group<'a>(caps: &'a Captures<'_>) -> Result<&'a str> {
        caps.get(1)
            .map(|m| m.as_str().trim())
            .ok_or_else(|| Error::parameter("pattern has no capture group"))
    }

    pub fn int(caps: &Captures<'_>) -> Result<ParamValue> {
        let text = group(caps)?;
        text.parse::<i64>()
            .map(ParamValue::Int)
            .map_err(|_| Error::parameter(format!("'{text}' is not an integer")))
    }

    pub fn float(caps: &Captures<'_>) -> Result<ParamValue> {
        let text = group(caps)?;
        text.parse::<f64>()
            .map(ParamValue::Float)
            .map_err(|_| Error::parameter(format!("'{text}' is not a number")))
    }

    pub fn string(caps: &Captures<'_>) -> Result<ParamValue> {
        Ok(ParamValue::Str(group(caps)?.to_string()))
    }

    /// `yes`/`no`, case-insensitive.
    pub fn yes_no(caps: &Captures<'_>) -> Result<ParamValue> {
        let text = group(caps)?;
        match text.to_ascii_lowercase().as_str() {
            "yes" | "y" | "true" => Ok(ParamValue::Bool(true)),
            "no" | "n" | "false" => Ok(ParamValue::Bool(false)),
            _ => Err(Error::parameter(format!("'{text}' is not yes/no"))),
        }
    }

    /// `on`/`off`, case-insensitive.
    pub fn on_off(caps: &Captures<'_>) -> Result<ParamValue> {
        let text = group(caps)?;
        match text.to_ascii_lowercase().as_str() {
            "on" => Ok(ParamValue::Bool(true)),
            "off" => Ok(ParamValue::Bool(false)),
            _ => Err(Error::parameter(format!("'{text}' is not on/off"))),
        }
    }

    /// True when the optional group 1 participated in the match.
    pub fn present(caps: &Captures<'_>) -> Result<ParamValue> {
        Ok(ParamValue::Bool(caps.get(1).is_some_and(|m| !m.as_str().is_empty())))
    }
}

/// Format functions matching [`parsers`].
pub mod formatters {
    use super::*;

    pub fn plain(value: &ParamValue) -> Result<String> {
        Ok(value.to_string())
    }

    pub fn yes_no(value: &ParamValue) -> Result<String> {
        bool_text(value, "y", "n")
    }

    pub fn on_off(value: &ParamValue) -> Result<String> {
        bool_text(value, "on", "off")
    }

    fn bool_text(value: &ParamValue, yes: &str, no: &str) -> Result<String> {
        match value.as_bool() {
            Some(true) => Ok(yes.to_string()),
            Some(false) => Ok(no.to_string()),
            None => Err(Error::parameter(format!("expected bool, got {}", value.value_type()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn dict() -> ParamDict {
        let mut dict = ParamDict::new();
        dict.add(
            ParameterEntry::new("interval", r"sample interval = (\d+) seconds", ParamType::Int)
                .unwrap()
                .with_default(ParamValue::Int(10))
                .startup(),
        )
        .unwrap();
        dict.add(
            ParameterEntry::new("txrealtime", r"transmit real-time = (yes|no)", ParamType::Bool)
                .unwrap()
                .startup(),
        )
        .unwrap();
        dict.add(
            ParameterEntry::new("initsm", r"Initialize Silent Mode: (\w+)", ParamType::Bool)
                .unwrap()
                .with_parse(parsers::on_off)
                .with_format(formatters::on_off),
        )
        .unwrap();
        dict.add(
            ParameterEntry::new("samples", r"samples = (\d+), free = \d+", ParamType::Int)
                .unwrap()
                .with_visibility(ParamVisibility::ReadOnly),
        )
        .unwrap();
        dict
    }

    #[test]
    fn test_get_before_population_is_unknown() {
        let dict = dict();
        assert!(matches!(dict.get("interval"), Err(Error::UnknownParameter(_))));
        assert!(matches!(dict.get("bogus"), Err(Error::UnknownParameter(_))));
    }

    #[test]
    fn test_update_reports_change_only_on_difference() {
        let mut dict = dict();
        assert!(dict.update("sample interval = 15 seconds").unwrap());
        assert!(!dict.update("sample interval = 15 seconds").unwrap());
        assert!(dict.update("sample interval = 20 seconds").unwrap());
        assert_eq!(dict.get("interval").unwrap(), &ParamValue::Int(20));
        assert!(!dict.update("unrelated text").unwrap());
    }

    #[test]
    fn test_update_lines_over_block() {
        let mut dict = dict();
        let block = "sample interval = 10 seconds\r\ntransmit real-time = yes\r\nInitialize Silent Mode: off\r\nsamples = 12, free = 400\r\n";
        assert!(dict.update_lines(block));
        let config = dict.get_config();
        assert_eq!(config.len(), 4);
        assert_eq!(config["txrealtime"], ParamValue::Bool(true));
        assert_eq!(config["initsm"], ParamValue::Bool(false));
        assert!(dict.is_populated());
        assert!(!dict.update_lines(block));
    }

    #[test]
    fn test_parse_failure_leaves_cache() {
        let mut dict = dict();
        dict.update("Initialize Silent Mode: on").unwrap();
        assert!(dict.update("Initialize Silent Mode: maybe").is_err());
        assert_eq!(dict.get("initsm").unwrap(), &ParamValue::Bool(true));
    }

    #[rstest]
    #[case("interval", ParamValue::Int(30), Some("30"))]
    #[case("txrealtime", ParamValue::Bool(false), Some("n"))]
    #[case("initsm", ParamValue::Bool(true), Some("on"))]
    #[case("interval", ParamValue::Str("ten".into()), None)]
    #[case("txrealtime", ParamValue::Int(1), None)]
    fn test_format(#[case] name: &str, #[case] value: ParamValue, #[case] expected: Option<&str>) {
        let dict = dict();
        match expected {
            Some(text) => assert_eq!(dict.format(name, &value).unwrap(), text),
            None => assert!(matches!(dict.format(name, &value), Err(Error::Parameter(_)))),
        }
    }

    #[test]
    fn test_queries() {
        let dict = dict();
        assert_eq!(dict.startup_parameters(), vec!["interval", "txrealtime"]);
        assert_eq!(dict.defaults().get("interval"), Some(&ParamValue::Int(10)));
        assert!(dict.is_read_only("samples").unwrap());
        assert!(!dict.is_read_only("interval").unwrap());
        assert!(dict.is_read_only("nope").is_err());
        assert_eq!(dict.names().count(), 4);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut dict = dict();
        let dup = ParameterEntry::new("interval", r"x (\d+)", ParamType::Int).unwrap();
        assert!(matches!(dict.add(dup), Err(Error::Config(_))));
    }

    #[test]
    fn test_invalidate() {
        let mut dict = dict();
        dict.update("sample interval = 10 seconds").unwrap();
        dict.invalidate();
        assert!(dict.get_config().is_empty());
    }

    #[test]
    fn test_optional_group_presence() {
        let mut dict = ParamDict::new();
        dict.add(
            ParameterEntry::new("outputsal", r"output salinity = (no)?", ParamType::Bool)
                .unwrap()
                .with_parse(|caps| parsers::present(caps).map(|v| ParamValue::Bool(v.as_bool() != Some(true))))
                .with_format(formatters::yes_no),
        )
        .unwrap();
        dict.update("output salinity = no").unwrap();
        assert_eq!(dict.get("outputsal").unwrap(), &ParamValue::Bool(false));
        dict.update("output salinity = ").unwrap();
        assert_eq!(dict.get("outputsal").unwrap(), &ParamValue::Bool(true));
    }
}
