//! Sea-Bird SBE 16plus V2 CTD.
//!
//! A line-oriented dialect: every command ends at `S>`, an unrecognized one
//! at `?cmd S>`, and XML-mode commands at `<Executed/>`. The `ds` status
//! report carries both the logging state and the configuration, several
//! settings per line separated by commas. Real-time samples are decimal
//! text lines:
//!
//! ```text
//! # 20.4123,  0.00012,    0.512, 0.0123
//! ```
//!
//! temperature, conductivity, depth and an optional salinity.

use marine_core::{Error, ParamType, ParamValue, Particle, ProtocolState, Result};
use marine_driver::Vocabulary;
use marine_driver::vocabulary::{AutosampleRecipe, CustomCommand, DiscoveryRecipe, ParameterRecipe, ReadRecipe};
use marine_protocol::{
    Chunk, ChunkMatcher, CommandBuilder, CommandResult, CommandSpec, ParamVisibility, ParameterEntry, RegexMatcher,
    Response, SampleDecoder, TextFields, formatters, reject_if_contains,
};
use regex::{Captures, Regex};
use std::time::Duration;

pub const INSTRUMENT: &str = "seabird_sbe16plus";
pub const SAMPLE_PARTICLE: &str = "ctd_parsed";

pub const PROMPT: &str = "S>";
pub const BAD_COMMAND_PROMPT: &str = "?cmd S>";
pub const EXECUTED_PROMPT: &str = "<Executed/>";

const TEST_TIMEOUT: Duration = Duration::from_secs(60);

const SAMPLE_LINE: &str = r"(?m)^#? *-?\d+\.\d+, *-?\d+\.\d+, *-?\d+\.\d+[^\r\n]*\r\n";
const SAMPLE_FIELDS: &str = r"^#? *(-?\d+\.\d+), *(-?\d+\.\d+), *(-?\d+\.\d+)(?:, *(-?\d+\.\d+))?";

/// Decoder for real-time and polled sample lines.
#[derive(Debug, Clone)]
pub struct CtdSample {
    fields: Regex,
}

impl CtdSample {
    pub fn new() -> Result<Self> {
        let fields = Regex::new(SAMPLE_FIELDS)
            .map_err(|e| Error::config(format!("invalid pattern for {SAMPLE_PARTICLE}: {e}")))?;
        Ok(Self { fields })
    }
}

impl SampleDecoder for CtdSample {
    fn particle_type(&self) -> &str {
        SAMPLE_PARTICLE
    }

    fn matcher(&self) -> Result<Box<dyn ChunkMatcher>> {
        Ok(Box::new(RegexMatcher::new(SAMPLE_PARTICLE, SAMPLE_LINE)?))
    }

    fn decode(&self, chunk: &Chunk) -> Result<Particle> {
        let text = chunk.text();
        let fields = TextFields::capture(SAMPLE_PARTICLE, &self.fields, &text)?;
        let mut particle = Particle::new(SAMPLE_PARTICLE, chunk.timestamp)
            .with_field("temp", fields.float(1)?)
            .with_field("conductivity", fields.float(2)?)
            .with_field("depth", fields.float(3)?);
        if fields.has(4) {
            particle.push("salinity", fields.float(4)?);
        }
        Ok(particle)
    }
}

/// Logging state named by a `ds` report.
pub fn classify_status(text: &str) -> Option<ProtocolState> {
    if text.contains("status = not logging") {
        Some(ProtocolState::Command)
    } else if text.contains("status = logging") {
        Some(ProtocolState::Autosample)
    } else {
        None
    }
}

/// Diagnostics print a label, numeric readings, then the prompt. The test
/// passes when every reading in between is a number.
fn test_verdict(response: &Response) -> Result<CommandResult> {
    let tokens: Vec<&str> = response.text.split_whitespace().collect();
    let passed = tokens.len() > 2 && tokens[1..tokens.len() - 1].iter().all(|t| t.parse::<f64>().is_ok());
    Ok(CommandResult::Verdict {
        passed,
        text: response.body().to_string(),
    })
}

fn set_response(response: &Response) -> Result<CommandResult> {
    reject_if_contains("set", response, &["?cmd"])?;
    Ok(CommandResult::Ack)
}

fn status_response(response: &Response) -> Result<CommandResult> {
    if response.prompt == BAD_COMMAND_PROMPT {
        return Err(Error::rejected("ds", response.text.clone()));
    }
    Ok(CommandResult::Text(response.body().to_string()))
}

/// `= no` means off; anything else printed after `=` means on.
fn parse_absent_no(caps: &Captures<'_>) -> Result<ParamValue> {
    Ok(ParamValue::Bool(caps.get(1).is_none()))
}

fn parse_sync_mode(caps: &Captures<'_>) -> Result<ParamValue> {
    match caps.get(1).map(|m| m.as_str()) {
        Some("enabled") => Ok(ParamValue::Bool(true)),
        Some("disabled") => Ok(ParamValue::Bool(false)),
        other => Err(Error::parameter(format!("serial sync mode {other:?}"))),
    }
}

/// Parameter table of the SBE 16plus.
pub fn parameters() -> Result<Vec<ParameterEntry>> {
    Ok(vec![
        ParameterEntry::new("navg", r"number of measurements per sample = (\d+)", ParamType::Int)?
            .with_default(ParamValue::Int(4))
            .with_display_name("Measurements per sample")
            .startup(),
        ParameterEntry::new("interval", r"sample interval = (\d+) seconds", ParamType::Int)?
            .with_default(ParamValue::Int(10))
            .with_display_name("Sample interval (s)")
            .startup(),
        ParameterEntry::new("txrealtime", r"transmit real-time = (yes|no)", ParamType::Bool)?
            .with_default(ParamValue::Bool(true))
            .with_display_name("Transmit real-time data")
            .startup(),
        ParameterEntry::new("outputsal", r"output salinity = (no)?", ParamType::Bool)?
            .with_parse(parse_absent_no)
            .with_format(formatters::yes_no),
        ParameterEntry::new("outputsv", r"output sound velocity = (no)?", ParamType::Bool)?
            .with_parse(parse_absent_no)
            .with_format(formatters::yes_no),
        ParameterEntry::new("syncmode", r"serial sync mode (enabled|disabled)", ParamType::Bool)?
            .with_parse(parse_sync_mode)
            .with_format(formatters::yes_no),
        ParameterEntry::new("samples", r"samples = (\d+)", ParamType::Int)?
            .with_visibility(ParamVisibility::ReadOnly)
            .with_display_name("Samples in memory"),
    ])
}

/// Vocabulary for the SBE 16plus V2.
///
/// # Errors
/// Returns `Error::Config` if the vocabulary fails validation.
pub fn vocabulary() -> Result<Vocabulary> {
    let diagnostic = |token: &str| CommandSpec::line(token).with_parser(test_verdict).with_timeout(TEST_TIMEOUT);

    let mut builder = Vocabulary::builder(INSTRUMENT)
        .prompt(PROMPT)
        .prompt(BAD_COMMAND_PROMPT)
        .prompt(EXECUTED_PROMPT)
        .command("wake", CommandSpec::line(""))
        .command("ds", CommandSpec::line("ds").with_parser(status_response))
        .command(
            "set",
            CommandSpec::new("", CommandBuilder::ParamAssign { separator: "=" }).with_parser(set_response),
        )
        .command("startnow", CommandSpec::line("startnow"))
        .command("stop", CommandSpec::line("stop"))
        .command("ts", CommandSpec::line("ts"))
        .command("dcal", CommandSpec::line("dcal"))
        .command("tt", diagnostic("tt"))
        .command("tc", diagnostic("tc"))
        .command("tp", diagnostic("tp"))
        .decoder(CtdSample::new()?)
        .discovery(DiscoveryRecipe::probe("wake").with_status("ds", classify_status))
        .autosample(AutosampleRecipe {
            start: "startnow",
            stop: "stop",
            confirm: None,
        })
        .parameters(
            ParameterRecipe::new(
                ReadRecipe::Block {
                    command: "ds",
                    field_separator: Some(','),
                },
                "set",
            )
            .with_wire_name("interval", "sampleinterval"),
        )
        .self_test(&["tt", "tc", "tp"])
        .acquire_sample("ts")
        .custom(CustomCommand::new("display_calibration", "dcal", &[ProtocolState::Command]));

    for entry in parameters()? {
        builder = builder.param(entry);
    }
    builder.build()
}
