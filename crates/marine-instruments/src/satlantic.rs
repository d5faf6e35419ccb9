//! Satlantic OCR-507 multispectral radiometer (SPKIR).
//!
//! The instrument streams binary telemetry frames once it leaves its command
//! line with `exit`, and answers at the `[Auto]$` prompt otherwise. A burst of
//! Control-C characters interrupts streaming.
//!
//! # Frame layout
//!
//! ```text
//! SATDI7 | serial (4 digits) | timer (ddddddd.dd) | payload | 2 whitespace bytes
//! ```
//!
//! The payload holds one big-endian `u32` per channel followed by a 12-byte
//! trailer: `i16` sample delay, then `u16` input voltage sense, analog
//! voltage sense, internal temperature, frame counter and checksum. The
//! counter and checksum are full 16-bit words, so a one-channel payload is
//! 16 bytes and every added channel adds four.
//!
//! A standard instrument carries up to [`MAX_CHANNELS`] channels. By default
//! the channel count is inferred from each frame's length; a fitted count
//! can be fixed with [`vocabulary_with_channels`].
//!
//! Besides samples the stream carries the configuration block printed when
//! the instrument resets and the identification banner printed by `id`. Both
//! are recognized and emitted as particles; the configuration block also
//! refreshes the parameter cache.

use marine_core::{Error, ParamType, ParamValue, Particle, ProtocolState, Result};
use marine_driver::vocabulary::{AutosampleRecipe, CustomCommand, DiscoveryRecipe, ParameterRecipe, ReadRecipe};
use marine_driver::Vocabulary;
use marine_protocol::{
    CR, CTRL_C, Chunk, ChunkMatcher, CommandBuilder, CommandResult, CommandSpec, PackedReader, ParamVisibility,
    ParameterEntry, RegexMatcher, Response, SampleDecoder, TextFields, formatters, parsers, reject_if_contains,
};
use regex::{Captures, Regex};
use std::ops::Range;
use std::time::Duration;
use tracing::{debug, trace};

pub const INSTRUMENT: &str = "satlantic_ocr507";
pub const PROMPT: &str = "[Auto]$";

pub const SAMPLE_PARTICLE: &str = "prest_real_time";
pub const CONFIGURATION_PARTICLE: &str = "prest_configuration_data";
pub const IDENTIFICATION_PARTICLE: &str = "prest_identification_data";

/// Channels fitted to a standard OCR-507.
pub const MAX_CHANNELS: usize = 7;

const FRAME_ID: &[u8] = b"SATDI7";
const HEADER_LEN: usize = 20;
const TRAILER_LEN: usize = 12;
const TERMINATOR_LEN: usize = 2;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(45);
const WAKE_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_DELAY: Duration = Duration::from_millis(400);
const BREAK_COUNT: usize = 7;

const CONFIGURATION_BLOCK: &str = concat!(
    r"Telemetry Baud Rate: (\d+) bps\s+",
    r"Maximum Frame Rate: ([\w.]+)[^\r\n]*\s+",
    r"Initialize Silent Mode: (\w+)\s+",
    r"Initialize Power Down: (\w+)\s+",
    r"Initialize Automatic Telemetry: (\w+)\s+",
    r"Network Mode: (\w+)\s+",
    r"Network Address: (\d+)\s+",
    r"Network Baud Rate: (\d+) bps",
);

const IDENTIFICATION_BANNER: &str = concat!(
    r"Satlantic ([^\r\n]*?)\s+",
    r"Copyright \(C\)[^\r\n]*\s+",
    r"Firmware([^\r\n]*?)\s+",
    r"Instrument([^\r\n]*?)\s+",
    r"S/N: (\d{4})",
);

fn compile(particle_type: &str, pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| Error::config(format!("invalid pattern for {particle_type}: {e}")))
}

fn is_terminator(bytes: &[u8]) -> bool {
    bytes.iter().all(u8::is_ascii_whitespace)
}

/// Whether `bytes` is consistent with the start of a frame header.
fn header_fits(bytes: &[u8]) -> bool {
    bytes.iter().take(HEADER_LEN).enumerate().all(|(i, &b)| match i {
        0..6 => b == FRAME_ID[i],
        17 => b == b'.',
        _ => b.is_ascii_digit(),
    })
}

/// First frame id fully contained in `buffer[from..to]`.
fn find_frame_id(buffer: &[u8], from: usize, to: usize) -> Option<usize> {
    let to = to.min(buffer.len());
    if from >= to {
        return None;
    }
    buffer[from..to]
        .windows(FRAME_ID.len())
        .position(|w| w == FRAME_ID)
        .map(|i| i + from)
}

/// How many channels each frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channels {
    /// Inferred from each frame's length, 1 to [`MAX_CHANNELS`].
    Auto,
    /// Every frame carries exactly this many.
    Fixed(usize),
}

/// Length-aware matcher for `SATDI7` frames.
///
/// The payload is binary, so the terminator alone cannot delimit a frame.
///
/// With a fixed channel count a frame is reported once its declared length
/// plus terminator has arrived. A frame interrupted by the next header, or
/// lacking its terminator at the declared length, is reported up to that
/// point so the decoder can reject it.
///
/// With an inferred count a frame ends where the next header starts, as long
/// as that header lies within reach of the longest layout. Without one, the
/// decision waits until the whole look-ahead window has arrived and takes
/// the shortest layout ending in a terminator. Either way a frame is cut from
/// bytes already received only, so the result does not depend on how the
/// stream was split.
#[derive(Debug, Clone)]
pub struct FrameMatcher {
    channels: Channels,
}

impl FrameMatcher {
    pub fn new(channels: Channels) -> Self {
        Self { channels }
    }

    /// End of the frame at `start`, or `None` while more bytes are needed.
    fn cut(&self, buffer: &[u8], start: usize) -> Option<usize> {
        match self.channels {
            Channels::Fixed(channels) => cut_fixed(buffer, start, channels),
            Channels::Auto => cut_inferred(buffer, start),
        }
    }
}

impl ChunkMatcher for FrameMatcher {
    fn name(&self) -> &str {
        SAMPLE_PARTICLE
    }

    fn find_all(&self, buffer: &[u8]) -> Vec<Range<usize>> {
        let mut ranges = Vec::new();
        let mut cursor = 0;

        while let Some(start) = find_frame_id(buffer, cursor, buffer.len()) {
            if !header_fits(&buffer[start..]) {
                trace!(offset = start, "bogus frame header skipped");
                cursor = start + 1;
                continue;
            }
            let Some(cut) = self.cut(buffer, start) else {
                break;
            };
            ranges.push(start..cut);
            cursor = cut;
        }
        ranges
    }
}

fn cut_fixed(buffer: &[u8], start: usize, channels: usize) -> Option<usize> {
    let end = start + frame_len(channels);
    if buffer.len() < end {
        return None;
    }

    // An interrupted frame: the next one starts inside this one.
    if let Some(next) = find_frame_id(buffer, start + HEADER_LEN, end) {
        return Some(next);
    }
    if is_terminator(&buffer[end - TERMINATOR_LEN..end]) {
        return Some(end);
    }

    // No terminator where one belongs. Cut before a header that straddles
    // the declared end, or at the end itself.
    let lookahead_end = end + FRAME_ID.len() - 1;
    if buffer.len() < lookahead_end {
        return None;
    }
    let cut = find_frame_id(buffer, end + 1 - FRAME_ID.len(), lookahead_end).unwrap_or(end);
    trace!(offset = start, len = cut - start, "unterminated frame");
    Some(cut)
}

fn cut_inferred(buffer: &[u8], start: usize) -> Option<usize> {
    // Headers starting anywhere up to the end of the longest layout.
    let window_end = start + frame_len(MAX_CHANNELS) + FRAME_ID.len();
    if let Some(next) = find_frame_id(buffer, start + HEADER_LEN, window_end) {
        return Some(next);
    }
    if buffer.len() < window_end {
        return None;
    }

    let shortest = start + frame_len(1);
    let cut = (1..=MAX_CHANNELS)
        .map(|channels| start + frame_len(channels))
        .find(|&end| is_terminator(&buffer[end - TERMINATOR_LEN..end]))
        .unwrap_or(shortest);
    trace!(offset = start, len = cut - start, "frame not followed by a header");
    Some(cut)
}

fn payload_len(channels: usize) -> usize {
    4 * channels + TRAILER_LEN
}

fn frame_len(channels: usize) -> usize {
    HEADER_LEN + payload_len(channels) + TERMINATOR_LEN
}

/// Channel count whose layout is exactly `len` payload bytes.
fn channels_for(len: usize) -> Option<usize> {
    let readings = len.checked_sub(TRAILER_LEN)?;
    let channels = readings / 4;
    (readings % 4 == 0 && (1..=MAX_CHANNELS).contains(&channels)).then_some(channels)
}

fn ascii<'a>(particle_type: &str, bytes: &'a [u8]) -> Result<&'a str> {
    std::str::from_utf8(bytes).map_err(|_| Error::sample(particle_type, "non-ASCII header field"))
}

/// Decoder for binary telemetry frames.
#[derive(Debug, Clone)]
pub struct SampleFrame {
    channels: Channels,
}

impl SampleFrame {
    /// Frames carrying exactly `channels` channels.
    pub fn new(channels: usize) -> Self {
        Self {
            channels: Channels::Fixed(channels),
        }
    }

    /// Frames whose channel count is read from their length.
    pub fn inferred() -> Self {
        Self {
            channels: Channels::Auto,
        }
    }

    pub fn channels(&self) -> Channels {
        self.channels
    }
}

impl Default for SampleFrame {
    fn default() -> Self {
        Self::inferred()
    }
}

impl SampleDecoder for SampleFrame {
    fn particle_type(&self) -> &str {
        SAMPLE_PARTICLE
    }

    fn matcher(&self) -> Result<Box<dyn ChunkMatcher>> {
        Ok(Box::new(FrameMatcher::new(self.channels)))
    }

    fn decode(&self, chunk: &Chunk) -> Result<Particle> {
        let data = &chunk.data[..];
        if data.len() < HEADER_LEN + TERMINATOR_LEN || !header_fits(&data[..HEADER_LEN]) {
            return Err(Error::sample(SAMPLE_PARTICLE, "malformed frame header"));
        }
        let (body, terminator) = data.split_at(data.len() - TERMINATOR_LEN);
        if !is_terminator(terminator) {
            return Err(Error::sample(SAMPLE_PARTICLE, "frame not terminated"));
        }
        let payload = &body[HEADER_LEN..];
        let channels = match self.channels {
            Channels::Fixed(channels) => {
                let expected = payload_len(channels);
                if payload.len() != expected {
                    return Err(Error::sample(
                        SAMPLE_PARTICLE,
                        format!("payload truncated: {} of {expected} bytes", payload.len()),
                    ));
                }
                channels
            }
            Channels::Auto => channels_for(payload.len()).ok_or_else(|| {
                Error::sample(
                    SAMPLE_PARTICLE,
                    format!(
                        "payload truncated: {} bytes fit no 1 to {MAX_CHANNELS} channel layout",
                        payload.len()
                    ),
                )
            })?,
        };

        let serial = ascii(SAMPLE_PARTICLE, &data[6..10])?;
        let timer_text = ascii(SAMPLE_PARTICLE, &data[10..HEADER_LEN])?;
        let timer: f64 = timer_text
            .parse()
            .map_err(|_| Error::sample(SAMPLE_PARTICLE, format!("timer '{timer_text}' is not a number")))?;

        let mut particle = Particle::new(SAMPLE_PARTICLE, chunk.timestamp)
            .with_field("instrument_id", "SATDI7")
            .with_field("serial_number", serial)
            .with_field("timer", timer);

        let mut reader = PackedReader::new(SAMPLE_PARTICLE, payload);
        for channel in 1..=channels {
            particle.push(format!("channel_{channel}"), reader.u32_be()?);
        }
        particle.push("sample_delay", reader.i16_be()?);
        particle.push("vin_sense", reader.u16_be()?);
        particle.push("va_sense", reader.u16_be()?);
        particle.push("internal_temperature", reader.u16_be()?);
        particle.push("frame_counter", reader.u16_be()?);
        particle.push("checksum", reader.u16_be()?);
        reader.finish()?;
        Ok(particle)
    }
}

/// Configuration block printed after a reset.
#[derive(Debug, Clone)]
pub struct ConfigurationBlock {
    regex: Regex,
}

impl ConfigurationBlock {
    pub fn new() -> Result<Self> {
        Ok(Self {
            regex: compile(CONFIGURATION_PARTICLE, CONFIGURATION_BLOCK)?,
        })
    }
}

impl SampleDecoder for ConfigurationBlock {
    fn particle_type(&self) -> &str {
        CONFIGURATION_PARTICLE
    }

    fn matcher(&self) -> Result<Box<dyn ChunkMatcher>> {
        let pattern = format!(r"{CONFIGURATION_BLOCK}\s\s");
        Ok(Box::new(RegexMatcher::new(CONFIGURATION_PARTICLE, &pattern)?))
    }

    fn decode(&self, chunk: &Chunk) -> Result<Particle> {
        let text = chunk.text();
        let fields = TextFields::capture(CONFIGURATION_PARTICLE, &self.regex, &text)?;
        let rate_text = fields.str(2)?;
        let max_frame_rate = frame_rate(rate_text)
            .ok_or_else(|| Error::sample(CONFIGURATION_PARTICLE, format!("frame rate '{rate_text}'")))?;

        Ok(Particle::new(CONFIGURATION_PARTICLE, chunk.timestamp)
            .with_field("tele_baud_rate", fields.int(1)?)
            .with_field("max_frame_rate", max_frame_rate)
            .with_field("initialize_silent_mode", fields.str(3)?)
            .with_field("initialize_power_down", fields.str(4)?)
            .with_field("initialize_auto_telemetry", fields.str(5)?)
            .with_field("network_mode", fields.str(6)?)
            .with_field("network_address", fields.int(7)?)
            .with_field("network_baud_rate", fields.int(8)?))
    }

    fn carries_status(&self) -> bool {
        true
    }
}

/// Banner printed by `id`.
#[derive(Debug, Clone)]
pub struct IdentificationBanner {
    regex: Regex,
}

impl IdentificationBanner {
    pub fn new() -> Result<Self> {
        Ok(Self {
            regex: compile(IDENTIFICATION_PARTICLE, IDENTIFICATION_BANNER)?,
        })
    }
}

impl SampleDecoder for IdentificationBanner {
    fn particle_type(&self) -> &str {
        IDENTIFICATION_PARTICLE
    }

    fn matcher(&self) -> Result<Box<dyn ChunkMatcher>> {
        let pattern = format!(r"{IDENTIFICATION_BANNER}\s\s");
        Ok(Box::new(RegexMatcher::new(IDENTIFICATION_PARTICLE, &pattern)?))
    }

    fn decode(&self, chunk: &Chunk) -> Result<Particle> {
        let text = chunk.text();
        let fields = TextFields::capture(IDENTIFICATION_PARTICLE, &self.regex, &text)?;
        let trim = |s: &str| s.trim_start_matches([':', ' ']).trim().to_string();
        Ok(Particle::new(IDENTIFICATION_PARTICLE, chunk.timestamp)
            .with_field("model", fields.str(1)?)
            .with_field("firmware", trim(fields.str(2)?))
            .with_field("instrument", trim(fields.str(3)?))
            .with_field("serial_number", fields.str(4)?))
    }
}

/// `AUTO` means the instrument picks its own rate, reported as 0.
fn frame_rate(text: &str) -> Option<f64> {
    if text.eq_ignore_ascii_case("AUTO") {
        Some(0.0)
    } else {
        text.parse().ok()
    }
}

fn parse_frame_rate(caps: &Captures<'_>) -> Result<ParamValue> {
    let text = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
    frame_rate(text)
        .map(ParamValue::Float)
        .ok_or_else(|| Error::parameter(format!("'{text}' is not a frame rate")))
}

fn format_frame_rate(value: &ParamValue) -> Result<String> {
    match value.as_f64() {
        Some(rate) if rate == 0.0 => Ok("AUTO".to_string()),
        Some(rate) => Ok(rate.to_string()),
        None => Err(Error::parameter(format!("expected a frame rate, got {}", value.value_type()))),
    }
}

fn show_response(response: &Response) -> Result<CommandResult> {
    reject_if_contains("show", response, &["Usage", "unknown command", "Invalid command"])?;
    Ok(CommandResult::Text(response.body().to_string()))
}

fn set_response(response: &Response) -> Result<CommandResult> {
    reject_if_contains("set", response, &["Usage", "Invalid command", "Invalid value"])?;
    Ok(CommandResult::Ack)
}

/// Parameter table of the OCR-507.
pub fn parameters() -> Result<Vec<ParameterEntry>> {
    Ok(vec![
        ParameterEntry::new("maxrate", r"Maximum Frame Rate: ([\w.]+)", ParamType::Float)?
            .with_parse(parse_frame_rate)
            .with_format(format_frame_rate)
            .with_default(ParamValue::Float(0.0))
            .with_display_name("Maximum frame rate (Hz)")
            .startup(),
        ParameterEntry::new("initsm", r"Initialize Silent Mode: (\w+)", ParamType::Bool)?
            .with_parse(parsers::on_off)
            .with_format(formatters::on_off)
            .with_default(ParamValue::Bool(true))
            .with_display_name("Initialize silent mode (on|off)")
            .startup(),
        ParameterEntry::new("initat", r"Initialize Automatic Telemetry: (\w+)", ParamType::Bool)?
            .with_parse(parsers::on_off)
            .with_format(formatters::on_off)
            .with_visibility(ParamVisibility::ReadOnly)
            .with_display_name("Initialize auto telemetry (on|off)"),
    ])
}

/// Vocabulary for an OCR-507 fitted with 1 to [`MAX_CHANNELS`] channels,
/// read from each frame.
///
/// # Errors
/// Returns `Error::Config` if the vocabulary fails validation.
pub fn vocabulary() -> Result<Vocabulary> {
    build(SampleFrame::inferred())
}

/// Vocabulary for an OCR-507 fitted with exactly `channels` channels.
/// Frames of any other length are rejected.
///
/// # Errors
/// Returns `Error::Config` if `channels` is outside 1 to [`MAX_CHANNELS`] or
/// the vocabulary fails validation.
pub fn vocabulary_with_channels(channels: usize) -> Result<Vocabulary> {
    if !(1..=MAX_CHANNELS).contains(&channels) {
        return Err(Error::config(format!(
            "{INSTRUMENT}: {channels} channels, expected 1 to {MAX_CHANNELS}"
        )));
    }
    build(SampleFrame::new(channels))
}

fn build(frames: SampleFrame) -> Result<Vocabulary> {
    debug!(channels = ?frames.channels(), "building {INSTRUMENT} vocabulary");
    let dialogue = |spec: CommandSpec| spec.with_timeout(COMMAND_TIMEOUT).with_write_delay(WRITE_DELAY);

    let mut builder = Vocabulary::builder(INSTRUMENT)
        .prompt(PROMPT)
        .command(
            "wake",
            CommandSpec::new("", CommandBuilder::Control(CR)).with_timeout(WAKE_TIMEOUT),
        )
        .command(
            "break",
            CommandSpec::new(
                "",
                CommandBuilder::RepeatedControl {
                    byte: CTRL_C,
                    count: BREAK_COUNT,
                },
            )
            .with_write_delay(WRITE_DELAY)
            .no_response(),
        )
        .command("id", dialogue(CommandSpec::line("id")))
        .command(
            "show",
            dialogue(CommandSpec::new("show", CommandBuilder::ParamFetch)).with_parser(show_response),
        )
        .command(
            "set",
            dialogue(CommandSpec::new("set", CommandBuilder::ParamAssign { separator: " " })).with_parser(set_response),
        )
        .command("save", dialogue(CommandSpec::line("save")))
        .command("exit", CommandSpec::line("exit").with_write_delay(WRITE_DELAY).no_response())
        .decoder(frames)
        .decoder(ConfigurationBlock::new()?)
        .decoder(IdentificationBanner::new()?)
        .discovery(DiscoveryRecipe::probe("wake").with_wake("break"))
        .autosample(AutosampleRecipe {
            start: "exit",
            stop: "break",
            confirm: Some("wake"),
        })
        .parameters(ParameterRecipe::new(ReadRecipe::PerParam { command: "show" }, "set").with_save("save"))
        .custom(CustomCommand::new("display_id", "id", &[ProtocolState::Command]).cached());

    for entry in parameters()? {
        builder = builder.param(entry);
    }
    builder.build()
}
