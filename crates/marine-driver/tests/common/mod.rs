//! Shared fixtures for marine-driver integration tests.

#![allow(dead_code)]

use marine_core::{Error, ParamType, ParamValue, Particle, ProtocolState, Result};
use marine_driver::mock::{MockPortAgent, MockPortAgentHandle};
use marine_driver::vocabulary::{AutosampleRecipe, CustomCommand, DiscoveryRecipe, ParameterRecipe, ReadRecipe};
use marine_driver::{DriverEvent, DriverHandle, ProtocolConfig, Vocabulary};
use marine_protocol::{
    Chunk, ChunkMatcher, CommandBuilder, CommandResult, CommandSpec, ParamVisibility, ParameterEntry, RegexMatcher,
    Response, SampleDecoder, TextFields,
};
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Status text the bench instrument answers `ds` with.
pub const STATUS: &str = "navg = 4\r\nsamples = 10\r\nS>";

static RECORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^#(-?\d+\.\d+)").unwrap());

/// Install a test-writer subscriber once. Honors `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// `#12.5\r\n` style records.
pub struct Record;

impl SampleDecoder for Record {
    fn particle_type(&self) -> &str {
        "record"
    }

    fn matcher(&self) -> Result<Box<dyn ChunkMatcher>> {
        Ok(Box::new(RegexMatcher::new("record", r"#[^#\r\n]*\r\n")?))
    }

    fn decode(&self, chunk: &Chunk) -> Result<Particle> {
        let text = chunk.text();
        let fields = TextFields::capture("record", &RECORD, &text)?;
        Ok(Particle::new("record", chunk.timestamp).with_field("value", fields.float(1)?))
    }
}

fn verdict(response: &Response) -> Result<CommandResult> {
    let body = response.body();
    if body.is_empty() {
        return Err(Error::protocol("empty test response", response.text.clone()));
    }
    Ok(CommandResult::Verdict {
        passed: !body.contains("FAIL"),
        text: body.to_string(),
    })
}

/// A small CTD-like instrument with every capability declared.
pub fn bench_vocabulary() -> Vocabulary {
    Vocabulary::builder("bench")
        .prompt("S>")
        .command("ds", CommandSpec::line("ds"))
        .command("set", CommandSpec::new("", CommandBuilder::ParamAssign { separator: "=" }))
        .command("startnow", CommandSpec::line("startnow"))
        .command("stop", CommandSpec::line("stop").with_timeout(Duration::from_secs(1)))
        .command("ts", CommandSpec::line("ts"))
        .command("tc", CommandSpec::line("tc").with_parser(verdict))
        .command("tt", CommandSpec::line("tt").with_parser(verdict))
        .command("id", CommandSpec::line("id"))
        .param(
            ParameterEntry::new("navg", r"navg = (\d+)", ParamType::Int)
                .unwrap()
                .with_default(ParamValue::Int(4))
                .startup(),
        )
        .param(
            ParameterEntry::new("samples", r"samples = (\d+)", ParamType::Int)
                .unwrap()
                .with_visibility(ParamVisibility::ReadOnly),
        )
        .decoder(Record)
        .discovery(DiscoveryRecipe::probe("ds"))
        .autosample(AutosampleRecipe {
            start: "startnow",
            stop: "stop",
            confirm: None,
        })
        .parameters(ParameterRecipe::new(ReadRecipe::block("ds"), "set"))
        .self_test(&["tc", "tt"])
        .acquire_sample("ts")
        .custom(CustomCommand::new("display_id", "id", &[ProtocolState::Command]).cached())
        .build()
        .unwrap()
}

/// Spawn a driver over a fresh mock that answers `ds` with [`STATUS`].
pub fn spawn_bench(config: ProtocolConfig) -> (DriverHandle, MockPortAgentHandle) {
    init_tracing();
    let (transport, inbound, agent) = MockPortAgent::new();
    agent.on("ds\r\n", STATUS);
    let driver = marine_driver::spawn(bench_vocabulary(), config, transport, inbound).unwrap();
    (driver, agent)
}

/// Read events until one satisfies `pred`, returning it.
pub async fn wait_for<F>(driver: &mut DriverHandle, pred: F) -> DriverEvent
where
    F: Fn(&DriverEvent) -> bool,
{
    let deadline = Duration::from_secs(120);
    tokio::time::timeout(deadline, async {
        loop {
            match driver.recv_event().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("event not observed")
}

/// Every event queued so far.
pub fn drain(driver: &mut DriverHandle) -> Vec<DriverEvent> {
    let mut out = Vec::new();
    while let Some(event) = driver.try_recv_event() {
        out.push(event);
    }
    out
}

pub fn count_sent(agent: &MockPortAgentHandle, command: &[u8]) -> usize {
    agent.sent().iter().filter(|s| &s[..] == command).count()
}
