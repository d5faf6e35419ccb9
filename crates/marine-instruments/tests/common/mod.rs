//! Scripted instruments for marine-instruments integration tests.

#![allow(dead_code)]

use marine_driver::mock::{MockPortAgent, MockPortAgentHandle};
use marine_driver::{DriverEvent, DriverHandle, ProtocolConfig, Vocabulary};
use marine_protocol::CR;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn spawn(vocab: Vocabulary, config: ProtocolConfig) -> (DriverHandle, MockPortAgentHandle) {
    init_tracing();
    let (transport, inbound, agent) = MockPortAgent::new();
    let driver = marine_driver::spawn(vocab, config, transport, inbound).unwrap();
    (driver, agent)
}

pub async fn wait_for<F>(driver: &mut DriverHandle, pred: F) -> DriverEvent
where
    F: Fn(&DriverEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(300), async {
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

pub fn samples_of<'a>(events: &'a [DriverEvent], particle_type: &str) -> Vec<&'a DriverEvent> {
    events
        .iter()
        .filter(|e| matches!(e, DriverEvent::Sample(p) if p.particle_type == particle_type))
        .collect()
}

// ---------------------------------------------------------------------------
// Satlantic OCR-507
// ---------------------------------------------------------------------------

pub const SATLANTIC_CONFIG_BLOCK: &str = "Telemetry Baud Rate: 57600 bps\r\n\
    Maximum Frame Rate: AUTO\r\n\
    Initialize Silent Mode: on\r\n\
    Initialize Power Down: off\r\n\
    Initialize Automatic Telemetry: on\r\n\
    Network Mode: off\r\n\
    Network Address: 99\r\n\
    Network Baud Rate: 38400 bps\r\n";

pub const SATLANTIC_BANNER: &str = "Satlantic OCR-507 Multispectral Radiometer\r\n\
    Copyright (C) 2002, Satlantic Inc. All rights reserved.\r\n\
    Firmware version: 3.0A - SatNet Type A\r\n\
    Instrument: SATDI7\r\n\
    S/N: 0229\r\n";

/// A telemetry frame with `channels` channels, the first reading `first`.
pub fn satlantic_frame(channels: usize, first: u32) -> Vec<u8> {
    let mut frame = b"SATDI702290152801.56".to_vec();
    frame.extend_from_slice(&first.to_be_bytes());
    for _ in 1..channels {
        frame.extend_from_slice(&0u32.to_be_bytes());
    }
    frame.extend_from_slice(&(-24_610i16).to_be_bytes());
    for value in [40_924u16, 56_375, 14_296, 1, 192] {
        frame.extend_from_slice(&value.to_be_bytes());
    }
    frame.extend_from_slice(b"\r\n");
    frame
}

/// Answer the wake command and every parameter fetch at the prompt.
pub fn script_satlantic(agent: &MockPortAgentHandle) {
    agent.on([CR], "\r\n[Auto]$");
    show(agent, "maxrate", "Maximum Frame Rate: AUTO");
    show(agent, "initsm", "Initialize Silent Mode: on");
    show(agent, "initat", "Initialize Automatic Telemetry: off");
}

pub fn show(agent: &MockPortAgentHandle, name: &str, line: &str) {
    agent.on(
        format!("show {name}\r\n"),
        format!("show {name}\r\n{line}\r\n[Auto]$"),
    );
}

// ---------------------------------------------------------------------------
// Sea-Bird SBE 16plus
// ---------------------------------------------------------------------------

/// `ds` report with the given logging status and sample interval.
pub fn seabird_status(status: &str, interval: u32) -> String {
    format!(
        "SBE 16plus V 2.5  SERIAL NO. 6841    28 Feb 2013 16:39:31\r\n\
         vbatt = 23.4, vlith =  8.0, ioper =  61.4 ma, ipump =   0.3 ma,\r\n\
         status = {status}\r\n\
         samples = 12, free = 4386530\r\n\
         sample interval = {interval} seconds, number of measurements per sample = 4\r\n\
         transmit real-time = yes\r\n\
         output salinity = no, output sound velocity = no\r\n\
         serial sync mode disabled\r\n\
         S>"
    )
}

pub fn script_seabird(agent: &MockPortAgentHandle, status: &str) {
    agent.on("\r\n", "\r\nS>");
    agent.on("ds\r\n", seabird_status(status, 10));
}
