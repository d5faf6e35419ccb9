//! Satlantic OCR-507 dialogue against the mock port agent.

mod common;

use common::{
    SATLANTIC_BANNER, SATLANTIC_CONFIG_BLOCK, count_sent, drain, samples_of, satlantic_frame, script_satlantic, show,
    spawn, wait_for,
};
use marine_core::{Error, ParamValue, ProtocolState};
use marine_driver::{DriverEvent, ParamSelection, ProtocolConfig};
use marine_instruments::satlantic::{self, CONFIGURATION_PARTICLE, IDENTIFICATION_PARTICLE, MAX_CHANNELS, SAMPLE_PARTICLE};
use marine_protocol::{CR, CTRL_C};
use std::collections::BTreeMap;

fn start() -> (marine_driver::DriverHandle, marine_driver::mock::MockPortAgentHandle) {
    let (driver, agent) = spawn(satlantic::vocabulary().unwrap(), ProtocolConfig::default());
    script_satlantic(&agent);
    (driver, agent)
}

#[tokio::test(start_paused = true)]
async fn test_discover_reads_each_parameter() {
    let (driver, agent) = start();

    assert_eq!(driver.discover().await.unwrap(), ProtocolState::Command);
    let config = driver.get(ParamSelection::All).await.unwrap();
    assert_eq!(config["maxrate"], ParamValue::Float(0.0));
    assert_eq!(config["initsm"], ParamValue::Bool(true));
    assert_eq!(config["initat"], ParamValue::Bool(false));

    // Startup defaults already hold, so nothing is written.
    assert!(agent.sent().iter().all(|s| !s.starts_with(b"set ")));
    assert_eq!(count_sent(&agent, b"show maxrate\r\n"), 1);
    driver.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_set_read_only_parameter_sends_nothing() {
    let (driver, agent) = start();
    driver.discover().await.unwrap();
    agent.clear_sent();

    let values = BTreeMap::from([("initat".to_string(), ParamValue::Bool(true))]);
    let err = driver.set(values).await.unwrap_err();
    assert!(matches!(err, Error::Parameter(ref m) if m.contains("read-only")));
    assert_eq!(agent.sent_count(), 0);
    driver.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_set_max_rate_is_verified_and_saved() {
    let (mut driver, agent) = start();
    driver.discover().await.unwrap();
    drain(&mut driver);

    agent.on("set maxrate 2\r\n", "set maxrate 2\r\n[Auto]$");
    agent.on("save\r\n", "save\r\nConfiguration parameters saved.\r\n[Auto]$");
    show(&agent, "maxrate", "Maximum Frame Rate: 2 Hz");

    let values = BTreeMap::from([("maxrate".to_string(), ParamValue::Int(2))]);
    let config = driver.set(values).await.unwrap();
    assert_eq!(config["maxrate"], ParamValue::Float(2.0));
    assert_eq!(count_sent(&agent, b"save\r\n"), 1);

    let change = wait_for(&mut driver, |e| matches!(e, DriverEvent::ConfigChange(_))).await;
    assert!(matches!(change, DriverEvent::ConfigChange(c) if c["maxrate"] == ParamValue::Float(2.0)));
    driver.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_value_that_does_not_take_is_out_of_range() {
    let (driver, agent) = start();
    driver.discover().await.unwrap();
    agent.on("set maxrate 50\r\n", "set maxrate 50\r\n[Auto]$");

    let values = BTreeMap::from([("maxrate".to_string(), ParamValue::Float(50.0))]);
    let err = driver.set(values).await.unwrap_err();
    assert!(matches!(err, Error::Parameter(ref m) if m.contains("out of range")));
    assert_eq!(count_sent(&agent, b"save\r\n"), 0);
    driver.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_truncated_frame_reported_and_stream_continues() {
    let (mut driver, agent) = start();
    driver.discover().await.unwrap();

    assert_eq!(driver.start_autosample().await.unwrap(), ProtocolState::Autosample);
    assert_eq!(count_sent(&agent, b"exit\r\n"), 1);
    drain(&mut driver);

    let good = satlantic_frame(MAX_CHANNELS, 3_003_176_485);
    let mut truncated = good[..30].to_vec();
    truncated.extend_from_slice(b"\r\n");
    agent.push(&truncated).await.unwrap();
    agent.push(&good).await.unwrap();
    // The next frame's header releases the good one.
    agent.push(&good[..6]).await.unwrap();

    let error = wait_for(&mut driver, |e| matches!(e, DriverEvent::SampleError { .. })).await;
    assert!(matches!(error, DriverEvent::SampleError { ref particle_type, .. } if particle_type == SAMPLE_PARTICLE));
    let sample = wait_for(&mut driver, |e| matches!(e, DriverEvent::Sample(_))).await;
    let DriverEvent::Sample(particle) = sample else {
        unreachable!()
    };
    assert_eq!(particle.particle_type, SAMPLE_PARTICLE);
    assert_eq!(particle.field("channel_1"), Some(&serde_json::json!(3_003_176_485u32)));
    assert!(samples_of(&drain(&mut driver), SAMPLE_PARTICLE).is_empty());

    assert_eq!(driver.stop_autosample().await.unwrap(), ProtocolState::Command);
    assert_eq!(count_sent(&agent, &[CTRL_C; 7]), 1);
    driver.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_reset_banner_refreshes_parameters() {
    let (mut driver, agent) = start();
    driver.discover().await.unwrap();
    driver.start_autosample().await.unwrap();
    drain(&mut driver);

    agent.push(SATLANTIC_CONFIG_BLOCK).await.unwrap();
    let particle = wait_for(&mut driver, |e| matches!(e, DriverEvent::Sample(_))).await;
    assert!(matches!(particle, DriverEvent::Sample(ref p) if p.particle_type == CONFIGURATION_PARTICLE));

    // initat flipped on; the cache answers without touching the instrument.
    agent.clear_sent();
    let config = driver.get(ParamSelection::names(["initat"])).await.unwrap();
    assert_eq!(config["initat"], ParamValue::Bool(true));
    assert_eq!(agent.sent_count(), 0);
    driver.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_discover_detects_streaming_radiometer() {
    let (driver, agent) = spawn(satlantic::vocabulary().unwrap(), ProtocolConfig::default());
    let mut frames = satlantic_frame(MAX_CHANNELS, 7);
    frames.extend_from_slice(&satlantic_frame(MAX_CHANNELS, 8));
    agent.on([CR], frames);

    assert_eq!(driver.discover().await.unwrap(), ProtocolState::Autosample);
    assert_eq!(count_sent(&agent, &[CR]), 1);
    driver.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_display_id_is_cached_and_emits_identification() {
    let (mut driver, agent) = start();
    driver.discover().await.unwrap();
    agent.on("id\r\n", format!("id\r\n{SATLANTIC_BANNER}[Auto]$"));

    let text = driver.custom("display_id").await.unwrap();
    assert!(text.contains("S/N: 0229"));
    let particle = wait_for(&mut driver, |e| matches!(e, DriverEvent::Sample(_))).await;
    assert!(matches!(particle, DriverEvent::Sample(ref p) if p.particle_type == IDENTIFICATION_PARTICLE));

    assert_eq!(driver.custom("display_id").await.unwrap(), text);
    assert_eq!(count_sent(&agent, b"id\r\n"), 1);
    driver.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_single_channel_stream_decodes_with_default_vocabulary() {
    let (mut driver, agent) = start();
    driver.discover().await.unwrap();
    driver.start_autosample().await.unwrap();
    drain(&mut driver);

    // One-channel frame from serial 4321, sent back to back.
    let frame = b"SATDI743210152801.56\xb3\x00\xd6\x25\x9f\xde\x9f\xdc\xdc\x37\x37\xd8\x00\x01\x00\xc0  ";
    assert_eq!(frame.len(), 38);
    agent.push(&frame[..]).await.unwrap();
    agent.push(&frame[..]).await.unwrap();

    let sample = wait_for(&mut driver, |e| {
        matches!(e, DriverEvent::Sample(_) | DriverEvent::SampleError { .. })
    })
    .await;
    let DriverEvent::Sample(particle) = sample else {
        panic!("frame rejected: {sample:?}")
    };
    assert_eq!(particle.particle_type, SAMPLE_PARTICLE);
    assert_eq!(particle.field("serial_number"), Some(&serde_json::json!("4321")));
    assert_eq!(particle.field("channel_1"), Some(&serde_json::json!(3_003_176_485u32)));
    assert_eq!(particle.field("sample_delay"), Some(&serde_json::json!(-24_610)));
    assert_eq!(particle.field("checksum"), Some(&serde_json::json!(192)));
    assert!(particle.field("channel_2").is_none());
    driver.shutdown().await;
}
