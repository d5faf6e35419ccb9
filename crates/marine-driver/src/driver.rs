//! Async driver task and the handle used to talk to it.
//!
//! [`spawn`] moves a [`Protocol`] into a Tokio task that owns it for the
//! lifetime of the connection. The task serves one [`DriverHandle`] request at
//! a time and, between requests, routes unsolicited inbound bytes and the
//! deferred self-test event. Upward notifications are read from the handle
//! with [`DriverHandle::recv_event`].
//!
//! The loop uses `tokio::select! { biased; }` to prioritize:
//! 1. Cancellation
//! 2. Requests from the handle
//! 3. The deferred event, when one is armed
//! 4. Unsolicited inbound data

use crate::config::ProtocolConfig;
use crate::protocol::{DriverEvent, EventArgs, EventReply, ParamSelection, Protocol};
use crate::transport::{Inbound, Transport};
use crate::vocabulary::Vocabulary;
use bytes::Bytes;
use marine_core::constants::DEFAULT_COMMAND_CHANNEL_CAPACITY;
use marine_core::{Error, ParamValue, Particle, ProtocolEvent, ProtocolState, Result};
use std::collections::BTreeMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

/// A request sent from the handle to the driver task.
enum DriverCommand {
    Event {
        event: ProtocolEvent,
        args: EventArgs,
        reply: oneshot::Sender<Result<EventReply>>,
    },
    CurrentState {
        reply: oneshot::Sender<ProtocolState>,
    },
}

/// Handle to a running driver task.
pub struct DriverHandle {
    commands: mpsc::Sender<DriverCommand>,
    events: mpsc::Receiver<DriverEvent>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    connection_id: Uuid,
    instrument: &'static str,
}

/// Spawn the driver task for one connection.
///
/// Must be called from within a Tokio runtime.
///
/// # Errors
/// Returns `Error::Config` if the vocabulary or configuration is invalid.
pub fn spawn<T: Transport>(
    vocab: Vocabulary,
    config: ProtocolConfig,
    transport: T,
    inbound: mpsc::Receiver<Inbound>,
) -> Result<DriverHandle> {
    config.validate()?;
    let (events_tx, events) = mpsc::channel(config.event_channel_capacity);
    let protocol = Protocol::new(vocab, config, transport, inbound, events_tx)?;
    let connection_id = protocol.connection_id();
    let instrument = protocol.instrument_name();

    let (commands, commands_rx) = mpsc::channel(DEFAULT_COMMAND_CHANNEL_CAPACITY);
    let cancel = CancellationToken::new();
    let span = info_span!("driver", instrument, %connection_id);
    let task = tokio::spawn(driver_loop(protocol, commands_rx, cancel.clone()).instrument(span));

    Ok(DriverHandle {
        commands,
        events,
        cancel,
        task,
        connection_id,
        instrument,
    })
}

async fn driver_loop<T: Transport>(
    mut protocol: Protocol<T>,
    mut commands: mpsc::Receiver<DriverCommand>,
    cancel: CancellationToken,
) {
    info!("driver task started");
    loop {
        let deferred = protocol.deferred_deadline();

        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("driver task cancelled");
                break;
            }

            command = commands.recv() => match command {
                Some(DriverCommand::Event { event, args, reply }) => {
                    // A pending dispatch may wait out a long deadline.
                    let result = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            debug!(%event, "driver task cancelled mid-request");
                            break;
                        }
                        result = protocol.handle(event, args) => result,
                    };
                    if reply.send(result).is_err() {
                        debug!(%event, "requester went away before the reply");
                    }
                }
                Some(DriverCommand::CurrentState { reply }) => {
                    let _ = reply.send(protocol.current_state());
                }
                None => {
                    debug!("all driver handles dropped");
                    break;
                }
            },

            _ = sleep_until(deferred.unwrap_or_else(Instant::now)), if deferred.is_some() => {
                protocol.fire_deferred().await;
            }

            inbound = protocol.recv_inbound() => {
                protocol.on_inbound(inbound).await;
            }
        }
    }
    info!(state = %protocol.current_state(), "driver task stopped");
}

fn unexpected(event: ProtocolEvent, reply: EventReply) -> Error {
    Error::protocol(format!("unexpected reply to {event}: {reply:?}"), "")
}

fn task_gone() -> Error {
    Error::ConnectionLost("driver task has stopped".into())
}

impl DriverHandle {
    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn instrument_name(&self) -> &'static str {
        self.instrument
    }

    /// Send an event to the task and await the handler's reply.
    pub async fn request(&self, event: ProtocolEvent, args: EventArgs) -> Result<EventReply> {
        let (reply, reply_rx) = oneshot::channel();
        self.commands
            .send(DriverCommand::Event { event, args, reply })
            .await
            .map_err(|_| task_gone())?;
        reply_rx.await.map_err(|_| task_gone())?
    }

    async fn request_state(&self, event: ProtocolEvent) -> Result<ProtocolState> {
        match self.request(event, EventArgs::None).await? {
            EventReply::State(state) => Ok(state),
            other => Err(unexpected(event, other)),
        }
    }

    async fn request_config(&self, event: ProtocolEvent, args: EventArgs) -> Result<BTreeMap<String, ParamValue>> {
        match self.request(event, args).await? {
            EventReply::Config(config) => Ok(config),
            other => Err(unexpected(event, other)),
        }
    }

    /// Interrogate the instrument and enter the state it reports.
    pub async fn discover(&self) -> Result<ProtocolState> {
        self.request_state(ProtocolEvent::Discover).await
    }

    /// Read parameters. In Command state missing values are fetched from the
    /// instrument; elsewhere the cache answers.
    pub async fn get(&self, selection: ParamSelection) -> Result<BTreeMap<String, ParamValue>> {
        self.request_config(ProtocolEvent::Get, EventArgs::Get(selection)).await
    }

    /// Write parameters and return the verified configuration.
    pub async fn set(&self, values: BTreeMap<String, ParamValue>) -> Result<BTreeMap<String, ParamValue>> {
        self.request_config(ProtocolEvent::Set, EventArgs::Set(values)).await
    }

    pub async fn start_autosample(&self) -> Result<ProtocolState> {
        self.request_state(ProtocolEvent::StartAutosample).await
    }

    pub async fn stop_autosample(&self) -> Result<ProtocolState> {
        self.request_state(ProtocolEvent::StopAutosample).await
    }

    pub async fn start_direct(&self) -> Result<ProtocolState> {
        self.request_state(ProtocolEvent::StartDirect).await
    }

    /// Forward operator bytes verbatim during a direct-access session.
    pub async fn execute_direct(&self, data: impl Into<Bytes>) -> Result<()> {
        let event = ProtocolEvent::ExecuteDirect;
        match self.request(event, EventArgs::Direct(data.into())).await? {
            EventReply::Ack => Ok(()),
            other => Err(unexpected(event, other)),
        }
    }

    /// End the direct-access session. Returns the rediscovered state.
    pub async fn stop_direct(&self) -> Result<ProtocolState> {
        self.request_state(ProtocolEvent::StopDirect).await
    }

    /// Enter the Test state. The report arrives later as
    /// [`DriverEvent::TestResult`], after which the driver is back in Command.
    pub async fn run_self_test(&self) -> Result<ProtocolState> {
        self.request_state(ProtocolEvent::Test).await
    }

    /// Poll one sample while in Command state.
    pub async fn acquire_sample(&self) -> Result<Particle> {
        let event = ProtocolEvent::AcquireSample;
        match self.request(event, EventArgs::None).await? {
            EventReply::Particle(particle) => Ok(particle),
            other => Err(unexpected(event, other)),
        }
    }

    /// Run a custom command declared by the vocabulary and return its text.
    pub async fn custom(&self, name: &'static str) -> Result<String> {
        let event = ProtocolEvent::Custom(name);
        match self.request(event, EventArgs::None).await? {
            EventReply::Text(text) => Ok(text),
            other => Err(unexpected(event, other)),
        }
    }

    pub async fn current_state(&self) -> Result<ProtocolState> {
        let (reply, reply_rx) = oneshot::channel();
        self.commands
            .send(DriverCommand::CurrentState { reply })
            .await
            .map_err(|_| task_gone())?;
        reply_rx.await.map_err(|_| task_gone())
    }

    /// Wait for the next upward notification. `None` once the task has
    /// stopped and every queued event was read.
    pub async fn recv_event(&mut self) -> Option<DriverEvent> {
        self.events.recv().await
    }

    pub fn try_recv_event(&mut self) -> Option<DriverEvent> {
        self.events.try_recv().ok()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the task and wait for it to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(connection_id = %self.connection_id, error = %e, "driver task ended abnormally");
        }
    }
}
