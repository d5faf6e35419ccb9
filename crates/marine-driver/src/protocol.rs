//! Protocol engine: one instance per connection.
//!
//! [`Protocol`] owns the state machine, the dispatcher, the chunker and the
//! parameter cache of a single instrument connection. Events from above are
//! looked up in the handler table for the current state and run by
//! [`Protocol::handle`]. A handler may request a state change; the engine then
//! runs the old state's `Exit`, records the transition, emits a
//! `StateChange` and runs the new state's `Enter`.
//!
//! Inbound bytes that arrive outside of a command exchange go to the chunker,
//! or to the operator while a direct-access session is active.

use crate::config::ProtocolConfig;
use crate::direct_access::DirectAccess;
use crate::dispatcher::Dispatcher;
use crate::fsm::InstrumentFsm;
use crate::transport::{Inbound, Transport};
use crate::vocabulary::{ReadRecipe, Vocabulary};
use bytes::Bytes;
use chrono::Utc;
use marine_core::{
    Error, ParamValue, Particle, ProtocolEvent, ProtocolState, Result, SelfTestReport, TestOutcome,
};
use marine_protocol::{Chunk, Chunker, CommandResult, CommandSpec, ParamDict, ParamVisibility};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Action run for a `(state, event)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    Noop,
    Discover,
    EnterCommand,
    GetParams,
    GetCached,
    SetParams,
    StartAutosample,
    StopAutosample,
    StartDirect,
    EnterDirect,
    ExecuteDirect,
    StopDirect,
    ExitDirect,
    StartTest,
    EnterTest,
    ExitTest,
    RunTest,
    AcquireSample,
    /// Index into the vocabulary's custom commands.
    Custom(usize),
}

/// Which parameters a Get asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamSelection {
    All,
    Names(Vec<String>),
}

impl ParamSelection {
    pub fn names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Names(names.into_iter().map(Into::into).collect())
    }
}

/// Arguments carried by an event.
#[derive(Debug, Clone, Default)]
pub enum EventArgs {
    #[default]
    None,
    Get(ParamSelection),
    Set(BTreeMap<String, ParamValue>),
    Direct(Bytes),
}

/// Result of a handled event.
#[derive(Debug, Clone, PartialEq)]
pub enum EventReply {
    Ack,
    /// State the protocol is in after the event.
    State(ProtocolState),
    Config(BTreeMap<String, ParamValue>),
    Particle(Particle),
    Text(String),
}

/// Notification published upward.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum DriverEvent {
    StateChange(ProtocolState),
    Sample(Particle),
    ConfigChange(BTreeMap<String, ParamValue>),
    DirectAccessData(#[serde(serialize_with = "serialize_lossy")] Bytes),
    SampleError { particle_type: String, message: String },
    TestResult(SelfTestReport),
}

fn serialize_lossy<S: serde::Serializer>(data: &Bytes, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(data))
}

type Outcome = Result<(Option<ProtocolState>, EventReply)>;

/// Build the handler table for the capabilities `vocab` declares.
pub fn handler_table(vocab: &Vocabulary) -> Result<InstrumentFsm<Handler>> {
    use ProtocolEvent as E;
    use ProtocolState as S;

    let mut builder = InstrumentFsm::builder(S::Unknown)
        .state(S::Unknown, Handler::Noop, Handler::Noop)
        .on(S::Unknown, E::Discover, Handler::Discover)
        .state(S::Command, Handler::EnterCommand, Handler::Noop)
        .on(S::Command, E::Get, Handler::GetParams)
        .on(S::Command, E::Set, Handler::SetParams)
        .on(S::Command, E::StartDirect, Handler::StartDirect)
        .state(S::DirectAccess, Handler::EnterDirect, Handler::ExitDirect)
        .on(S::DirectAccess, E::ExecuteDirect, Handler::ExecuteDirect)
        .on(S::DirectAccess, E::StopDirect, Handler::StopDirect);

    if vocab.autosample.is_some() {
        builder = builder
            .on(S::Command, E::StartAutosample, Handler::StartAutosample)
            .state(S::Autosample, Handler::Noop, Handler::Noop)
            .on(S::Autosample, E::Get, Handler::GetCached)
            .on(S::Autosample, E::StopAutosample, Handler::StopAutosample);
    }
    if vocab.self_test.is_some() {
        builder = builder
            .on(S::Command, E::Test, Handler::StartTest)
            .state(S::Test, Handler::EnterTest, Handler::ExitTest)
            .on(S::Test, E::Get, Handler::GetCached)
            .on(S::Test, E::RunTest, Handler::RunTest);
    }
    if vocab.acquire_sample.is_some() {
        builder = builder.on(S::Command, E::AcquireSample, Handler::AcquireSample);
    }
    for (index, custom) in vocab.custom.iter().enumerate() {
        for state in &custom.states {
            builder = builder.on(*state, E::Custom(custom.name), Handler::Custom(index));
        }
    }
    builder.build()
}

/// Apply every status line of `text` to `params`.
fn refresh_params(params: &mut ParamDict, text: &str, field_separator: Option<char>) {
    match field_separator {
        Some(sep) => {
            for line in text.lines() {
                for field in line.split(sep) {
                    if let Err(e) = params.update(field.trim()) {
                        warn!(field = %field.trim(), error = %e, "unparseable parameter field");
                    }
                }
            }
        }
        None => {
            params.update_lines(text);
        }
    }
}

/// Whether a read-back value confirms a written one.
fn same_value(actual: &ParamValue, expected: &ParamValue) -> bool {
    match (actual, expected) {
        (ParamValue::Float(a), ParamValue::Float(b)) => (a - b).abs() <= 1e-9 * b.abs().max(1.0),
        _ => actual == expected,
    }
}

/// State of one instrument connection.
pub struct Protocol<T: Transport> {
    connection_id: Uuid,
    vocab: Vocabulary,
    config: ProtocolConfig,
    fsm: InstrumentFsm<Handler>,
    dispatcher: Dispatcher<T>,
    chunker: Chunker,
    params: ParamDict,
    direct: DirectAccess,
    events: mpsc::Sender<DriverEvent>,
    startup_applied: bool,
    deferred: Option<(Instant, ProtocolEvent)>,
    samples_seen: u64,
    custom_cache: HashMap<&'static str, String>,
}

impl<T: Transport> Protocol<T> {
    /// Create the engine for one connection.
    ///
    /// # Errors
    /// Returns `Error::Config` if the configuration is invalid, a decoder
    /// matcher cannot be built, or the handler table is inconsistent.
    pub fn new(
        mut vocab: Vocabulary,
        config: ProtocolConfig,
        transport: T,
        inbound: mpsc::Receiver<Inbound>,
        events: mpsc::Sender<DriverEvent>,
    ) -> Result<Self> {
        config.validate()?;
        let fsm = handler_table(&vocab)?;

        let mut chunker = Chunker::with_max_buffer(config.max_chunker_buffer);
        for decoder in &vocab.decoders {
            chunker.add_boxed_matcher(decoder.matcher()?);
        }

        for name in config.startup.keys() {
            if !vocab.params.contains(name) {
                warn!(instrument = vocab.name, param = %name, "startup value for unknown parameter ignored");
            }
        }

        let params = std::mem::take(&mut vocab.params);
        let dispatcher = Dispatcher::new(transport, inbound, vocab.newline);
        let connection_id = Uuid::new_v4();
        info!(instrument = vocab.name, %connection_id, "protocol created");

        Ok(Self {
            connection_id,
            vocab,
            config,
            fsm,
            dispatcher,
            chunker,
            params,
            direct: DirectAccess::new(),
            events,
            startup_applied: false,
            deferred: None,
            samples_seen: 0,
            custom_cache: HashMap::new(),
        })
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn instrument_name(&self) -> &'static str {
        self.vocab.name
    }

    pub fn current_state(&self) -> ProtocolState {
        self.fsm.current_state()
    }

    pub fn fsm(&self) -> &InstrumentFsm<Handler> {
        &self.fsm
    }

    pub fn params(&self) -> &ParamDict {
        &self.params
    }

    pub fn dispatcher(&self) -> &Dispatcher<T> {
        &self.dispatcher
    }

    /// Run the handler registered for `event` in the current state.
    ///
    /// # Errors
    /// Returns `Error::UnhandledEvent` if the current state has no handler
    /// for `event`, or the handler's error. A lost connection forces the
    /// state to Unknown.
    pub async fn handle(&mut self, event: ProtocolEvent, args: EventArgs) -> Result<EventReply> {
        let handler = self.fsm.handler(event)?;
        debug!(state = %self.fsm.current_state(), %event, ?handler, "handling event");

        match self.invoke(handler, args).await {
            Ok((next, reply)) => {
                if let Some(next) = next {
                    self.change_state(next, event).await;
                }
                Ok(reply)
            }
            Err(e) => {
                warn!(state = %self.fsm.current_state(), %event, error = %e, "event failed");
                if matches!(e, Error::ConnectionLost(_)) {
                    self.change_state(ProtocolState::Unknown, event).await;
                }
                Err(e)
            }
        }
    }

    /// Wait for the next inbound batch outside of a command exchange.
    pub async fn recv_inbound(&mut self) -> Inbound {
        self.dispatcher.recv().await
    }

    /// Route an inbound batch received outside of a command exchange.
    pub async fn on_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Data(data) if self.fsm.current_state() == ProtocolState::DirectAccess => {
                let data = self.direct.filter(data);
                if !data.is_empty() {
                    self.emit(DriverEvent::DirectAccessData(data));
                }
            }
            Inbound::Data(data) => {
                self.chunker.add_data(&data, Utc::now());
                self.process_chunks();
            }
            Inbound::Closed(reason) => {
                warn!(%reason, "connection closed");
                self.deferred = None;
                self.change_state(ProtocolState::Unknown, ProtocolEvent::Exit).await;
            }
        }
    }

    /// Deadline of the pending deferred event, if any.
    pub fn deferred_deadline(&self) -> Option<Instant> {
        self.deferred.map(|(at, _)| at)
    }

    /// Run the pending deferred event.
    pub async fn fire_deferred(&mut self) {
        if let Some((_, event)) = self.deferred.take() {
            debug!(%event, "firing deferred event");
            if let Err(e) = self.handle(event, EventArgs::None).await {
                warn!(%event, error = %e, "deferred event failed");
            }
        }
    }

    async fn change_state(&mut self, next: ProtocolState, cause: ProtocolEvent) {
        let current = self.fsm.current_state();
        if next == current {
            return;
        }
        if let Some(exit) = self.fsm.handler_for(current, ProtocolEvent::Exit)
            && let Err(e) = self.invoke(exit, EventArgs::None).await
        {
            warn!(state = %current, error = %e, "exit handler failed");
        }

        if self.fsm.transition(next, cause).is_none() {
            return;
        }
        info!(from = %current, to = %next, %cause, "state changed");
        self.emit(DriverEvent::StateChange(next));

        if let Some(enter) = self.fsm.handler_for(next, ProtocolEvent::Enter)
            && let Err(e) = self.invoke(enter, EventArgs::None).await
        {
            warn!(state = %next, error = %e, "enter handler failed");
            if matches!(e, Error::ConnectionLost(_)) && next != ProtocolState::Unknown {
                self.abandon(next).await;
            }
        }
    }

    /// Leave `state` for Unknown after the link dropped during its Enter.
    ///
    /// Follows the same Exit, transition, Enter order as a regular change.
    async fn abandon(&mut self, state: ProtocolState) {
        if let Some(exit) = self.fsm.handler_for(state, ProtocolEvent::Exit)
            && let Err(e) = self.invoke(exit, EventArgs::None).await
        {
            warn!(%state, error = %e, "exit handler failed");
        }
        if self.fsm.transition(ProtocolState::Unknown, ProtocolEvent::Exit).is_none() {
            return;
        }
        info!(from = %state, to = %ProtocolState::Unknown, "state abandoned after connection loss");
        self.emit(DriverEvent::StateChange(ProtocolState::Unknown));
        if let Some(enter) = self.fsm.handler_for(ProtocolState::Unknown, ProtocolEvent::Enter)
            && let Err(e) = self.invoke(enter, EventArgs::None).await
        {
            warn!(state = %ProtocolState::Unknown, error = %e, "enter handler failed");
        }
    }

    async fn invoke(&mut self, handler: Handler, args: EventArgs) -> Outcome {
        match handler {
            Handler::Noop => Ok((None, EventReply::Ack)),
            Handler::Discover | Handler::StopDirect => {
                let state = self.discover().await?;
                Ok((Some(state), EventReply::State(state)))
            }
            Handler::EnterCommand => self.enter_command().await,
            Handler::GetParams => self.get_params(args).await,
            Handler::GetCached => self.get_cached(args),
            Handler::SetParams => self.set_params(args).await,
            Handler::StartAutosample => self.start_autosample().await,
            Handler::StopAutosample => self.stop_autosample().await,
            Handler::StartDirect => Ok((Some(ProtocolState::DirectAccess), EventReply::State(ProtocolState::DirectAccess))),
            Handler::EnterDirect | Handler::ExitDirect => {
                self.direct.clear();
                Ok((None, EventReply::Ack))
            }
            Handler::ExecuteDirect => self.execute_direct(args),
            Handler::StartTest => Ok((Some(ProtocolState::Test), EventReply::State(ProtocolState::Test))),
            Handler::EnterTest => {
                let at = Instant::now() + self.config.self_test_delay();
                self.deferred = Some((at, ProtocolEvent::RunTest));
                Ok((None, EventReply::Ack))
            }
            Handler::ExitTest => {
                self.deferred = None;
                Ok((None, EventReply::Ack))
            }
            Handler::RunTest => self.run_tests().await,
            Handler::AcquireSample => self.acquire_sample().await,
            Handler::Custom(index) => self.run_custom(index).await,
        }
    }

    async fn discover(&mut self) -> Result<ProtocolState> {
        let recipe = self.vocab.discovery;
        let attempts = self.config.break_attempts;
        let mut last_response = String::new();

        for attempt in 1..=attempts {
            let seen = self.samples_seen;
            match self.run(recipe.probe, &[]).await {
                Ok(_) => {
                    let Some(status) = recipe.status else {
                        debug!(attempt, "prompt found, instrument in command mode");
                        return Ok(ProtocolState::Command);
                    };
                    let result = self.run(status.command, &[]).await?;
                    let text = result.text().unwrap_or_default();
                    return (status.classify)(text).ok_or_else(|| {
                        Error::protocol(format!("'{}' response names no known state", status.command), text)
                    });
                }
                Err(e) if e.is_transient() => {
                    if self.samples_seen > seen {
                        debug!(attempt, samples = self.samples_seen - seen, "samples streaming");
                        return Ok(ProtocolState::Autosample);
                    }
                    debug!(attempt, error = %e, "no prompt during discovery");
                    last_response = e.response().unwrap_or_default().to_string();
                }
                Err(e) => return Err(e),
            }

            if let Some(wake) = recipe.wake {
                match self.run(wake, &[]).await {
                    Ok(_) => {}
                    Err(e) if e.is_transient() => trace!(error = %e, "wakeup unanswered"),
                    Err(e) => return Err(e),
                }
            }
        }

        Err(Error::protocol(
            format!("instrument state not established after {attempts} attempt(s)"),
            last_response,
        ))
    }

    async fn enter_command(&mut self) -> Outcome {
        let before = self.params.get_config();
        let outcome = self.sync_command_entry().await;
        self.emit_drift(&before);
        outcome.map(|()| (None, EventReply::Ack))
    }

    async fn sync_command_entry(&mut self) -> Result<()> {
        self.read_all().await?;
        if self.startup_applied {
            return Ok(());
        }
        self.startup_applied = true;

        let pending = self.startup_values();
        if pending.is_empty() {
            return Ok(());
        }
        info!(count = pending.len(), "applying startup parameters");
        self.write_params(&pending).await
    }

    /// Startup values that differ from what the instrument reports.
    fn startup_values(&self) -> BTreeMap<String, ParamValue> {
        let mut wanted = BTreeMap::new();
        for entry in self.params.entries() {
            let configured = self.config.startup.get(entry.name());
            let value = match configured {
                Some(v) => v,
                None if entry.is_startup() => match entry.default_value() {
                    Some(v) => v,
                    None => continue,
                },
                None => continue,
            };
            if entry.visibility() == ParamVisibility::ReadOnly {
                if configured.is_some() {
                    warn!(param = %entry.name(), "startup value for read-only parameter ignored");
                }
                continue;
            }
            let Ok(value) = value.clone().coerce(entry.value_type()) else {
                warn!(param = %entry.name(), %value, "startup value has the wrong type");
                continue;
            };
            if entry.value().is_some_and(|current| same_value(current, &value)) {
                continue;
            }
            wanted.insert(entry.name().to_string(), value);
        }
        wanted
    }

    async fn get_params(&mut self, args: EventArgs) -> Outcome {
        let selection = match args {
            EventArgs::Get(selection) => selection,
            _ => return Err(Error::parameter("get requires a parameter selection")),
        };
        let before = self.params.get_config();
        let outcome = self.fetch(&selection).await;
        self.emit_drift(&before);
        outcome?;
        self.cached(&selection).map(|config| (None, EventReply::Config(config)))
    }

    async fn fetch(&mut self, selection: &ParamSelection) -> Result<()> {
        let missing: Vec<String> = match selection {
            ParamSelection::All => self
                .params
                .entries()
                .iter()
                .filter(|e| e.value().is_none())
                .map(|e| e.name().to_string())
                .collect(),
            ParamSelection::Names(names) => {
                for name in names {
                    self.params.entry(name)?;
                }
                names
                    .iter()
                    .filter(|n| self.params.get(n).is_err())
                    .cloned()
                    .collect()
            }
        };
        if missing.is_empty() {
            return Ok(());
        }
        match self.vocab.parameters.read {
            ReadRecipe::Block { .. } => self.read_all().await,
            ReadRecipe::PerParam { .. } => self.read_each(&missing).await,
        }
    }

    fn get_cached(&self, args: EventArgs) -> Outcome {
        let EventArgs::Get(selection) = args else {
            return Err(Error::parameter("get requires a parameter selection"));
        };
        self.cached(&selection).map(|config| (None, EventReply::Config(config)))
    }

    fn cached(&self, selection: &ParamSelection) -> Result<BTreeMap<String, ParamValue>> {
        match selection {
            ParamSelection::All => Ok(self.params.get_config()),
            ParamSelection::Names(names) => {
                let mut config = BTreeMap::new();
                for name in names {
                    config.insert(name.clone(), self.params.get(name)?.clone());
                }
                Ok(config)
            }
        }
    }

    async fn set_params(&mut self, args: EventArgs) -> Outcome {
        let EventArgs::Set(values) = args else {
            return Err(Error::parameter("set requires a parameter map"));
        };
        if values.is_empty() {
            return Err(Error::parameter("set requires at least one parameter"));
        }
        for (name, value) in &values {
            if self.params.is_read_only(name)? {
                return Err(Error::parameter(format!("{name} is read-only")));
            }
            self.params.format(name, value)?;
        }

        let before = self.params.get_config();
        let outcome = self.write_params(&values).await;
        self.emit_drift(&before);
        outcome?;
        Ok((None, EventReply::Config(self.params.get_config())))
    }

    /// Write `values`, read them back and save once they are confirmed.
    async fn write_params(&mut self, values: &BTreeMap<String, ParamValue>) -> Result<()> {
        let write = self.vocab.parameters.write;
        for (name, value) in values {
            let text = self.params.format(name, value)?;
            let wire = self.vocab.parameters.wire_name(name).to_string();
            debug!(param = %name, value = %text, "writing parameter");
            self.run(write, &[wire.as_str(), text.as_str()]).await?;
        }

        match self.vocab.parameters.read {
            ReadRecipe::Block { .. } => self.read_all().await?,
            ReadRecipe::PerParam { .. } => {
                let names: Vec<String> = values.keys().cloned().collect();
                self.read_each(&names).await?;
            }
        }

        for (name, value) in values {
            let expected = value.clone().coerce(self.params.entry(name)?.value_type())?;
            match self.params.get(name) {
                Ok(actual) if same_value(actual, &expected) => {}
                Ok(actual) => {
                    return Err(Error::parameter(format!(
                        "{name}={expected} out of range: instrument reports {actual}"
                    )));
                }
                Err(_) => {
                    return Err(Error::parameter(format!(
                        "{name}={expected} out of range: not reported after set"
                    )));
                }
            }
        }

        if let Some(save) = self.vocab.parameters.save {
            self.run(save, &[]).await?;
        }
        Ok(())
    }

    async fn read_all(&mut self) -> Result<()> {
        match self.vocab.parameters.read {
            ReadRecipe::Block {
                command,
                field_separator,
            } => {
                let result = self.run(command, &[]).await?;
                if let Some(text) = result.text() {
                    refresh_params(&mut self.params, text, field_separator);
                }
                Ok(())
            }
            ReadRecipe::PerParam { .. } => {
                let names: Vec<String> = self.params.names().map(str::to_string).collect();
                self.read_each(&names).await
            }
        }
    }

    async fn read_each(&mut self, names: &[String]) -> Result<()> {
        let command = self.vocab.parameters.read.command();
        for name in names {
            let result = self.run(command, &[name.as_str()]).await?;
            if let Some(text) = result.text() {
                refresh_params(&mut self.params, text, None);
            }
        }
        Ok(())
    }

    async fn start_autosample(&mut self) -> Outcome {
        let recipe = self
            .vocab
            .autosample
            .ok_or_else(|| Error::config("autosample not supported"))?;
        self.run(recipe.start, &[]).await?;
        Ok((Some(ProtocolState::Autosample), EventReply::State(ProtocolState::Autosample)))
    }

    async fn stop_autosample(&mut self) -> Outcome {
        let recipe = self
            .vocab
            .autosample
            .ok_or_else(|| Error::config("autosample not supported"))?;
        let attempts = self.config.break_attempts;
        let mut last_response = String::new();

        for attempt in 1..=attempts {
            let stopped = match self.run(recipe.stop, &[]).await {
                Ok(_) => match recipe.confirm {
                    Some(confirm) => self.run(confirm, &[]).await.map(|_| ()),
                    None => Ok(()),
                },
                Err(e) => Err(e),
            };
            match stopped {
                Ok(()) => {
                    debug!(attempt, "autosample stopped");
                    return Ok((Some(ProtocolState::Command), EventReply::State(ProtocolState::Command)));
                }
                Err(e) if e.is_transient() => {
                    debug!(attempt, error = %e, "stop not acknowledged");
                    last_response = e.response().unwrap_or_default().to_string();
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::protocol(
            format!("autosample did not stop after {attempts} attempt(s)"),
            last_response,
        ))
    }

    fn execute_direct(&mut self, args: EventArgs) -> Outcome {
        let EventArgs::Direct(data) = args else {
            return Err(Error::parameter("execute_direct requires data"));
        };
        self.dispatcher.send(&data)?;
        self.direct.record(data);
        Ok((None, EventReply::Ack))
    }

    async fn run_tests(&mut self) -> Outcome {
        let tests = self
            .vocab
            .self_test
            .as_ref()
            .map(|t| t.tests.clone())
            .ok_or_else(|| Error::config("self test not supported"))?;

        let mut outcomes = Vec::with_capacity(tests.len());
        for test in tests {
            let outcome = match self.run(test, &[]).await {
                Ok(CommandResult::Verdict { passed, text }) => TestOutcome {
                    name: test.to_string(),
                    passed,
                    response: text,
                },
                Ok(result) => TestOutcome {
                    name: test.to_string(),
                    passed: true,
                    response: result.text().unwrap_or_default().to_string(),
                },
                Err(e) => {
                    warn!(test, error = %e, "self test failed to run");
                    TestOutcome {
                        name: test.to_string(),
                        passed: false,
                        response: e.response().map(str::to_string).unwrap_or_else(|| e.to_string()),
                    }
                }
            };
            outcomes.push(outcome);
        }

        let report = SelfTestReport {
            outcomes,
            completed_at: Utc::now(),
        };
        info!(passed = report.passed(), "self test complete");
        self.emit(DriverEvent::TestResult(report));
        Ok((Some(ProtocolState::Command), EventReply::State(ProtocolState::Command)))
    }

    async fn acquire_sample(&mut self) -> Outcome {
        let command = self
            .vocab
            .acquire_sample
            .ok_or_else(|| Error::config("acquire sample not supported"))?;
        let result = self.run(command, &[]).await?;
        let text = result.text().unwrap_or_default().to_string();
        self.decode_response(&text)
            .into_iter()
            .next()
            .map(|p| (None, EventReply::Particle(p)))
            .ok_or_else(|| Error::protocol(format!("'{command}' response contained no sample"), text))
    }

    async fn run_custom(&mut self, index: usize) -> Outcome {
        let custom = self
            .vocab
            .custom
            .get(index)
            .cloned()
            .ok_or_else(|| Error::config(format!("no custom command #{index}")))?;
        if custom.cache
            && let Some(text) = self.custom_cache.get(custom.name)
        {
            return Ok((None, EventReply::Text(text.clone())));
        }

        let result = self.run(custom.command, &[]).await?;
        let text = result.text().unwrap_or_default().to_string();
        self.decode_response(&text);
        if custom.cache {
            self.custom_cache.insert(custom.name, text.clone());
        }
        Ok((None, EventReply::Text(text)))
    }

    /// Run a vocabulary command with connection overrides applied.
    ///
    /// Chunks released to the chunker during the exchange are processed
    /// whether or not the command succeeded.
    async fn run(&mut self, name: &str, args: &[&str]) -> Result<CommandResult> {
        let spec = self.command_spec(name)?;
        let result = if spec.awaits_response {
            self.dispatcher.do_cmd_resp(&spec, args, &mut self.chunker).await
        } else {
            self.dispatcher
                .do_cmd_no_resp(&spec, args, &mut self.chunker)
                .await
                .map(|()| CommandResult::Ack)
        };
        self.process_chunks();
        result
    }

    fn command_spec(&self, name: &str) -> Result<CommandSpec> {
        let mut spec = self
            .vocab
            .commands
            .get(name)
            .cloned()
            .ok_or_else(|| Error::config(format!("{}: no command '{name}'", self.vocab.name)))?;
        if spec.prompts.is_empty() {
            spec.prompts = self.vocab.prompts.clone();
        }
        self.config.apply(name, &mut spec);
        Ok(spec)
    }

    fn process_chunks(&mut self) {
        while let Some(chunk) = self.chunker.next_chunk() {
            self.decode_chunk(&chunk);
        }
    }

    /// Decode every unit contained in a claimed response.
    fn decode_response(&mut self, text: &str) -> Vec<Particle> {
        // The response body lost its last line terminator.
        let data = Bytes::from(format!("{text}{}", self.vocab.newline));
        self.chunker
            .extract(&data, Utc::now())
            .iter()
            .filter_map(|chunk| self.decode_chunk(chunk))
            .collect()
    }

    fn decode_chunk(&mut self, chunk: &Chunk) -> Option<Particle> {
        let Some(decoder) = self.vocab.decoders.get(chunk.matcher) else {
            warn!(tag = %chunk.tag, "chunk without decoder dropped");
            return None;
        };
        match decoder.decode(chunk) {
            Ok(particle) => {
                if decoder.carries_status() {
                    let before = self.params.get_config();
                    refresh_params(&mut self.params, &chunk.text(), None);
                    self.emit_drift(&before);
                } else {
                    self.samples_seen += 1;
                }
                trace!(particle_type = %particle.particle_type, start = chunk.start, "sample decoded");
                self.emit(DriverEvent::Sample(particle.clone()));
                Some(particle)
            }
            Err(e) => {
                warn!(particle_type = decoder.particle_type(), start = chunk.start, error = %e, "sample dropped");
                self.emit(DriverEvent::SampleError {
                    particle_type: decoder.particle_type().to_string(),
                    message: e.to_string(),
                });
                None
            }
        }
    }

    fn emit_drift(&self, before: &BTreeMap<String, ParamValue>) {
        let after = self.params.get_config();
        if &after != before {
            debug!(params = after.len(), "configuration changed");
            self.emit(DriverEvent::ConfigChange(after));
        }
    }

    fn emit(&self, event: DriverEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(?event, "event channel full, event dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!("event receiver gone");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockPortAgent, MockPortAgentHandle, MockTransport};
    use crate::vocabulary::{AutosampleRecipe, CustomCommand, DiscoveryRecipe, ParameterRecipe};
    use marine_core::ParamType;
    use marine_protocol::{ChunkMatcher, CommandBuilder, ParameterEntry, RegexMatcher, SampleDecoder, TextFields};
    use regex::Regex;
    use std::sync::LazyLock;
    use std::time::Duration;

    static RECORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^#(-?\d+\.\d+)").unwrap());

    struct Record;

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

    fn vocabulary() -> Vocabulary {
        Vocabulary::builder("unit")
            .prompt("S>")
            .command("ds", CommandSpec::line("ds"))
            .command("set", CommandSpec::new("", CommandBuilder::ParamAssign { separator: "=" }))
            .command("start", CommandSpec::line("start"))
            .command("stop", CommandSpec::line("stop").with_timeout(Duration::from_secs(1)))
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
                start: "start",
                stop: "stop",
                confirm: None,
            })
            .parameters(ParameterRecipe::new(ReadRecipe::block("ds"), "set"))
            .custom(CustomCommand::new("display_id", "id", &[ProtocolState::Command]).cached())
            .build()
            .unwrap()
    }

    struct Fixture {
        protocol: Protocol<MockTransport>,
        agent: MockPortAgentHandle,
        events: mpsc::Receiver<DriverEvent>,
    }

    fn fixture(config: ProtocolConfig) -> Fixture {
        let (transport, inbound, agent) = MockPortAgent::new();
        let (tx, events) = mpsc::channel(64);
        let protocol = Protocol::new(vocabulary(), config, transport, inbound, tx).unwrap();
        Fixture { protocol, agent, events }
    }

    fn drain(events: &mut mpsc::Receiver<DriverEvent>) -> Vec<DriverEvent> {
        let mut out = Vec::new();
        while let Ok(e) = events.try_recv() {
            out.push(e);
        }
        out
    }

    async fn discovered(fixture: &mut Fixture) {
        fixture.agent.on("ds\r\n", "navg = 4\r\nsamples = 10\r\nS>");
        let state = fixture.protocol.handle(ProtocolEvent::Discover, EventArgs::None).await.unwrap();
        assert_eq!(state, EventReply::State(ProtocolState::Command));
    }

    #[test]
    fn test_handler_table_reflects_capabilities() {
        let fsm = handler_table(&vocabulary()).unwrap();
        assert!(fsm.supports(ProtocolState::Autosample));
        assert!(!fsm.supports(ProtocolState::Test));
        assert_eq!(
            fsm.handler_for(ProtocolState::Command, ProtocolEvent::Custom("display_id")),
            Some(Handler::Custom(0))
        );
        assert_eq!(fsm.handler_for(ProtocolState::Command, ProtocolEvent::AcquireSample), None);
        assert_eq!(
            fsm.handler_for(ProtocolState::Autosample, ProtocolEvent::Get),
            Some(Handler::GetCached)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unhandled_event_leaves_state_unchanged() {
        let mut f = fixture(ProtocolConfig::default());
        let err = f
            .protocol
            .handle(ProtocolEvent::StartAutosample, EventArgs::None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnhandledEvent { .. }));
        assert_eq!(f.protocol.current_state(), ProtocolState::Unknown);
        assert_eq!(f.agent.sent_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discover_enters_command_and_syncs_params() {
        let mut f = fixture(ProtocolConfig::default());
        discovered(&mut f).await;

        assert_eq!(f.protocol.current_state(), ProtocolState::Command);
        assert_eq!(f.protocol.params().get("navg").unwrap(), &ParamValue::Int(4));

        let events = drain(&mut f.events);
        assert_eq!(events[0], DriverEvent::StateChange(ProtocolState::Command));
        let changes = events.iter().filter(|e| matches!(e, DriverEvent::ConfigChange(_))).count();
        assert_eq!(changes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_value_from_config_is_applied_once() {
        let mut f = fixture(ProtocolConfig::default().with_startup("navg", 8_i64));
        f.agent.on("ds\r\n", "navg = 4\r\nsamples = 10\r\nS>");
        f.agent.on("navg=8\r\n", "S>");

        // The read-back still reports 4: verification fails inside Enter, the state holds.
        f.protocol.handle(ProtocolEvent::Discover, EventArgs::None).await.unwrap();
        assert_eq!(f.protocol.current_state(), ProtocolState::Command);

        f.protocol.handle(ProtocolEvent::StartDirect, EventArgs::None).await.unwrap();
        f.protocol.handle(ProtocolEvent::StopDirect, EventArgs::None).await.unwrap();
        assert_eq!(f.protocol.current_state(), ProtocolState::Command);

        let writes = f.agent.sent().iter().filter(|s| &s[..] == b"navg=8\r\n").count();
        assert_eq!(writes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_read_only_sends_nothing() {
        let mut f = fixture(ProtocolConfig::default());
        discovered(&mut f).await;
        f.agent.clear_sent();

        let values = BTreeMap::from([("samples".to_string(), ParamValue::Int(0))]);
        let err = f.protocol.handle(ProtocolEvent::Set, EventArgs::Set(values)).await.unwrap_err();
        assert!(matches!(err, Error::Parameter(ref m) if m.contains("read-only")));
        assert_eq!(f.agent.sent_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_verifies_read_back() {
        let mut f = fixture(ProtocolConfig::default());
        discovered(&mut f).await;
        drain(&mut f.events);

        f.agent.once("navg=2\r\n", "S>");
        f.agent.once("ds\r\n", "navg = 2\r\nsamples = 10\r\nS>");
        let values = BTreeMap::from([("navg".to_string(), ParamValue::Int(2))]);
        let reply = f.protocol.handle(ProtocolEvent::Set, EventArgs::Set(values)).await.unwrap();
        let EventReply::Config(config) = reply else {
            panic!("expected config reply");
        };
        assert_eq!(config["navg"], ParamValue::Int(2));
        assert_eq!(drain(&mut f.events).len(), 1);

        // The instrument ignores an out of range request.
        f.agent.once("navg=9999\r\n", "S>");
        f.agent.once("ds\r\n", "navg = 2\r\nsamples = 10\r\nS>");
        let values = BTreeMap::from([("navg".to_string(), ParamValue::Int(9999))]);
        let err = f.protocol.handle(ProtocolEvent::Set, EventArgs::Set(values)).await.unwrap_err();
        assert!(matches!(err, Error::Parameter(ref m) if m.contains("out of range")));
        assert!(drain(&mut f.events).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_autosample_streams_samples_and_serves_cached_get() {
        let mut f = fixture(ProtocolConfig::default());
        discovered(&mut f).await;
        f.agent.once("start\r\n", "S>");
        f.protocol.handle(ProtocolEvent::StartAutosample, EventArgs::None).await.unwrap();
        assert_eq!(f.protocol.current_state(), ProtocolState::Autosample);
        drain(&mut f.events);

        f.protocol.on_inbound(Inbound::Data(Bytes::from_static(b"#12.5\r\n#bad\r\n#1"))).await;
        let events = drain(&mut f.events);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], DriverEvent::Sample(p) if p.field("value") == Some(&serde_json::json!(12.5))));
        assert!(matches!(&events[1], DriverEvent::SampleError { particle_type, .. } if particle_type == "record"));

        let reply = f
            .protocol
            .handle(ProtocolEvent::Get, EventArgs::Get(ParamSelection::names(["navg"])))
            .await
            .unwrap();
        assert_eq!(reply, EventReply::Config(BTreeMap::from([("navg".to_string(), ParamValue::Int(4))])));
        let err = f
            .protocol
            .handle(ProtocolEvent::Get, EventArgs::Get(ParamSelection::names(["bogus"])))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownParameter(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_autosample_is_bounded() {
        let mut f = fixture(ProtocolConfig::default().with_break_attempts(3));
        discovered(&mut f).await;
        f.agent.once("start\r\n", "S>");
        f.protocol.handle(ProtocolEvent::StartAutosample, EventArgs::None).await.unwrap();
        f.agent.clear_sent();

        let err = f
            .protocol
            .handle(ProtocolEvent::StopAutosample, EventArgs::None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
        assert_eq!(f.agent.sent_count(), 3);
        assert_eq!(f.protocol.current_state(), ProtocolState::Autosample);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discover_detects_streaming_instrument() {
        let mut f = fixture(ProtocolConfig::default().with_timeout(Duration::from_secs(1)));
        f.agent.on("ds\r\n", "#1.5\r\n#2.5\r\n");

        let reply = f.protocol.handle(ProtocolEvent::Discover, EventArgs::None).await.unwrap();
        assert_eq!(reply, EventReply::State(ProtocolState::Autosample));
        let samples = drain(&mut f.events)
            .into_iter()
            .filter(|e| matches!(e, DriverEvent::Sample(_)))
            .count();
        assert_eq!(samples, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discover_gives_up_on_silent_instrument() {
        let mut f = fixture(ProtocolConfig::default().with_break_attempts(2).with_timeout(Duration::from_secs(1)));
        let err = f.protocol.handle(ProtocolEvent::Discover, EventArgs::None).await.unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
        assert_eq!(f.protocol.current_state(), ProtocolState::Unknown);
        assert_eq!(f.agent.sent_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_direct_access_strips_echo_and_rediscovers() {
        let mut f = fixture(ProtocolConfig::default());
        discovered(&mut f).await;
        f.protocol.handle(ProtocolEvent::StartDirect, EventArgs::None).await.unwrap();
        drain(&mut f.events);

        f.protocol
            .handle(ProtocolEvent::ExecuteDirect, EventArgs::Direct(Bytes::from_static(b"ts\r\n")))
            .await
            .unwrap();
        f.protocol.on_inbound(Inbound::Data(Bytes::from_static(b"ts\r\n 21.4\r\nS>"))).await;
        assert_eq!(
            drain(&mut f.events),
            vec![DriverEvent::DirectAccessData(Bytes::from_static(b" 21.4\r\nS>"))]
        );

        let reply = f.protocol.handle(ProtocolEvent::StopDirect, EventArgs::None).await.unwrap();
        assert_eq!(reply, EventReply::State(ProtocolState::Command));
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_command_is_cached() {
        let mut f = fixture(ProtocolConfig::default());
        discovered(&mut f).await;
        f.agent.on("id\r\n", "ID 0229\r\nS>");
        f.agent.clear_sent();

        for _ in 0..2 {
            let reply = f
                .protocol
                .handle(ProtocolEvent::Custom("display_id"), EventArgs::None)
                .await
                .unwrap();
            assert_eq!(reply, EventReply::Text("ID 0229".into()));
        }
        assert_eq!(f.agent.sent_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_loss_during_command_forces_unknown() {
        let mut f = fixture(ProtocolConfig::default());
        discovered(&mut f).await;
        drain(&mut f.events);
        f.agent.close("port agent exited").await;

        let values = BTreeMap::from([("navg".to_string(), ParamValue::Int(2))]);
        let err = f.protocol.handle(ProtocolEvent::Set, EventArgs::Set(values)).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionLost(_)));
        assert_eq!(f.protocol.current_state(), ProtocolState::Unknown);
        assert_eq!(drain(&mut f.events), vec![DriverEvent::StateChange(ProtocolState::Unknown)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_loss_during_command_entry_leaves_command() {
        let mut f = fixture(ProtocolConfig::default());
        f.agent.once("ds\r\n", "navg = 4\r\nsamples = 10\r\nS>");

        // The probe is answered; the link drops while Enter reads parameters.
        let agent = f.agent.clone();
        let (reply, ()) = tokio::join!(f.protocol.handle(ProtocolEvent::Discover, EventArgs::None), async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            agent.close("port agent exited").await;
        });
        assert_eq!(reply.unwrap(), EventReply::State(ProtocolState::Command));
        assert_eq!(f.protocol.current_state(), ProtocolState::Unknown);

        let path: Vec<(ProtocolState, ProtocolState)> =
            f.protocol.fsm().history().iter().map(|t| (t.from, t.to)).collect();
        assert_eq!(
            path,
            vec![
                (ProtocolState::Unknown, ProtocolState::Command),
                (ProtocolState::Command, ProtocolState::Unknown),
            ]
        );
        assert_eq!(
            drain(&mut f.events),
            vec![
                DriverEvent::StateChange(ProtocolState::Command),
                DriverEvent::StateChange(ProtocolState::Unknown),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_link_outside_command_forces_unknown() {
        let mut f = fixture(ProtocolConfig::default());
        discovered(&mut f).await;
        f.agent.close("port agent exited").await;

        let inbound = f.protocol.recv_inbound().await;
        assert!(matches!(inbound, Inbound::Closed(_)));
        f.protocol.on_inbound(inbound).await;
        assert_eq!(f.protocol.current_state(), ProtocolState::Unknown);
    }
}
