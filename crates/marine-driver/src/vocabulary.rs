//! Instrument vocabulary: everything an instrument supplies to the engine.
//!
//! A vocabulary names its commands, declares its parameters and sample
//! decoders, and describes how the generic handlers should use those
//! commands (how to discover the state, start and stop streaming, read and
//! write parameters, run diagnostics). The engine owns the mechanics; the
//! vocabulary owns the words.
//!
//! ```
//! use marine_driver::vocabulary::{DiscoveryRecipe, ParameterRecipe, ReadRecipe, Vocabulary};
//! use marine_protocol::CommandSpec;
//!
//! let vocab = Vocabulary::builder("demo")
//!     .prompt("S>")
//!     .command("ds", CommandSpec::line("ds"))
//!     .command("set", CommandSpec::line("set"))
//!     .discovery(DiscoveryRecipe::probe("ds"))
//!     .parameters(ParameterRecipe::new(ReadRecipe::block("ds"), "set"))
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(vocab.name(), "demo");
//! assert!(vocab.command("ds").is_some());
//! ```

use marine_core::{Error, ProtocolState, Result};
use marine_protocol::{CommandSpec, ParamDict, ParameterEntry, SampleDecoder};
use std::collections::HashMap;
use std::fmt;

/// Classifies the instrument state from the text of a status response.
pub type StatusClassifier = fn(&str) -> Option<ProtocolState>;

/// Status command consulted once the instrument answers at its prompt.
#[derive(Debug, Clone, Copy)]
pub struct StatusProbe {
    pub command: &'static str,
    pub classify: StatusClassifier,
}

/// How the instrument state is established from Unknown.
#[derive(Debug, Clone, Copy)]
pub struct DiscoveryRecipe {
    /// Command expected to end in a prompt when the instrument is at its
    /// command line.
    pub probe: &'static str,
    /// Without a status probe a prompt means Command.
    pub status: Option<StatusProbe>,
    /// Sent after a probe that found neither a prompt nor samples.
    pub wake: Option<&'static str>,
}

impl DiscoveryRecipe {
    pub fn probe(probe: &'static str) -> Self {
        Self {
            probe,
            status: None,
            wake: None,
        }
    }

    #[must_use]
    pub fn with_status(mut self, command: &'static str, classify: StatusClassifier) -> Self {
        self.status = Some(StatusProbe { command, classify });
        self
    }

    #[must_use]
    pub fn with_wake(mut self, wake: &'static str) -> Self {
        self.wake = Some(wake);
        self
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AutosampleRecipe {
    pub start: &'static str,
    /// Retried up to the configured break attempts.
    pub stop: &'static str,
    /// Issued after a stop to confirm the prompt came back.
    pub confirm: Option<&'static str>,
}

/// How parameter values are read back from the instrument.
#[derive(Debug, Clone, Copy)]
pub enum ReadRecipe {
    /// One status command reports every parameter. Lines may carry several
    /// parameters joined by `field_separator`.
    Block {
        command: &'static str,
        field_separator: Option<char>,
    },
    /// One fetch per parameter, the parameter name passed as argument.
    PerParam { command: &'static str },
}

impl ReadRecipe {
    pub fn block(command: &'static str) -> Self {
        Self::Block {
            command,
            field_separator: None,
        }
    }

    pub fn command(&self) -> &'static str {
        match self {
            Self::Block { command, .. } | Self::PerParam { command } => command,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParameterRecipe {
    pub read: ReadRecipe,
    /// Takes `[wire_name, formatted_value]`.
    pub write: &'static str,
    /// Persists written values once they are verified.
    pub save: Option<&'static str>,
    /// Parameter names whose set command uses a different word.
    pub wire_names: HashMap<&'static str, &'static str>,
}

impl ParameterRecipe {
    pub fn new(read: ReadRecipe, write: &'static str) -> Self {
        Self {
            read,
            write,
            save: None,
            wire_names: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_save(mut self, save: &'static str) -> Self {
        self.save = Some(save);
        self
    }

    #[must_use]
    pub fn with_wire_name(mut self, name: &'static str, wire: &'static str) -> Self {
        self.wire_names.insert(name, wire);
        self
    }

    pub fn wire_name<'a>(&self, name: &'a str) -> &'a str {
        self.wire_names.get(name).copied().unwrap_or(name)
    }
}

/// Built-in diagnostics run from the Test state.
#[derive(Debug, Clone)]
pub struct SelfTestRecipe {
    pub tests: Vec<&'static str>,
}

/// Named instrument-specific command.
#[derive(Debug, Clone)]
pub struct CustomCommand {
    pub name: &'static str,
    pub command: &'static str,
    /// States in which the command is legal.
    pub states: Vec<ProtocolState>,
    /// Answer repeated calls from the first response.
    pub cache: bool,
}

impl CustomCommand {
    pub fn new(name: &'static str, command: &'static str, states: &[ProtocolState]) -> Self {
        Self {
            name,
            command,
            states: states.to_vec(),
            cache: false,
        }
    }

    #[must_use]
    pub fn cached(mut self) -> Self {
        self.cache = true;
        self
    }
}

/// Complete description of one instrument dialect.
pub struct Vocabulary {
    pub(crate) name: &'static str,
    pub(crate) newline: &'static str,
    pub(crate) prompts: Vec<String>,
    pub(crate) commands: HashMap<&'static str, CommandSpec>,
    pub(crate) params: ParamDict,
    pub(crate) decoders: Vec<Box<dyn SampleDecoder>>,
    pub(crate) discovery: DiscoveryRecipe,
    pub(crate) autosample: Option<AutosampleRecipe>,
    pub(crate) parameters: ParameterRecipe,
    pub(crate) self_test: Option<SelfTestRecipe>,
    pub(crate) acquire_sample: Option<&'static str>,
    pub(crate) custom: Vec<CustomCommand>,
}

impl Vocabulary {
    pub fn builder(name: &'static str) -> VocabularyBuilder {
        VocabularyBuilder {
            name,
            newline: "\r\n",
            prompts: Vec::new(),
            commands: HashMap::new(),
            params: Vec::new(),
            decoders: Vec::new(),
            discovery: None,
            autosample: None,
            parameters: None,
            self_test: None,
            acquire_sample: None,
            custom: Vec::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn newline(&self) -> &'static str {
        self.newline
    }

    pub fn prompts(&self) -> &[String] {
        &self.prompts
    }

    pub fn command(&self, name: &str) -> Option<&CommandSpec> {
        self.commands.get(name)
    }

    pub fn params(&self) -> &ParamDict {
        &self.params
    }

    pub fn decoders(&self) -> &[Box<dyn SampleDecoder>] {
        &self.decoders
    }

    pub fn custom_commands(&self) -> &[CustomCommand] {
        &self.custom
    }

    pub fn supports_autosample(&self) -> bool {
        self.autosample.is_some()
    }

    pub fn supports_self_test(&self) -> bool {
        self.self_test.is_some()
    }
}

impl fmt::Debug for Vocabulary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut commands: Vec<_> = self.commands.keys().collect();
        commands.sort();
        let decoders: Vec<_> = self.decoders.iter().map(|d| d.particle_type()).collect();
        f.debug_struct("Vocabulary")
            .field("name", &self.name)
            .field("prompts", &self.prompts)
            .field("commands", &commands)
            .field("params", &self.params.len())
            .field("decoders", &decoders)
            .finish_non_exhaustive()
    }
}

pub struct VocabularyBuilder {
    name: &'static str,
    newline: &'static str,
    prompts: Vec<String>,
    commands: HashMap<&'static str, CommandSpec>,
    params: Vec<ParameterEntry>,
    decoders: Vec<Box<dyn SampleDecoder>>,
    discovery: Option<DiscoveryRecipe>,
    autosample: Option<AutosampleRecipe>,
    parameters: Option<ParameterRecipe>,
    self_test: Option<SelfTestRecipe>,
    acquire_sample: Option<&'static str>,
    custom: Vec<CustomCommand>,
}

impl VocabularyBuilder {
    #[must_use]
    pub fn newline(mut self, newline: &'static str) -> Self {
        self.newline = newline;
        self
    }

    /// Default prompt for commands that declare none.
    #[must_use]
    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompts.push(prompt.into());
        self
    }

    #[must_use]
    pub fn command(mut self, name: &'static str, spec: CommandSpec) -> Self {
        self.commands.insert(name, spec);
        self
    }

    #[must_use]
    pub fn param(mut self, entry: ParameterEntry) -> Self {
        self.params.push(entry);
        self
    }

    /// Register a decoder. Overlapping matches resolve in registration order.
    #[must_use]
    pub fn decoder(mut self, decoder: impl SampleDecoder + 'static) -> Self {
        self.decoders.push(Box::new(decoder));
        self
    }

    #[must_use]
    pub fn discovery(mut self, recipe: DiscoveryRecipe) -> Self {
        self.discovery = Some(recipe);
        self
    }

    #[must_use]
    pub fn autosample(mut self, recipe: AutosampleRecipe) -> Self {
        self.autosample = Some(recipe);
        self
    }

    #[must_use]
    pub fn parameters(mut self, recipe: ParameterRecipe) -> Self {
        self.parameters = Some(recipe);
        self
    }

    #[must_use]
    pub fn self_test(mut self, tests: &[&'static str]) -> Self {
        self.self_test = Some(SelfTestRecipe { tests: tests.to_vec() });
        self
    }

    #[must_use]
    pub fn acquire_sample(mut self, command: &'static str) -> Self {
        self.acquire_sample = Some(command);
        self
    }

    #[must_use]
    pub fn custom(mut self, command: CustomCommand) -> Self {
        self.custom.push(command);
        self
    }

    /// Validate cross references and build the vocabulary.
    ///
    /// # Errors
    /// Returns `Error::Config` if a recipe names an undeclared command, a
    /// parameter is declared twice, no prompt is available for a command
    /// that waits for one, or a custom command is legal in a state the
    /// vocabulary cannot enter.
    pub fn build(self) -> Result<Vocabulary> {
        let discovery = self
            .discovery
            .ok_or_else(|| Error::config(format!("{}: no discovery recipe", self.name)))?;
        let parameters = self
            .parameters
            .ok_or_else(|| Error::config(format!("{}: no parameter recipe", self.name)))?;

        let mut params = ParamDict::new();
        for entry in self.params {
            params.add(entry)?;
        }

        let mut referenced = vec![discovery.probe, parameters.read.command(), parameters.write];
        referenced.extend(discovery.status.map(|s| s.command));
        referenced.extend(discovery.wake);
        referenced.extend(parameters.save);
        if let Some(a) = &self.autosample {
            referenced.extend([a.start, a.stop]);
            referenced.extend(a.confirm);
        }
        if let Some(t) = &self.self_test {
            if t.tests.is_empty() {
                return Err(Error::config(format!("{}: self test declares no tests", self.name)));
            }
            referenced.extend(t.tests.iter().copied());
        }
        referenced.extend(self.acquire_sample);
        referenced.extend(self.custom.iter().map(|c| c.command));

        for command in referenced {
            if !self.commands.contains_key(command) {
                return Err(Error::config(format!("{}: undeclared command '{command}'", self.name)));
            }
        }

        for (name, spec) in &self.commands {
            if spec.awaits_response && spec.prompts.is_empty() && self.prompts.is_empty() {
                return Err(Error::config(format!("{}: command '{name}' has no prompt", self.name)));
            }
        }

        let mut seen = Vec::with_capacity(self.custom.len());
        for custom in &self.custom {
            if seen.contains(&custom.name) {
                return Err(Error::config(format!("{}: duplicate custom command '{}'", self.name, custom.name)));
            }
            seen.push(custom.name);
            for state in &custom.states {
                let reachable = match state {
                    ProtocolState::Command => true,
                    ProtocolState::Autosample => self.autosample.is_some(),
                    _ => false,
                };
                if !reachable {
                    return Err(Error::config(format!(
                        "{}: custom command '{}' declared for unsupported state {state}",
                        self.name, custom.name
                    )));
                }
            }
        }

        Ok(Vocabulary {
            name: self.name,
            newline: self.newline,
            prompts: self.prompts,
            commands: self.commands,
            params,
            decoders: self.decoders,
            discovery,
            autosample: self.autosample,
            parameters,
            self_test: self.self_test,
            acquire_sample: self.acquire_sample,
            custom: self.custom,
        })
    }
}
