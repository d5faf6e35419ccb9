//! Command specifications: how a named instrument command becomes wire bytes
//! and how its response is interpreted.
//!
//! A [`CommandSpec`] pairs a [`CommandBuilder`] with the prompts that end the
//! response, the per-call deadline and retry budget, and an optional
//! [`ResponseParser`]. Parsers return [`Error::Rejected`] for device
//! rejections so the dispatcher can retry within the same deadline.
//!
//! ```
//! use marine_protocol::{CommandBuilder, CommandSpec};
//! use std::time::Duration;
//!
//! let show = CommandSpec::new("show", CommandBuilder::ParamFetch)
//!     .with_prompt("[Auto]$")
//!     .with_timeout(Duration::from_secs(45));
//! assert_eq!(&show.build("\r\n", &["maxrate"]).unwrap()[..], b"show maxrate\r\n");
//!
//! let set = CommandSpec::new("", CommandBuilder::ParamAssign { separator: "=" });
//! assert_eq!(&set.build("\r\n", &["navg", "4"]).unwrap()[..], b"navg=4\r\n");
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use marine_core::constants::{DEFAULT_COMMAND_RETRIES, DEFAULT_COMMAND_TIMEOUT_MS, DEFAULT_WRITE_DELAY_MS};
use marine_core::{Error, Result};
use std::fmt;
use std::time::Duration;

/// Control-C, the usual break character.
pub const CTRL_C: u8 = 0x03;

/// Carriage return, the usual wakeup probe.
pub const CR: u8 = 0x0D;

/// Builds wire bytes for a command from its token and arguments.
pub type CustomBuildFn = fn(&CommandSpec, &str, &[&str]) -> Result<Bytes>;

/// Interprets a matched response.
pub type ResponseParser = fn(&Response) -> Result<CommandResult>;

/// How the wire bytes of a command are assembled.
#[derive(Clone, Copy)]
pub enum CommandBuilder {
    /// `token` followed by the newline.
    Line,
    /// `token`, a space, each argument separated by spaces, then the newline.
    WithArgs,
    /// A single control byte with no newline.
    Control(u8),
    /// The same control byte repeated.
    RepeatedControl { byte: u8, count: usize },
    /// `token name` followed by the newline. Takes the parameter name.
    ParamFetch,
    /// `[token ]name{separator}value` followed by the newline.
    ParamAssign { separator: &'static str },
    Custom(CustomBuildFn),
}

impl fmt::Debug for CommandBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Line => f.write_str("Line"),
            Self::WithArgs => f.write_str("WithArgs"),
            Self::Control(b) => write!(f, "Control({b:#04x})"),
            Self::RepeatedControl { byte, count } => write!(f, "RepeatedControl({byte:#04x} x{count})"),
            Self::ParamFetch => f.write_str("ParamFetch"),
            Self::ParamAssign { separator } => write!(f, "ParamAssign({separator:?})"),
            Self::Custom(_) => f.write_str("Custom"),
        }
    }
}

/// A response claimed by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Everything received since transmission, prompt included.
    pub text: String,
    /// The prompt that terminated the response.
    pub prompt: String,
}

impl Response {
    pub fn new(text: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            prompt: prompt.into(),
        }
    }

    /// Response text with the trailing prompt and surrounding whitespace removed.
    pub fn body(&self) -> &str {
        let trimmed = self.text.trim_end();
        trimmed
            .strip_suffix(self.prompt.as_str())
            .unwrap_or(trimmed)
            .trim()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.text.contains(needle)
    }
}

/// Interpreted outcome of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResult {
    /// Prompt observed; nothing further to report.
    Ack,
    /// Response body text.
    Text(String),
    /// Pass/fail outcome of a diagnostic.
    Verdict { passed: bool, text: String },
}

impl CommandResult {
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Ack => None,
            Self::Text(t) | Self::Verdict { text: t, .. } => Some(t),
        }
    }
}

/// Everything the dispatcher needs to run one command.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub token: String,
    pub builder: CommandBuilder,
    pub parser: Option<ResponseParser>,
    /// Any of these ending the response completes the exchange. Empty means
    /// the vocabulary's default prompts apply.
    pub prompts: Vec<String>,
    pub timeout: Duration,
    pub retries: u32,
    pub write_delay: Duration,
    /// Whether the dispatcher waits for a prompt after transmission.
    pub awaits_response: bool,
}

impl CommandSpec {
    pub fn new(token: impl Into<String>, builder: CommandBuilder) -> Self {
        Self {
            token: token.into(),
            builder,
            parser: None,
            prompts: Vec::new(),
            timeout: Duration::from_millis(DEFAULT_COMMAND_TIMEOUT_MS),
            retries: DEFAULT_COMMAND_RETRIES,
            write_delay: Duration::from_millis(DEFAULT_WRITE_DELAY_MS),
            awaits_response: true,
        }
    }

    /// Shorthand for a newline-terminated command.
    pub fn line(token: impl Into<String>) -> Self {
        Self::new(token, CommandBuilder::Line)
    }

    #[must_use]
    pub fn with_parser(mut self, parser: ResponseParser) -> Self {
        self.parser = Some(parser);
        self
    }

    #[must_use]
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompts.push(prompt.into());
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    #[must_use]
    pub fn with_write_delay(mut self, write_delay: Duration) -> Self {
        self.write_delay = write_delay;
        self
    }

    /// Transmit without waiting for a prompt.
    #[must_use]
    pub fn no_response(mut self) -> Self {
        self.awaits_response = false;
        self
    }

    /// Assemble the wire bytes.
    ///
    /// # Errors
    /// Returns `Error::Parameter` when the builder needs arguments that were
    /// not supplied.
    pub fn build(&self, newline: &str, args: &[&str]) -> Result<Bytes> {
        let mut out = BytesMut::with_capacity(self.token.len() + newline.len() + 16);
        match self.builder {
            CommandBuilder::Line => {
                out.put_slice(self.token.as_bytes());
                out.put_slice(newline.as_bytes());
            }
            CommandBuilder::WithArgs => {
                out.put_slice(self.token.as_bytes());
                for arg in args {
                    out.put_u8(b' ');
                    out.put_slice(arg.as_bytes());
                }
                out.put_slice(newline.as_bytes());
            }
            CommandBuilder::Control(byte) => out.put_u8(byte),
            CommandBuilder::RepeatedControl { byte, count } => out.put_bytes(byte, count),
            CommandBuilder::ParamFetch => {
                let [name, ..] = args else {
                    return Err(self.missing_args(1, args.len()));
                };
                out.put_slice(self.token.as_bytes());
                out.put_u8(b' ');
                out.put_slice(name.as_bytes());
                out.put_slice(newline.as_bytes());
            }
            CommandBuilder::ParamAssign { separator } => {
                let [name, value, ..] = args else {
                    return Err(self.missing_args(2, args.len()));
                };
                if !self.token.is_empty() {
                    out.put_slice(self.token.as_bytes());
                    out.put_u8(b' ');
                }
                out.put_slice(name.as_bytes());
                out.put_slice(separator.as_bytes());
                out.put_slice(value.as_bytes());
                out.put_slice(newline.as_bytes());
            }
            CommandBuilder::Custom(build) => return build(self, newline, args),
        }
        Ok(out.freeze())
    }

    /// Interpret a matched response. Without a parser the body text is returned.
    pub fn parse(&self, response: &Response) -> Result<CommandResult> {
        match self.parser {
            Some(parser) => parser(response),
            None => {
                let body = response.body();
                if body.is_empty() {
                    Ok(CommandResult::Ack)
                } else {
                    Ok(CommandResult::Text(body.to_string()))
                }
            }
        }
    }

    /// Human-readable label used in logs and errors.
    pub fn label(&self) -> String {
        match self.builder {
            CommandBuilder::Control(b) | CommandBuilder::RepeatedControl { byte: b, .. } if self.token.is_empty() => {
                format!("{b:#04x}")
            }
            _ => self.token.clone(),
        }
    }

    fn missing_args(&self, expected: usize, got: usize) -> Error {
        Error::parameter(format!(
            "command '{}' needs {expected} argument(s), got {got}",
            self.token
        ))
    }
}

/// Return `Error::Rejected` if the response contains any of `markers`.
///
/// ```
/// use marine_protocol::{Response, reject_if_contains};
///
/// let r = Response::new("show bogus\r\nunknown command\r\n[Auto]$", "[Auto]$");
/// assert!(reject_if_contains("show", &r, &["Usage", "unknown command"]).is_err());
/// ```
pub fn reject_if_contains(command: &str, response: &Response, markers: &[&str]) -> Result<()> {
    if markers.iter().any(|m| response.contains(m)) {
        return Err(Error::rejected(command, response.text.clone()));
    }
    Ok(())
}
