//! Protocol engine for character-oriented marine instruments.
//!
//! An instrument is described by a [`Vocabulary`]: its prompts, command
//! tokens, parameter patterns, sample decoders and the recipes for discovery,
//! autosampling, parameter access and self test. The engine supplies the
//! mechanics around it:
//!
//! - [`fsm`]: the protocol state machine and its handler table.
//! - [`dispatcher`]: command/response correlation under timeout and retry.
//! - [`direct_access`]: echo suppression for operator sessions.
//! - [`protocol`]: one [`Protocol`] per connection, tying the pieces together.
//! - [`driver`]: the Tokio task that owns a protocol and the handle to it.
//! - [`transport`]: the seam to the port agent relaying bytes.
//! - [`mock`]: a scripted port agent for tests.
//!
//! # Example
//!
//! ```
//! use marine_core::{ParamType, ProtocolState};
//! use marine_driver::mock::MockPortAgent;
//! use marine_driver::vocabulary::{DiscoveryRecipe, ParameterRecipe, ReadRecipe};
//! use marine_driver::{ParamSelection, ProtocolConfig, Vocabulary};
//! use marine_protocol::{CommandBuilder, CommandSpec, ParameterEntry};
//!
//! # #[tokio::main]
//! # async fn main() -> marine_core::Result<()> {
//! let vocab = Vocabulary::builder("ctd")
//!     .prompt("S>")
//!     .command("ds", CommandSpec::line("ds"))
//!     .command("set", CommandSpec::new("", CommandBuilder::ParamAssign { separator: "=" }))
//!     .param(ParameterEntry::new("navg", r"navg = (\d+)", ParamType::Int)?)
//!     .discovery(DiscoveryRecipe::probe("ds"))
//!     .parameters(ParameterRecipe::new(ReadRecipe::block("ds"), "set"))
//!     .build()?;
//!
//! let (transport, inbound, agent) = MockPortAgent::new();
//! agent.on("ds\r\n", "navg = 4\r\nS>");
//!
//! let driver = marine_driver::spawn(vocab, ProtocolConfig::default(), transport, inbound)?;
//! assert_eq!(driver.discover().await?, ProtocolState::Command);
//! let config = driver.get(ParamSelection::All).await?;
//! assert_eq!(config["navg"], marine_core::ParamValue::Int(4));
//! driver.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod direct_access;
pub mod dispatcher;
pub mod driver;
pub mod fsm;
pub mod mock;
pub mod protocol;
pub mod transport;
pub mod vocabulary;

pub use config::{CommandOverride, ProtocolConfig};
pub use driver::{DriverHandle, spawn};
pub use fsm::{InstrumentFsm, StateTransition};
pub use protocol::{DriverEvent, EventArgs, EventReply, Handler, ParamSelection, Protocol, handler_table};
pub use transport::{ChannelTransport, Inbound, PortAgentLink, Transport, port_agent_channel};
pub use vocabulary::{
    AutosampleRecipe, CustomCommand, DiscoveryRecipe, ParameterRecipe, ReadRecipe, SelfTestRecipe, StatusProbe,
    Vocabulary, VocabularyBuilder,
};
