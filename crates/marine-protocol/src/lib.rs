//! Stream and dialogue primitives for character-oriented instruments.
//!
//! - [`chunker`]: extraction of complete units from the raw receive stream.
//! - [`param_dict`]: typed parameter cache fed by status lines.
//! - [`command`]: command specifications, wire builders and response parsers.
//! - [`decoder`]: sample decoders turning chunks into particles.

pub mod chunker;
pub mod command;
pub mod decoder;
pub mod param_dict;

pub use chunker::{Chunk, ChunkMatcher, Chunker, DrainChunks, RegexMatcher, SieveMatch};
pub use command::{
    CR, CTRL_C, CommandBuilder, CommandResult, CommandSpec, CustomBuildFn, Response, ResponseParser,
    reject_if_contains,
};
pub use decoder::{PackedReader, SampleDecoder, TextFields};
pub use param_dict::{FormatFn, ParamDict, ParamVisibility, ParameterEntry, ParseFn, formatters, parsers};
