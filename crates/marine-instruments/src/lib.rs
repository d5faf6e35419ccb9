//! Vocabularies for the instruments the engine ships with.
//!
//! - [`satlantic`]: Satlantic OCR-507 multispectral radiometer (SPKIR),
//!   binary `SATDI7` telemetry frames.
//! - [`seabird`]: Sea-Bird SBE 16plus V2 CTD, ASCII samples and `ds` status.
//!
//! Each module exposes a `vocabulary()` constructor that plugs into
//! [`marine_driver::spawn`].

pub mod satlantic;
pub mod seabird;
