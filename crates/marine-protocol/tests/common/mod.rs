//! Shared helpers for marine-protocol integration tests.

#![allow(dead_code)]

use chrono::Utc;
use marine_protocol::{Chunk, Chunker, RegexMatcher};

/// Pattern for `#`-prefixed ASCII sample records.
pub const RECORD_PATTERN: &str = r"#[^#\r\n]*\r\n";

/// Pattern for `S>` prompts left in the stream.
pub const PROMPT_PATTERN: &str = r"S>";

pub fn record_chunker() -> Chunker {
    let mut chunker = Chunker::new();
    chunker.add_matcher(RegexMatcher::new("record", RECORD_PATTERN).unwrap());
    chunker.add_matcher(RegexMatcher::new("prompt", PROMPT_PATTERN).unwrap());
    chunker
}

/// Feed `stream` in pieces split at `cuts` and return every chunk produced.
pub fn feed_fragmented(chunker: &mut Chunker, stream: &[u8], cuts: &[usize]) -> Vec<Chunk> {
    let mut points: Vec<usize> = cuts.iter().map(|c| c % (stream.len() + 1)).collect();
    points.push(0);
    points.push(stream.len());
    points.sort_unstable();
    points.dedup();

    let mut out = Vec::new();
    for window in points.windows(2) {
        chunker.add_data(&stream[window[0]..window[1]], Utc::now());
        out.extend(chunker.drain_chunks());
    }
    out
}

/// `(start, end, bytes)` of each chunk, ignoring timestamps.
pub fn spans(chunks: &[Chunk]) -> Vec<(u64, u64, Vec<u8>)> {
    chunks
        .iter()
        .map(|c| (c.start, c.end, c.data.to_vec()))
        .collect()
}
