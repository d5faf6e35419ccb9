//! Pattern-driven extraction of complete units from a continuous byte stream.
//!
//! Instruments interleave command echoes, status text and telemetry on a
//! single serial line. The [`Chunker`] accumulates raw bytes, runs every
//! registered [`ChunkMatcher`] over the retained buffer, and queues each
//! recognized range as a [`Chunk`].
//!
//! # Resolution
//!
//! Matchers are applied in registration order and every candidate range is
//! collected. Overlapping candidates resolve to the earliest start, then the
//! longest length, then the earliest registered matcher. Accepted ranges
//! never overlap and are emitted left to right.
//!
//! After a sieve the buffer is consumed through the end of the last emitted
//! chunk. Bytes between chunks are noise and are discarded; bytes after the
//! last chunk are kept because they may be the head of a unit that is still
//! arriving.
//!
//! # Usage
//!
//! ```
//! use marine_protocol::{Chunker, RegexMatcher};
//! use chrono::Utc;
//!
//! let mut chunker = Chunker::new();
//! chunker.add_matcher(RegexMatcher::new("line", r"#[^\r\n]*\r\n").unwrap());
//!
//! chunker.add_data(b"noise#12.5, 3.1", Utc::now());
//! assert!(chunker.next_chunk().is_none());
//!
//! chunker.add_data(b"\r\n#1.0\r\n", Utc::now());
//! let first = chunker.next_chunk().unwrap();
//! assert_eq!(&first.data[..], b"#12.5, 3.1\r\n");
//! assert_eq!(first.start, 5);
//! assert!(chunker.next_chunk().is_some());
//! assert!(chunker.next_chunk().is_none());
//! ```

use bytes::{Buf, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use marine_core::constants::MAX_CHUNKER_BUFFER;
use marine_core::{Error, Result};
use regex::bytes::Regex;
use std::borrow::Cow;
use std::collections::VecDeque;
use std::fmt;
use std::ops::Range;
use tracing::{trace, warn};

/// Initial capacity of the receive buffer.
const INITIAL_BUFFER_CAPACITY: usize = 4 * 1024;

/// Recognizes complete logical units inside a byte buffer.
///
/// Implementations report every candidate range they find. Ranges are
/// relative to the start of `buffer`. A matcher must only report a range once
/// the bytes that decide its extent are present, so that the outcome does not
/// depend on how the stream was fragmented.
pub trait ChunkMatcher: Send + Sync {
    /// Name used to tag emitted chunks.
    fn name(&self) -> &str;

    /// All candidate ranges inside `buffer`.
    fn find_all(&self, buffer: &[u8]) -> Vec<Range<usize>>;
}

/// [`ChunkMatcher`] backed by a byte regex.
#[derive(Debug, Clone)]
pub struct RegexMatcher {
    name: String,
    regex: Regex,
}

impl RegexMatcher {
    /// Compile `pattern` into a matcher.
    ///
    /// # Errors
    /// Returns `Error::Config` if the pattern does not compile.
    pub fn new(name: impl Into<String>, pattern: &str) -> Result<Self> {
        let name = name.into();
        let regex = Regex::new(pattern)
            .map_err(|e| Error::config(format!("invalid pattern for matcher '{name}': {e}")))?;
        Ok(Self { name, regex })
    }

    pub fn regex(&self) -> &Regex {
        &self.regex
    }
}

impl ChunkMatcher for RegexMatcher {
    fn name(&self) -> &str {
        &self.name
    }

    fn find_all(&self, buffer: &[u8]) -> Vec<Range<usize>> {
        self.regex
            .find_iter(buffer)
            .map(|m| m.range())
            .filter(|r| !r.is_empty())
            .collect()
    }
}

/// A recognized unit with its absolute stream position.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// Registration index of the matcher that produced this chunk.
    pub matcher: usize,
    /// Name of that matcher.
    pub tag: String,
    /// Absolute offset of the first byte.
    pub start: u64,
    /// Absolute offset one past the last byte.
    pub end: u64,
    pub data: Bytes,
    /// Arrival time of the batch that completed the chunk.
    pub timestamp: DateTime<Utc>,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Lossy UTF-8 view of the chunk bytes.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }
}

/// One accepted range from [`Chunker::sieve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SieveMatch {
    pub matcher: usize,
    pub range: Range<usize>,
}

/// Stateful chunk extractor.
///
/// # Example
///
/// ```
/// use marine_protocol::{Chunker, RegexMatcher};
/// use chrono::Utc;
///
/// let mut chunker = Chunker::new();
/// chunker.add_matcher(RegexMatcher::new("sample", r"S\d{3}\r\n").unwrap());
/// chunker.add_data(b"S001\r\nS002\r\nS0", Utc::now());
///
/// let starts: Vec<_> = chunker.drain_chunks().map(|c| c.start).collect();
/// assert_eq!(starts, vec![0, 6]);
/// assert_eq!(chunker.buffered(), 2);
/// ```
pub struct Chunker {
    buffer: BytesMut,
    /// Absolute stream offset of `buffer[0]`.
    base_offset: u64,
    matchers: Vec<Box<dyn ChunkMatcher>>,
    chunks: VecDeque<Chunk>,
    max_buffer: usize,
}

impl Chunker {
    pub fn new() -> Self {
        Self::with_max_buffer(MAX_CHUNKER_BUFFER)
    }

    pub fn with_max_buffer(max_buffer: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY.min(max_buffer.max(1))),
            base_offset: 0,
            matchers: Vec::new(),
            chunks: VecDeque::new(),
            max_buffer: max_buffer.max(1),
        }
    }

    /// Register a matcher and return its index.
    pub fn add_matcher(&mut self, matcher: impl ChunkMatcher + 'static) -> usize {
        self.add_boxed_matcher(Box::new(matcher))
    }

    pub fn add_boxed_matcher(&mut self, matcher: Box<dyn ChunkMatcher>) -> usize {
        self.matchers.push(matcher);
        self.matchers.len() - 1
    }

    pub fn matcher_count(&self) -> usize {
        self.matchers.len()
    }

    /// Run every matcher over `buffer` and resolve overlaps.
    ///
    /// Returns non-overlapping ranges ordered by start.
    pub fn sieve(&self, buffer: &[u8]) -> Vec<SieveMatch> {
        let mut candidates: Vec<SieveMatch> = self
            .matchers
            .iter()
            .enumerate()
            .flat_map(|(matcher, m)| {
                m.find_all(buffer)
                    .into_iter()
                    .filter(|r| !r.is_empty() && r.end <= buffer.len())
                    .map(move |range| SieveMatch { matcher, range })
            })
            .collect();

        // Earliest start, then longest, then registration order.
        candidates.sort_by(|a, b| {
            a.range
                .start
                .cmp(&b.range.start)
                .then(b.range.len().cmp(&a.range.len()))
                .then(a.matcher.cmp(&b.matcher))
        });

        let mut accepted = Vec::with_capacity(candidates.len());
        let mut cursor = 0;
        for candidate in candidates {
            if candidate.range.start >= cursor {
                cursor = candidate.range.end;
                accepted.push(candidate);
            }
        }
        accepted
    }

    /// Chunks contained in a standalone buffer, such as a claimed command
    /// response. The stream buffer is not touched and offsets are relative
    /// to `data`.
    pub fn extract(&self, data: &Bytes, timestamp: DateTime<Utc>) -> Vec<Chunk> {
        self.sieve(data)
            .into_iter()
            .map(|SieveMatch { matcher, range }| Chunk {
                matcher,
                tag: self.matchers[matcher].name().to_string(),
                start: range.start as u64,
                end: range.end as u64,
                data: data.slice(range),
                timestamp,
            })
            .collect()
    }

    /// Append a batch of raw bytes and extract every complete chunk.
    ///
    /// Returns the number of chunks queued by this call.
    pub fn add_data(&mut self, bytes: &[u8], timestamp: DateTime<Utc>) -> usize {
        if bytes.is_empty() {
            return 0;
        }
        self.buffer.extend_from_slice(bytes);

        let matches = self.sieve(&self.buffer);
        let queued = matches.len();
        let mut consumed = 0;
        for SieveMatch { matcher, range } in matches {
            let chunk = Chunk {
                matcher,
                tag: self.matchers[matcher].name().to_string(),
                start: self.base_offset + range.start as u64,
                end: self.base_offset + range.end as u64,
                data: Bytes::copy_from_slice(&self.buffer[range.clone()]),
                timestamp,
            };
            trace!(tag = %chunk.tag, start = chunk.start, end = chunk.end, "chunk extracted");
            self.chunks.push_back(chunk);
            consumed = range.end;
        }
        self.consume(consumed);

        if self.buffer.len() > self.max_buffer {
            let overflow = self.buffer.len() - self.max_buffer;
            warn!(
                dropped = overflow,
                max = self.max_buffer,
                "chunker buffer overflow, discarding oldest bytes"
            );
            self.consume(overflow);
        }
        queued
    }

    /// Next queued chunk, oldest first.
    pub fn next_chunk(&mut self) -> Option<Chunk> {
        self.chunks.pop_front()
    }

    pub fn chunks_available(&self) -> usize {
        self.chunks.len()
    }

    /// Iterator that drains the queued chunks.
    pub fn drain_chunks(&mut self) -> DrainChunks<'_> {
        DrainChunks { chunker: self }
    }

    /// Bytes retained while waiting for more data.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Absolute offset of the next byte that will be appended.
    pub fn stream_offset(&self) -> u64 {
        self.base_offset + self.buffer.len() as u64
    }

    /// Discard retained bytes and queued chunks. Stream offsets keep counting.
    pub fn clear(&mut self) {
        let len = self.buffer.len();
        self.consume(len);
        self.chunks.clear();
    }

    fn consume(&mut self, n: usize) {
        if n > 0 {
            self.buffer.advance(n);
            self.base_offset += n as u64;
        }
    }
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Chunker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.matchers.iter().map(|m| m.name()).collect();
        f.debug_struct("Chunker")
            .field("matchers", &names)
            .field("buffered", &self.buffer.len())
            .field("base_offset", &self.base_offset)
            .field("queued", &self.chunks.len())
            .finish()
    }
}

/// Draining iterator returned by [`Chunker::drain_chunks`].
pub struct DrainChunks<'a> {
    chunker: &'a mut Chunker,
}

impl Iterator for DrainChunks<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Self::Item> {
        self.chunker.next_chunk()
    }
}
