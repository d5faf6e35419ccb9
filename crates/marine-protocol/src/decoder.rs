//! Turning chunks into particles.
//!
//! A [`SampleDecoder`] owns the matcher that recognizes its unit in the
//! stream and the logic that decodes a recognized [`Chunk`]. Two helpers
//! cover the shapes instruments actually emit: [`TextFields`] for
//! regex-captured ASCII records and [`PackedReader`] for big-endian packed
//! binary payloads.

use crate::chunker::{Chunk, ChunkMatcher};
use marine_core::{Error, Particle, Result};
use regex::Regex;

/// Decodes one kind of unit recognized by the chunker.
pub trait SampleDecoder: Send + Sync {
    /// Particle type produced by [`decode`](Self::decode).
    fn particle_type(&self) -> &str;

    /// Matcher registered with the chunker on behalf of this decoder.
    fn matcher(&self) -> Result<Box<dyn ChunkMatcher>>;

    /// Decode a chunk produced by this decoder's matcher.
    ///
    /// # Errors
    /// Returns `Error::Sample` if the chunk cannot be decoded. The chunk is
    /// dropped and the stream continues.
    fn decode(&self, chunk: &Chunk) -> Result<Particle>;

    /// Whether the chunk text should also refresh the parameter dictionary.
    fn carries_status(&self) -> bool {
        false
    }
}

/// Regex capture groups of one text record, with typed accessors.
///
/// ```
/// use marine_protocol::TextFields;
/// use regex::Regex;
///
/// let re = Regex::new(r"^#? *(-?\d+\.\d+), *(-?\d+\.\d+)").unwrap();
/// let fields = TextFields::capture("ctd", &re, "# 12.3456,  0.00123").unwrap();
/// assert_eq!(fields.float(1).unwrap(), 12.3456);
/// assert!(fields.int(2).is_err());
/// ```
#[derive(Debug)]
pub struct TextFields<'a> {
    particle_type: &'a str,
    groups: Vec<Option<&'a str>>,
}

impl<'a> TextFields<'a> {
    /// Match `text` against `regex`.
    ///
    /// # Errors
    /// Returns `Error::Sample` if the regex does not match.
    pub fn capture(particle_type: &'a str, regex: &Regex, text: &'a str) -> Result<Self> {
        let caps = regex
            .captures(text)
            .ok_or_else(|| Error::sample(particle_type, format!("record does not match: {:?}", text.trim_end())))?;
        Ok(Self {
            particle_type,
            groups: caps.iter().map(|m| m.map(|m| m.as_str())).collect(),
        })
    }

    /// Whether capture group `i` participated in the match.
    pub fn has(&self, i: usize) -> bool {
        matches!(self.groups.get(i), Some(Some(_)))
    }

    pub fn str(&self, i: usize) -> Result<&'a str> {
        match self.groups.get(i) {
            Some(Some(s)) => Ok(s.trim()),
            _ => Err(Error::sample(self.particle_type, format!("missing field {i}"))),
        }
    }

    pub fn int(&self, i: usize) -> Result<i64> {
        let s = self.str(i)?;
        s.parse()
            .map_err(|_| Error::sample(self.particle_type, format!("field {i} '{s}' is not an integer")))
    }

    pub fn float(&self, i: usize) -> Result<f64> {
        let s = self.str(i)?;
        s.parse()
            .map_err(|_| Error::sample(self.particle_type, format!("field {i} '{s}' is not a number")))
    }
}

/// Bounds-checked big-endian reader over a packed binary payload.
///
/// ```
/// use marine_protocol::PackedReader;
///
/// let mut r = PackedReader::new("spkir", &[0x00, 0x00, 0x01, 0x00, 0xFF, 0xFE]);
/// assert_eq!(r.u32_be().unwrap(), 256);
/// assert_eq!(r.i16_be().unwrap(), -2);
/// assert!(r.u8().is_err());
/// ```
#[derive(Debug)]
pub struct PackedReader<'a> {
    particle_type: &'a str,
    data: &'a [u8],
    pos: usize,
}

impl<'a> PackedReader<'a> {
    pub fn new(particle_type: &'a str, data: &'a [u8]) -> Self {
        Self {
            particle_type,
            data,
            pos: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Take the next `n` bytes.
    ///
    /// # Errors
    /// Returns `Error::Sample` if fewer than `n` bytes remain.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::sample(
                self.particle_type,
                format!(
                    "payload truncated: need {n} byte(s) at offset {}, {} remain",
                    self.pos,
                    self.remaining()
                ),
            ));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    pub fn u16_be(&mut self) -> Result<u16> {
        self.array().map(u16::from_be_bytes)
    }

    pub fn i16_be(&mut self) -> Result<i16> {
        self.array().map(i16::from_be_bytes)
    }

    pub fn u32_be(&mut self) -> Result<u32> {
        self.array().map(u32::from_be_bytes)
    }

    /// Fail unless every byte has been consumed.
    pub fn finish(&self) -> Result<()> {
        if self.remaining() == 0 {
            Ok(())
        } else {
            Err(Error::sample(
                self.particle_type,
                format!("{} unexpected trailing byte(s)", self.remaining()),
            ))
        }
    }
}
