//! Command/response correlation over the shared transport.
//!
//! While a [`Dispatcher::do_cmd_resp`] call is pending it holds the exclusive
//! right to interpret newly arrived bytes. Bytes that were already waiting
//! before transmission belong to the stream and are handed to the chunker
//! first. After transmission every new batch is appended to the response
//! buffer and the buffer tail is tested against the expected prompts.
//!
//! - A matched response never reaches the chunker.
//! - A response accumulated by a call that times out is released to the
//!   chunker so the samples it contains are not lost.
//! - A device rejection is retried inside the same deadline.
//! - A closed link fails the call immediately with `Error::ConnectionLost`.

use crate::transport::{Inbound, Transport};
use bytes::BytesMut;
use chrono::Utc;
use marine_core::constants::MAX_RESPONSE_BUFFER;
use marine_core::{Error, Result};
use marine_protocol::{Chunker, CommandResult, CommandSpec, Response};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::time::{Instant, sleep_until, timeout_at};
use tracing::{debug, trace, warn};

/// Owns the transport and the inbound channel of one connection.
pub struct Dispatcher<T: Transport> {
    transport: T,
    inbound: mpsc::Receiver<Inbound>,
    newline: String,
    closed: Option<String>,
}

impl<T: Transport> Dispatcher<T> {
    pub fn new(transport: T, inbound: mpsc::Receiver<Inbound>, newline: impl Into<String>) -> Self {
        Self {
            transport,
            inbound,
            newline: newline.into(),
            closed: None,
        }
    }

    pub fn newline(&self) -> &str {
        &self.newline
    }

    /// Reason the link closed, if it has.
    pub fn closed(&self) -> Option<&str> {
        self.closed.as_deref()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Send a command and wait for one of its prompts.
    ///
    /// # Errors
    /// - `Error::Timeout` if no prompt ends the response before the deadline.
    /// - `Error::Protocol` if the device rejected every attempt.
    /// - `Error::ConnectionLost` if the link closes while waiting.
    /// - any error returned by the command's parser other than a rejection.
    pub async fn do_cmd_resp(
        &mut self,
        spec: &CommandSpec,
        args: &[&str],
        chunker: &mut Chunker,
    ) -> Result<CommandResult> {
        if spec.prompts.is_empty() {
            return Err(Error::config(format!("command '{}' has no prompt", spec.label())));
        }
        let bytes = spec.build(&self.newline, args)?;
        let label = spec.label();
        let deadline = Instant::now() + spec.timeout;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            self.drain_pending(chunker)?;
            debug!(command = %label, attempt = attempts, "sending command");
            self.send(&bytes)?;
            if !spec.write_delay.is_zero() {
                sleep_until(deadline.min(Instant::now() + spec.write_delay)).await;
            }

            let response = self.await_prompt(spec, &label, deadline, chunker).await?;
            match spec.parse(&response) {
                Ok(result) => return Ok(result),
                Err(Error::Rejected { response: text, .. }) => {
                    if attempts > spec.retries {
                        return Err(Error::protocol(
                            format!("'{label}' rejected after {attempts} attempt(s)"),
                            text,
                        ));
                    }
                    warn!(command = %label, attempt = attempts, "command rejected, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Send a command without waiting for a response.
    pub async fn do_cmd_no_resp(&mut self, spec: &CommandSpec, args: &[&str], chunker: &mut Chunker) -> Result<()> {
        let bytes = spec.build(&self.newline, args)?;
        self.drain_pending(chunker)?;
        debug!(command = %spec.label(), "sending command, no response expected");
        self.send(&bytes)?;
        if !spec.write_delay.is_zero() {
            tokio::time::sleep(spec.write_delay).await;
        }
        Ok(())
    }

    /// Write raw bytes, bypassing command building.
    pub fn send(&mut self, bytes: &[u8]) -> Result<()> {
        if let Some(reason) = &self.closed {
            return Err(Error::ConnectionLost(reason.clone()));
        }
        trace!(len = bytes.len(), "transport send");
        self.transport.send(bytes)
    }

    /// Wait for the next inbound batch outside of a dispatch.
    ///
    /// Never resolves once the link has closed.
    pub async fn recv(&mut self) -> Inbound {
        if self.closed.is_some() {
            return std::future::pending().await;
        }
        match self.inbound.recv().await {
            Some(Inbound::Data(data)) => Inbound::Data(data),
            Some(Inbound::Closed(reason)) => self.mark_closed(reason),
            None => self.mark_closed("port agent link dropped".to_string()),
        }
    }

    /// Hand every batch that is already waiting to the chunker.
    fn drain_pending(&mut self, chunker: &mut Chunker) -> Result<()> {
        if let Some(reason) = &self.closed {
            return Err(Error::ConnectionLost(reason.clone()));
        }
        loop {
            match self.inbound.try_recv() {
                Ok(Inbound::Data(data)) => {
                    chunker.add_data(&data, Utc::now());
                }
                Ok(Inbound::Closed(reason)) => return Err(self.lost(reason)),
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Disconnected) => return Err(self.lost("port agent link dropped".to_string())),
            }
        }
    }

    async fn await_prompt(
        &mut self,
        spec: &CommandSpec,
        label: &str,
        deadline: Instant,
        chunker: &mut Chunker,
    ) -> Result<Response> {
        let mut buffer = BytesMut::new();
        loop {
            if let Some(prompt) = match_prompt(&buffer, &spec.prompts) {
                let text = String::from_utf8_lossy(&buffer).into_owned();
                trace!(command = %label, prompt = %prompt, len = buffer.len(), "prompt matched");
                return Ok(Response::new(text, prompt));
            }

            match timeout_at(deadline, self.inbound.recv()).await {
                Ok(Some(Inbound::Data(data))) => {
                    buffer.extend_from_slice(&data);
                    if buffer.len() > MAX_RESPONSE_BUFFER {
                        let overflow = buffer.split_to(buffer.len() - MAX_RESPONSE_BUFFER);
                        chunker.add_data(&overflow, Utc::now());
                    }
                }
                Ok(Some(Inbound::Closed(reason))) => return Err(self.lost(reason)),
                Ok(None) => return Err(self.lost("port agent link dropped".to_string())),
                Err(_) => {
                    let text = String::from_utf8_lossy(&buffer).into_owned();
                    debug!(command = %label, received = buffer.len(), "command timed out");
                    chunker.add_data(&buffer, Utc::now());
                    return Err(Error::timeout(label, spec.timeout.as_millis() as u64, text));
                }
            }
        }
    }

    fn mark_closed(&mut self, reason: String) -> Inbound {
        warn!(reason = %reason, "port agent link closed");
        self.closed = Some(reason.clone());
        Inbound::Closed(reason)
    }

    fn lost(&mut self, reason: String) -> Error {
        self.mark_closed(reason.clone());
        Error::ConnectionLost(reason)
    }
}

/// Longest of `prompts` ending `buffer`, trailing whitespace ignored.
fn match_prompt<'p>(buffer: &[u8], prompts: &'p [String]) -> Option<&'p str> {
    let tail = buffer.trim_ascii_end();
    prompts
        .iter()
        .filter(|p| !p.is_empty() && tail.ends_with(p.as_bytes()))
        .max_by_key(|p| p.len())
        .map(String::as_str)
}
