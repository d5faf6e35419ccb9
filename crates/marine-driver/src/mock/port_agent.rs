//! Scripted port agent for tests and development.
//!
//! The mock answers each transmitted command from a table of rules and
//! records everything it was sent. Tests drive it through a
//! [`MockPortAgentHandle`]: they add rules, push unsolicited stream data, and
//! close the link to simulate a lost connection.

use crate::transport::{Inbound, PortAgentLink, Transport, port_agent_channel};
use bytes::Bytes;
use marine_core::constants::DEFAULT_INBOUND_CHANNEL_CAPACITY;
use marine_core::{Error, Result};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{trace, warn};

#[derive(Debug, Clone)]
enum Match {
    Exact(Bytes),
    Prefix(Bytes),
}

impl Match {
    fn matches(&self, sent: &[u8]) -> bool {
        match self {
            Match::Exact(b) => sent == &b[..],
            Match::Prefix(b) => sent.starts_with(b),
        }
    }
}

#[derive(Debug, Clone)]
struct Rule {
    matcher: Match,
    reply: Vec<Bytes>,
    /// `None` answers forever.
    remaining: Option<usize>,
}

#[derive(Debug, Default)]
struct Script {
    rules: Vec<Rule>,
    sent: Vec<Bytes>,
}

fn lock(script: &Mutex<Script>) -> MutexGuard<'_, Script> {
    script.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Mock port agent.
///
/// # Examples
///
/// ```
/// use marine_driver::mock::MockPortAgent;
/// use marine_driver::transport::{Inbound, Transport};
///
/// # #[tokio::main]
/// # async fn main() {
/// let (mut transport, mut inbound, agent) = MockPortAgent::new();
/// agent.on("ds\r\n", "vbatt = 13.1\r\nS>");
///
/// transport.send(b"ds\r\n").unwrap();
/// assert!(matches!(inbound.recv().await, Some(Inbound::Data(_))));
/// assert_eq!(agent.sent_count(), 1);
/// # }
/// ```
pub struct MockPortAgent;

impl MockPortAgent {
    /// Create a transport, the inbound receiver the engine reads, and the
    /// handle tests use to script the instrument.
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> (MockTransport, mpsc::Receiver<Inbound>, MockPortAgentHandle) {
        Self::with_capacity(DEFAULT_INBOUND_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> (MockTransport, mpsc::Receiver<Inbound>, MockPortAgentHandle) {
        let (link, inbound) = port_agent_channel(capacity);
        let script = Arc::new(Mutex::new(Script::default()));
        let transport = MockTransport {
            link: link.clone(),
            script: Arc::clone(&script),
        };
        (transport, inbound, MockPortAgentHandle { link, script })
    }
}

/// [`Transport`] half of the mock.
#[derive(Debug)]
pub struct MockTransport {
    link: PortAgentLink,
    script: Arc<Mutex<Script>>,
}

impl Transport for MockTransport {
    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        if self.link.is_closed() {
            return Err(Error::ConnectionLost("mock port agent is gone".into()));
        }
        let reply = {
            let mut script = lock(&self.script);
            script.sent.push(Bytes::copy_from_slice(bytes));
            // Newest rule wins.
            let found = script.rules.iter().rposition(|r| r.matcher.matches(bytes));
            match found {
                Some(i) => {
                    let rule = &mut script.rules[i];
                    let reply = rule.reply.clone();
                    let exhausted = match rule.remaining.as_mut() {
                        Some(n) => {
                            *n -= 1;
                            *n == 0
                        }
                        None => false,
                    };
                    if exhausted {
                        script.rules.remove(i);
                    }
                    reply
                }
                None => Vec::new(),
            }
        };

        trace!(sent = ?String::from_utf8_lossy(bytes), batches = reply.len(), "mock port agent received");
        for batch in reply {
            if let Err(e) = self.link.try_deliver(batch) {
                warn!(error = %e, "mock reply dropped");
            }
        }
        Ok(())
    }
}

/// Control handle for a [`MockPortAgent`].
#[derive(Debug, Clone)]
pub struct MockPortAgentHandle {
    link: PortAgentLink,
    script: Arc<Mutex<Script>>,
}

impl MockPortAgentHandle {
    /// Answer every transmission equal to `command` with `reply`.
    pub fn on(&self, command: impl AsRef<[u8]>, reply: impl AsRef<[u8]>) {
        self.push_rule(Match::Exact(bytes(command)), vec![bytes(reply)], None);
    }

    /// Answer the next transmission equal to `command` only.
    pub fn once(&self, command: impl AsRef<[u8]>, reply: impl AsRef<[u8]>) {
        self.push_rule(Match::Exact(bytes(command)), vec![bytes(reply)], Some(1));
    }

    /// Answer every transmission starting with `prefix`.
    pub fn on_prefix(&self, prefix: impl AsRef<[u8]>, reply: impl AsRef<[u8]>) {
        self.push_rule(Match::Prefix(bytes(prefix)), vec![bytes(reply)], None);
    }

    /// Answer `command` with several batches, delivered in order.
    pub fn on_batches<I, B>(&self, command: impl AsRef<[u8]>, batches: I)
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        let reply = batches.into_iter().map(bytes).collect();
        self.push_rule(Match::Exact(bytes(command)), reply, None);
    }

    /// Push unsolicited bytes, as a streaming instrument would.
    pub async fn push(&self, data: impl AsRef<[u8]>) -> Result<()> {
        self.link.deliver(bytes(data)).await
    }

    /// Report connection loss to the engine.
    pub async fn close(&self, reason: &str) {
        self.link.close(reason).await;
    }

    /// Everything transmitted so far, one entry per `send` call.
    pub fn sent(&self) -> Vec<Bytes> {
        lock(&self.script).sent.clone()
    }

    pub fn sent_count(&self) -> usize {
        lock(&self.script).sent.len()
    }

    pub fn clear_sent(&self) {
        lock(&self.script).sent.clear();
    }

    pub fn clear_rules(&self) {
        lock(&self.script).rules.clear();
    }

    fn push_rule(&self, matcher: Match, reply: Vec<Bytes>, remaining: Option<usize>) {
        lock(&self.script).rules.push(Rule {
            matcher,
            reply,
            remaining,
        });
    }
}

fn bytes(data: impl AsRef<[u8]>) -> Bytes {
    Bytes::copy_from_slice(data.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next_data(inbound: &mut mpsc::Receiver<Inbound>) -> Bytes {
        match inbound.recv().await {
            Some(Inbound::Data(d)) => d,
            other => panic!("expected data, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_once_rule_is_consumed_and_newest_wins() {
        let (mut transport, mut inbound, agent) = MockPortAgent::new();
        agent.on("ds\r\n", "old");
        agent.once("ds\r\n", "new");

        transport.send(b"ds\r\n").unwrap();
        transport.send(b"ds\r\n").unwrap();
        assert_eq!(next_data(&mut inbound).await, Bytes::from_static(b"new"));
        assert_eq!(next_data(&mut inbound).await, Bytes::from_static(b"old"));
    }

    #[tokio::test]
    async fn test_prefix_and_batches() {
        let (mut transport, mut inbound, agent) = MockPortAgent::new();
        agent.on_prefix("set ", "[Auto]$");
        agent.on_batches("id\r\n", ["Satlantic", " OCR-507\r\n[Auto]$"]);

        transport.send(b"set maxrate 1\r\n").unwrap();
        assert_eq!(next_data(&mut inbound).await, Bytes::from_static(b"[Auto]$"));

        transport.send(b"id\r\n").unwrap();
        assert_eq!(next_data(&mut inbound).await, Bytes::from_static(b"Satlantic"));
        assert_eq!(next_data(&mut inbound).await, Bytes::from_static(b" OCR-507\r\n[Auto]$"));
        assert_eq!(agent.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_unmatched_send_is_recorded_silently() {
        let (mut transport, mut inbound, agent) = MockPortAgent::new();
        transport.send(&[0x03; 7]).unwrap();
        assert_eq!(agent.sent(), vec![Bytes::from_static(&[0x03; 7])]);
        assert!(inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_after_receiver_dropped_fails() {
        let (mut transport, inbound, _agent) = MockPortAgent::new();
        drop(inbound);
        assert!(matches!(transport.send(b"ds\r\n"), Err(Error::ConnectionLost(_))));
    }
}
