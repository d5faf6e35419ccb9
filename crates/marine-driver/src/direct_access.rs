//! Operator passthrough with echo suppression.
//!
//! Instruments echo what they receive. While an operator session is active
//! every forwarded command is remembered; when the instrument's reply starts
//! with the oldest remembered command, that echo is stripped once before the
//! reply is handed back to the operator.

use bytes::Bytes;
use std::collections::VecDeque;
use tracing::trace;

/// Queue of commands forwarded during a direct-access session.
#[derive(Debug, Default)]
pub struct DirectAccess {
    sent: VecDeque<Bytes>,
}

impl DirectAccess {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget every remembered command.
    pub fn clear(&mut self) {
        self.sent.clear();
    }

    /// Remember a forwarded command.
    pub fn record(&mut self, data: Bytes) {
        if !data.is_empty() {
            self.sent.push_back(data);
        }
    }

    pub fn pending_echoes(&self) -> usize {
        self.sent.len()
    }

    /// Strip the echo of the oldest remembered command from `data`.
    ///
    /// Only a verbatim prefix is stripped, and only once. Data that does not
    /// start with the oldest command is returned unchanged.
    ///
    /// ```
    /// use marine_driver::direct_access::DirectAccess;
    /// use bytes::Bytes;
    ///
    /// let mut da = DirectAccess::new();
    /// da.record(Bytes::from_static(b"ds\r\n"));
    /// assert_eq!(&da.filter(Bytes::from_static(b"ds\r\nvbatt = 13.0\r\nS>"))[..], b"vbatt = 13.0\r\nS>");
    /// assert_eq!(&da.filter(Bytes::from_static(b"ds\r\nS>"))[..], b"ds\r\nS>");
    /// ```
    pub fn filter(&mut self, data: Bytes) -> Bytes {
        match self.sent.front() {
            Some(head) if data.starts_with(head) => {
                let len = head.len();
                self.sent.pop_front();
                trace!(len, "stripped direct access echo");
                data.slice(len..)
            }
            _ => data,
        }
    }
}
