// Copyright © 2024 The Johns Hopkins Applied Physics Laboratory LLC.
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Affero General Public License,
// version 3, as published by the Free Software Foundation.  If you
// would like to purchase a commercial license for this software, please
// contact APL’s Tech Transfer at 240-592-0817 or
// techtransfer@jhuapl.edu.
//
// This program is distributed in the hope that it will be useful, but
// WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.

//! Interface to the reactor that drives negotiation.
//!
//! The reactor itself lives outside this crate.  It delivers
//! [ProxyEvent]s for a connection, and accepts write and line-read
//! requests through the [Reactor] trait.  Every request it accepts
//! must eventually complete as a new event for the same connection,
//! whether by data, error, or timeout.
//!
//! Events leave proxy control through a [ForwardGate], which hands
//! them to the application's handler.
use std::fmt::Display;
use std::fmt::Formatter;
use std::io::ErrorKind;
use std::time::Duration;

/// Kind of I/O operation an event reports on.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum EventType {
    /// Socket connection completed.
    Connect,
    /// Read completed.
    Read,
    /// Write completed.
    Write,
    /// Timer expired.
    Timer
}

/// Completion status of an event.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum EventStatus {
    /// Operation succeeded.
    Success,
    /// Operation failed.
    Error {
        /// Kind of the underlying I/O error.
        kind: ErrorKind
    },
    /// Operation did not complete in time.
    Timeout,
    /// Operation was cancelled.
    Cancelled,
    /// Peer closed the connection.
    EOF,
    /// Proxy negotiation failed.
    ProxyError
}

/// An I/O event delivered by the reactor.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProxyEvent {
    /// Operation kind.
    ty: EventType,
    /// Completion status.
    status: EventStatus,
    /// Data read, for read events.
    buf: Vec<u8>
}

/// Per-connection I/O requests issued by proxy protocols.
///
/// Both requests are non-blocking; completion is reported back as a
/// [ProxyEvent] on the same connection.
pub trait Reactor {
    /// Queue `data` for writing, failing after `timeout`.
    fn write(
        &mut self,
        timeout: Duration,
        data: &[u8]
    );

    /// Read until `nlines` full lines are buffered, failing after
    /// `timeout`.
    fn read_lines(
        &mut self,
        timeout: Duration,
        nlines: usize
    );
}

/// Exit point from proxy control back to the application.
pub trait ForwardGate {
    /// Hand `event` to the application's handler.
    fn forward(
        &mut self,
        event: ProxyEvent
    );
}

impl<F> ForwardGate for F
where
    F: FnMut(ProxyEvent)
{
    #[inline]
    fn forward(
        &mut self,
        event: ProxyEvent
    ) {
        self(event)
    }
}

impl ProxyEvent {
    /// Create an event with no data.
    #[inline]
    pub fn new(
        ty: EventType,
        status: EventStatus
    ) -> ProxyEvent {
        ProxyEvent {
            ty: ty,
            status: status,
            buf: Vec::new()
        }
    }

    /// Create a successful connect event.
    #[inline]
    pub fn connected() -> ProxyEvent {
        ProxyEvent::new(EventType::Connect, EventStatus::Success)
    }

    /// Create a successful read event carrying `buf`.
    #[inline]
    pub fn read(buf: Vec<u8>) -> ProxyEvent {
        ProxyEvent {
            ty: EventType::Read,
            status: EventStatus::Success,
            buf: buf
        }
    }

    /// Create a successful write completion event.
    #[inline]
    pub fn written() -> ProxyEvent {
        ProxyEvent::new(EventType::Write, EventStatus::Success)
    }

    /// Create a timed-out event of type `ty`.
    #[inline]
    pub fn timeout(ty: EventType) -> ProxyEvent {
        ProxyEvent::new(ty, EventStatus::Timeout)
    }

    /// Get the event type.
    #[inline]
    pub fn ty(&self) -> EventType {
        self.ty
    }

    /// Get the completion status.
    #[inline]
    pub fn status(&self) -> EventStatus {
        self.status
    }

    /// Get the data read, empty for everything but reads.
    #[inline]
    pub fn read_buf(&self) -> &[u8] {
        &self.buf
    }

    /// Take the data read, leaving the buffer empty.
    #[inline]
    pub fn take_buf(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    #[inline]
    pub(crate) fn set_status(
        &mut self,
        status: EventStatus
    ) {
        self.status = status
    }

    /// Turn a negotiation event back into the application's pending
    /// event of type `ty`, dropping any proxy response data.
    #[inline]
    pub(crate) fn retarget(
        &mut self,
        ty: EventType
    ) {
        self.ty = ty;
        self.buf.clear();
    }
}

impl EventStatus {
    /// Check whether this is a success status.
    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self, EventStatus::Success)
    }
}

impl Display for EventType {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            EventType::Connect => write!(f, "connect"),
            EventType::Read => write!(f, "read"),
            EventType::Write => write!(f, "write"),
            EventType::Timer => write!(f, "timer")
        }
    }
}

impl Display for EventStatus {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            EventStatus::Success => write!(f, "success"),
            EventStatus::Error { kind } => write!(f, "error ({})", kind),
            EventStatus::Timeout => write!(f, "timeout"),
            EventStatus::Cancelled => write!(f, "cancelled"),
            EventStatus::EOF => write!(f, "EOF"),
            EventStatus::ProxyError => write!(f, "proxy error")
        }
    }
}

/// Requests recorded by [RecordingReactor].
#[cfg(test)]
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum Request {
    Write { timeout: Duration, data: Vec<u8> },
    ReadLines { timeout: Duration, nlines: usize }
}

/// [Reactor] that records every request instead of performing it.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingReactor {
    pub(crate) requests: Vec<Request>
}

#[cfg(test)]
impl RecordingReactor {
    /// Drain the text of every write issued so far.
    pub(crate) fn take_writes(&mut self) -> Vec<String> {
        self.requests
            .drain(..)
            .filter_map(|req| match req {
                Request::Write { data, .. } => {
                    Some(String::from_utf8(data).expect("Expected UTF-8"))
                }
                _ => None
            })
            .collect()
    }
}

#[cfg(test)]
impl Reactor for RecordingReactor {
    fn write(
        &mut self,
        timeout: Duration,
        data: &[u8]
    ) {
        self.requests.push(Request::Write {
            timeout: timeout,
            data: data.to_vec()
        })
    }

    fn read_lines(
        &mut self,
        timeout: Duration,
        nlines: usize
    ) {
        self.requests.push(Request::ReadLines {
            timeout: timeout,
            nlines: nlines
        })
    }
}

#[test]
fn test_closure_forward_gate() {
    let mut seen = Vec::new();
    let mut gate = |event: ProxyEvent| seen.push(event);

    gate.forward(ProxyEvent::read(b"hello".to_vec()));
    gate.forward(ProxyEvent::timeout(EventType::Read));

    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].read_buf(), b"hello");
    assert_eq!(seen[1].status(), EventStatus::Timeout);
}

#[test]
fn test_take_buf() {
    let mut event = ProxyEvent::read(b"HTTP/1.1 200 OK\r\n".to_vec());

    assert_eq!(event.take_buf(), b"HTTP/1.1 200 OK\r\n".to_vec());
    assert!(event.read_buf().is_empty());
    assert!(event.status().is_success());
}
