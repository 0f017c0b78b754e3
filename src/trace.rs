//! Trace request records and the core-side reader interface. §1 scopes the
//! actual trace file parsing/format-detection out of the core; the core only
//! depends on [`TraceSource`].

use serde::{Deserialize, Serialize};

use crate::event::SimTime;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Read,
    Write,
}

/// One block-level I/O request, as delivered by an external trace reader.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub arrival: SimTime,
    pub devno: u32,
    pub blkno: u64,
    pub bcount: u32,
    pub dir: Direction,
}

/// Core-side interface onto an external trace reader. The reader is
/// expected to pre-fetch one record; on each `NullEvent` service the device
/// FSM asks for the next record via this trait (§6 "the core reads records
/// lazily").
pub trait TraceSource {
    /// Return the next request, or `None` once the trace is exhausted.
    fn next(&mut self) -> Option<Request>;
}

/// An in-memory trace, useful for tests and the demo binary. A real driver
/// would implement [`TraceSource`] over a file with format detection.
#[derive(Clone, Debug, Default)]
pub struct VecTraceSource {
    requests: std::collections::VecDeque<Request>,
}

impl VecTraceSource {
    pub fn new(requests: impl IntoIterator<Item = Request>) -> Self {
        Self {
            requests: requests.into_iter().collect(),
        }
    }
}

impl TraceSource for VecTraceSource {
    fn next(&mut self) -> Option<Request> {
        self.requests.pop_front()
    }
}
