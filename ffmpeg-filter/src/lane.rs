//! Pull-driven lanes.
//!
//! A lane moves units from a [`LaneSource`] into a [`LaneSink`] only while the
//! sink reports it can take more. When it cannot, the lane parks on the sink's
//! [`ReadySignal`] until the mux worker drains some of its in-flight packets.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tokio_util::sync::CancellationToken;

use crate::completion::CompletionSynchronizer;
use crate::error::TranscodeResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LaneKind {
    Video,
    Audio,
}

impl fmt::Display for LaneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LaneKind::Video => write!(f, "video"),
            LaneKind::Audio => write!(f, "audio"),
        }
    }
}

/// Producer side of a lane.
pub trait LaneSource: Send {
    type Unit: Send;

    /// Returns the next unit, or `None` once the stream is exhausted. After
    /// the first `None` every further call returns `None`.
    fn copy_next(&mut self) -> TranscodeResult<Option<Self::Unit>>;
}

/// Consumer side of a lane.
pub trait LaneSink: Send {
    type Unit: Send;

    fn is_ready(&self) -> bool;

    fn append(&mut self, unit: Self::Unit) -> TranscodeResult<()>;

    /// Flushes whatever is still buffered. Called once, after the last append.
    fn mark_finished(&mut self) -> TranscodeResult<()>;

    fn ready_signal(&self) -> Arc<ReadySignal>;
}

#[derive(Default)]
struct SignalState {
    raised: bool,
    closed: bool,
}

/// Latched wake-up flag shared between a lane and whoever frees up room in its
/// sink. A raise that happens before [`ReadySignal::wait`] is not lost.
#[derive(Default)]
pub struct ReadySignal {
    state: Mutex<SignalState>,
    cond: Condvar,
}

impl ReadySignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        let mut state = self.state.lock();
        state.raised = true;
        self.cond.notify_all();
    }

    /// Wakes every waiter for good. Used on teardown.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.cond.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Blocks until raised or closed and consumes the raise. Returns false if closed.
    pub fn wait(&self) -> bool {
        let mut state = self.state.lock();
        while !state.raised && !state.closed {
            self.cond.wait(&mut state);
        }
        state.raised = false;
        !state.closed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The sink is full; wait for its ready signal before stepping again.
    NotReady,
    /// End of stream reached and the sink has been marked finished.
    Finished,
    Cancelled,
}

pub struct Lane<S, K> {
    kind: LaneKind,
    source: S,
    sink: K,
    cancel: CancellationToken,
    finished: bool,
}

impl<S, K> Lane<S, K>
where
    S: LaneSource,
    K: LaneSink<Unit = S::Unit>,
{
    pub fn new(kind: LaneKind, source: S, sink: K, cancel: CancellationToken) -> Self {
        Self {
            kind,
            source,
            sink,
            cancel,
            finished: false,
        }
    }

    /// Pulls units while the sink is ready.
    pub fn step(&mut self) -> TranscodeResult<Step> {
        if self.finished {
            return Ok(Step::Finished);
        }
        while self.sink.is_ready() {
            if self.cancel.is_cancelled() {
                return Ok(Step::Cancelled);
            }
            match self.source.copy_next()? {
                Some(unit) => self.sink.append(unit)?,
                None => {
                    self.sink.mark_finished()?;
                    self.finished = true;
                    return Ok(Step::Finished);
                }
            }
        }
        Ok(Step::NotReady)
    }

    /// Drives the lane on the calling thread until it finishes, fails or is
    /// cancelled. A finished lane reports itself to `sync`.
    pub fn run(mut self, sync: &CompletionSynchronizer) -> TranscodeResult<()> {
        let signal = self.sink.ready_signal();
        loop {
            match self.step()? {
                Step::Finished => {
                    log::debug!("{} lane finished", self.kind);
                    sync.mark_finished(self.kind);
                    return Ok(());
                }
                Step::Cancelled => {
                    log::debug!("{} lane cancelled", self.kind);
                    return Ok(());
                }
                Step::NotReady => {
                    if !signal.wait() {
                        log::debug!("{} lane woken by teardown", self.kind);
                        return Ok(());
                    }
                }
            }
        }
    }
}
