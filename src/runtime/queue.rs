//! Ordered buffering of decoded interpreter messages and the cooperative
//! rundown schedule. Messages dispatch strictly in arrival order, with one
//! exception: consecutive `AppendSessionOutput` messages are merged into a
//! single output item so a chatty interpreter cannot storm the hook with
//! thousands of tiny events.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::protocol::RideMessage;

/// Quiescence window between rundowns.
pub const COALESCE_WINDOW: Duration = Duration::from_millis(20);

/// Bounded look-ahead past the queue head when merging output messages.
pub const OUTPUT_LOOKAHEAD: usize = 256;

/// One drained item: either a coalesced output chunk or a single message.
#[derive(Debug)]
pub enum Dispatch {
    Output(String),
    Message(RideMessage),
}

#[derive(Default)]
pub struct MessageQueue {
    q: VecDeque<RideMessage>,
    /// Set by UI-modal interactions to pause dispatch; the core only reads it.
    pub blocked: bool,
}

impl MessageQueue {
    pub fn push(&mut self, msg: RideMessage) {
        self.q.push_back(msg);
    }

    pub fn len(&self) -> usize {
        self.q.len()
    }

    pub fn is_empty(&self) -> bool {
        self.q.is_empty()
    }

    /// Remove the next dispatchable item, merging a run of output messages
    /// (up to [`OUTPUT_LOOKAHEAD`] beyond the head) into one.
    pub fn next_item(&mut self) -> Option<Dispatch> {
        if self.blocked {
            return None;
        }
        match self.q.pop_front()? {
            RideMessage::AppendSessionOutput(first) => {
                let mut text = first.result;
                let lookahead = self.q.len().min(OUTPUT_LOOKAHEAD);
                let mut taken = 0;
                while taken < lookahead {
                    if !matches!(self.q.front(), Some(RideMessage::AppendSessionOutput(_))) {
                        break;
                    }
                    if let Some(RideMessage::AppendSessionOutput(out)) = self.q.pop_front() {
                        text.push_str(&out.result);
                    }
                    taken += 1;
                }
                Some(Dispatch::Output(text))
            }
            other => Some(Dispatch::Message(other)),
        }
    }
}

/// Decision for a rundown request.
#[derive(Debug, PartialEq, Eq)]
pub enum Rundown {
    /// Run the queue down right now.
    Now,
    /// A rundown is due at the given instant; nothing else to do until then.
    Deferred(Instant),
    /// A rundown is already scheduled.
    Pending,
}

/// Debounce for queue rundowns: back-to-back arrivals within the quiescence
/// window collapse into one deferred rundown instead of re-running the drain
/// for every frame.
#[derive(Default)]
pub struct RundownTimer {
    last_finished: Option<Instant>,
    scheduled: Option<Instant>,
}

impl RundownTimer {
    pub fn request(&mut self, now: Instant) -> Rundown {
        if self.scheduled.is_some() {
            return Rundown::Pending;
        }
        match self.last_finished {
            Some(last) if now.duration_since(last) < COALESCE_WINDOW => {
                let at = last + COALESCE_WINDOW;
                self.scheduled = Some(at);
                Rundown::Deferred(at)
            }
            _ => Rundown::Now,
        }
    }

    pub fn due(&self, now: Instant) -> bool {
        self.scheduled.is_some_and(|at| now >= at)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.scheduled
    }

    pub fn finished(&mut self, now: Instant) {
        self.last_finished = Some(now);
        self.scheduled = None;
    }
}
