//! Request/reply correlation. Each outstanding interpreter round trip is a
//! token mapped to a one-shot completion; the matching reply resolves it
//! exactly once, a stale or duplicate reply is dropped, and entries created
//! with a deadline resolve to the reply type's default value when the
//! interpreter never answers (the value-tip liveness guard).
//!
//! Each correlation domain (value tips, tree lists, autocompletion) owns its
//! own table, so tokens never collide across domains.

use std::collections::HashMap;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::time::Instant;

pub type Token = i64;

struct Pending<T> {
    tx: Sender<T>,
    deadline: Option<Instant>,
}

pub struct CorrelationTable<T> {
    pending: HashMap<Token, Pending<T>>,
    next_token: Token,
}

impl<T> Default for CorrelationTable<T> {
    fn default() -> Self {
        Self {
            pending: HashMap::new(),
            next_token: 1,
        }
    }
}

impl<T: Default> CorrelationTable<T> {
    /// Take the next free token. Tokens are monotonic, so a token is never
    /// reused while an earlier request could still be outstanding.
    pub fn allocate(&mut self) -> Token {
        let token = self.next_token;
        self.next_token += 1;
        token
    }

    /// Register a completion under a fresh token.
    pub fn register(&mut self, deadline: Option<Instant>) -> (Token, Receiver<T>) {
        let token = self.allocate();
        let rx = self.register_token(token, deadline);
        (token, rx)
    }

    /// Register a completion under a caller-chosen token. A still-outstanding
    /// entry for the same token is displaced: its receiver observes a closed
    /// channel, never a second resolution.
    pub fn register_token(&mut self, token: Token, deadline: Option<Instant>) -> Receiver<T> {
        let (tx, rx) = channel();
        if self.pending.insert(token, Pending { tx, deadline }).is_some() {
            log::warn!(target: "bridge", "correlation token {token} reused while outstanding");
        }
        rx
    }

    /// Attach an externally created sender instead of allocating a receiver.
    pub fn register_sender(&mut self, token: Token, tx: Sender<T>, deadline: Option<Instant>) {
        if self.pending.insert(token, Pending { tx, deadline }).is_some() {
            log::warn!(target: "bridge", "correlation token {token} reused while outstanding");
        }
    }

    /// Resolve and remove the entry for `token`. Returns false (and has no
    /// other effect) when no such request is outstanding.
    pub fn resolve(&mut self, token: Token, value: T) -> bool {
        match self.pending.remove(&token) {
            Some(entry) => {
                // a caller that gave up on the receiver is fine
                let _ = entry.tx.send(value);
                true
            }
            None => {
                log::debug!(target: "bridge", "reply for unknown token {token} dropped");
                false
            }
        }
    }

    /// Resolve every entry whose deadline has passed with the default value.
    pub fn expire(&mut self, now: Instant) -> usize {
        let expired: Vec<Token> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline.is_some_and(|d| now >= d))
            .map(|(token, _)| *token)
            .collect();
        for token in &expired {
            if let Some(entry) = self.pending.remove(token) {
                let _ = entry.tx.send(T::default());
            }
        }
        expired.len()
    }

    /// Earliest deadline among outstanding entries, for the dispatch loop's
    /// wake-up calculation.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().filter_map(|p| p.deadline).min()
    }

    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }
}
