//! Remote Todos
//!
//! Request/response correlation queue for one logical remote peer.
//!
//! Every request is stored under its own signal key. The peer answers with
//! `Success`/`Failure` whose payload starts with that key (`"<key>-<text>"`),
//! which lets the requester remove exactly the request that completed, no
//! matter where it sits in the queue. Entries keep insertion order for
//! iteration and front-of-queue access; a key index makes correlated lookup
//! independent of queue length.

use crate::signal::{Signal, SignalKind};
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::warn;

/// Behaviour when a reply's correlation id does not parse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CorrelationFallback {
    /// Remove the oldest entry, whatever its key. Long-standing behaviour
    /// that existing peers rely on when they send malformed replies.
    #[default]
    PopFront,
    /// Leave the queue untouched and report no match
    Reject,
}

/// One pending request
#[derive(Debug, Clone)]
pub struct TodoEntry<C> {
    pub signal: Signal,
    pub context: Option<C>,
}

#[derive(Debug)]
pub struct RemoteTodos<C = ()> {
    /// Entries by insertion sequence
    entries: BTreeMap<u64, TodoEntry<C>>,
    /// Signal key -> sequences holding that key, oldest first
    by_key: HashMap<i32, VecDeque<u64>>,
    next_seq: u64,
    fallback: CorrelationFallback,
}

impl<C> Default for RemoteTodos<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> RemoteTodos<C> {
    pub fn new() -> Self {
        Self::with_fallback(CorrelationFallback::default())
    }

    pub fn with_fallback(fallback: CorrelationFallback) -> Self {
        Self {
            entries: BTreeMap::new(),
            by_key: HashMap::new(),
            next_seq: 0,
            fallback,
        }
    }

    pub fn fallback(&self) -> CorrelationFallback {
        self.fallback
    }

    pub fn set_fallback(&mut self, fallback: CorrelationFallback) {
        self.fallback = fallback;
    }

    /// Push a request to the back of the queue
    pub fn append_todo(&mut self, signal: Signal, context: Option<C>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.by_key.entry(signal.key()).or_default().push_back(seq);
        self.entries.insert(seq, TodoEntry { signal, context });
    }

    /// Remove the entry addressed by `signal`.
    ///
    /// For `Success`/`Failure` the entry is located through the correlation
    /// id in the payload; any other signal removes the oldest entry with the
    /// same key.
    pub fn get_todo(&mut self, signal: &Signal) -> Option<TodoEntry<C>> {
        self.get_todo_matching(signal, None)
    }

    /// Like [`get_todo`](Self::get_todo), restricted to entries whose stored
    /// payload equals `match_value` when one is given.
    pub fn get_todo_matching(
        &mut self,
        signal: &Signal,
        match_value: Option<&[u8]>,
    ) -> Option<TodoEntry<C>> {
        if signal.is_reply() {
            return self.take_correlated(signal, match_value);
        }
        self.take_by_key(signal.key(), match_value)
    }

    /// Remove the request acknowledged by a `Success` reply.
    ///
    /// Returns `None` for any other signal.
    pub fn finish(&mut self, signal: &Signal) -> Option<TodoEntry<C>> {
        if *signal != SignalKind::Success {
            return None;
        }
        self.take_correlated(signal, None)
    }

    /// Whether a request with this key is pending
    pub fn has_todo(&self, signal: &Signal) -> bool {
        self.has_key(signal.key())
    }

    pub fn has_key(&self, key: i32) -> bool {
        self.by_key.get(&key).is_some_and(|seqs| !seqs.is_empty())
    }

    /// Oldest entry without removing it
    pub fn peek_front(&self) -> Option<&TodoEntry<C>> {
        self.entries.values().next()
    }

    /// Remove and return the oldest entry
    pub fn pop_front(&mut self) -> Option<TodoEntry<C>> {
        let (&seq, _) = self.entries.iter().next()?;
        self.remove_seq(seq)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TodoEntry<C>> {
        self.entries.values()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_key.clear();
    }

    fn take_correlated(
        &mut self,
        reply: &Signal,
        match_value: Option<&[u8]>,
    ) -> Option<TodoEntry<C>> {
        match reply.reply_parts() {
            Some((id, _)) => self.take_by_key(id, match_value),
            None => match self.fallback {
                CorrelationFallback::PopFront => {
                    warn!(
                        payload = %reply.payload_str(),
                        "Reply without numeric correlation id, completing oldest todo"
                    );
                    self.pop_front()
                }
                CorrelationFallback::Reject => {
                    warn!(
                        payload = %reply.payload_str(),
                        "Reply without numeric correlation id ignored"
                    );
                    None
                }
            },
        }
    }

    fn take_by_key(&mut self, key: i32, match_value: Option<&[u8]>) -> Option<TodoEntry<C>> {
        let seqs = self.by_key.get(&key)?;
        let seq = match match_value {
            None => *seqs.front()?,
            Some(value) => *seqs
                .iter()
                .find(|seq| {
                    self.entries
                        .get(seq)
                        .is_some_and(|entry| entry.signal.payload() == value)
                })?,
        };
        self.remove_seq(seq)
    }

    fn remove_seq(&mut self, seq: u64) -> Option<TodoEntry<C>> {
        let entry = self.entries.remove(&seq)?;
        if let Some(seqs) = self.by_key.get_mut(&entry.signal.key()) {
            seqs.retain(|s| *s != seq);
            if seqs.is_empty() {
                self.by_key.remove(&entry.signal.key());
            }
        }
        Some(entry)
    }
}
