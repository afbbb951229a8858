//! Per-thread isolation and in-memory history.
//!
//! Requests on different thread ids never share state. Requests on the same
//! thread id are serialized: the second waits for the first to reach a
//! terminal state. History is bounded per thread, and idle threads are
//! dropped once the registry is over its thread limit.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use crate::domain::Turn;

/// Held for the lifetime of one request on a thread
pub type ThreadLease = OwnedMutexGuard<()>;

const DEFAULT_MAX_TURNS: usize = 100;
const DEFAULT_MAX_THREADS: usize = 10_000;

#[derive(Default)]
struct ThreadEntry {
    gate: Arc<tokio::sync::Mutex<()>>,
    turns: Vec<Turn>,
    touched: u64,
}

impl ThreadEntry {
    /// No request holds or waits for the thread
    fn is_idle(&self) -> bool {
        Arc::strong_count(&self.gate) == 1
    }
}

#[derive(Default)]
struct Threads {
    entries: HashMap<String, ThreadEntry>,
    clock: u64,
}

impl Threads {
    fn touch(&mut self, thread_id: &str) -> &mut ThreadEntry {
        self.clock += 1;
        let clock = self.clock;
        let entry = self.entries.entry(thread_id.to_string()).or_default();
        entry.touched = clock;
        entry
    }

    /// Drop the least recently touched idle threads until within `max_threads`
    fn evict(&mut self, max_threads: usize, keep: &str) {
        while self.entries.len() > max_threads {
            let oldest = self
                .entries
                .iter()
                .filter(|(id, entry)| id.as_str() != keep && entry.is_idle())
                .min_by_key(|(_, entry)| entry.touched)
                .map(|(id, _)| id.clone());
            match oldest {
                Some(id) => {
                    debug!(thread_id = %id, "Dropping idle thread");
                    self.entries.remove(&id);
                }
                // Every other thread is busy
                None => break,
            }
        }
    }
}

/// Thread ids seen by this process and their finished turns
pub struct ThreadRegistry {
    threads: Mutex<Threads>,
    max_turns: usize,
    max_threads: usize,
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::with_limits(DEFAULT_MAX_TURNS, DEFAULT_MAX_THREADS)
    }
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(max_turns: usize, max_threads: usize) -> Self {
        Self {
            threads: Mutex::new(Threads::default()),
            max_turns: max_turns.max(1),
            max_threads: max_threads.max(1),
        }
    }

    /// Wait until no other request is in flight on `thread_id`
    pub async fn acquire(&self, thread_id: &str) -> ThreadLease {
        let gate = {
            let mut threads = self.threads.lock().unwrap_or_else(|e| e.into_inner());
            let gate = threads.touch(thread_id).gate.clone();
            threads.evict(self.max_threads, thread_id);
            gate
        };
        gate.lock_owned().await
    }

    /// Append a finished turn to the thread's history
    pub fn record(&self, thread_id: &str, turn: Turn) {
        let mut threads = self.threads.lock().unwrap_or_else(|e| e.into_inner());
        let entry = threads.touch(thread_id);
        entry.turns.push(turn);
        let excess = entry.turns.len().saturating_sub(self.max_turns);
        if excess > 0 {
            entry.turns.drain(..excess);
        }
        threads.evict(self.max_threads, thread_id);
    }

    /// Turns recorded on a thread, oldest first; `None` for an unknown thread
    pub fn history(&self, thread_id: &str) -> Option<Vec<Turn>> {
        let threads = self.threads.lock().unwrap_or_else(|e| e.into_inner());
        threads.entries.get(thread_id).map(|entry| entry.turns.clone())
    }

    pub fn thread_ids(&self) -> Vec<String> {
        let threads = self.threads.lock().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = threads.entries.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::Utc;
    use tokio_test::{assert_pending, assert_ready, task};

    use crate::domain::{Outcome, RequestState, TurnStatus};

    fn turn(query: &str) -> Turn {
        Turn::from_state(
            &RequestState::new("t", query),
            TurnStatus::Completed {
                outcome: Outcome::Answered,
            },
            Utc::now(),
        )
    }

    #[test]
    fn test_history_per_thread() {
        let registry = ThreadRegistry::new();
        assert!(registry.history("a").is_none());

        registry.record("a", turn("first"));
        registry.record("a", turn("second"));
        registry.record("b", turn("other"));

        let history = registry.history("a").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].query, "first");
        assert_eq!(registry.history("b").unwrap().len(), 1);
        assert_eq!(registry.thread_ids(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_history_keeps_newest_turns() {
        let registry = ThreadRegistry::with_limits(2, 10);
        for query in ["one", "two", "three"] {
            registry.record("a", turn(query));
        }

        let queries: Vec<String> = registry
            .history("a")
            .unwrap()
            .into_iter()
            .map(|turn| turn.query)
            .collect();
        assert_eq!(queries, vec!["two".to_string(), "three".to_string()]);
    }

    #[tokio::test]
    async fn test_idle_threads_are_dropped_oldest_first() {
        let registry = ThreadRegistry::with_limits(10, 2);
        registry.record("a", turn("first"));
        registry.record("b", turn("second"));
        registry.record("c", turn("third"));
        assert_eq!(registry.thread_ids(), vec!["b".to_string(), "c".to_string()]);

        // A thread with a request in flight is never dropped
        let _lease = registry.acquire("b").await;
        registry.record("d", turn("fourth"));
        assert_eq!(registry.thread_ids(), vec!["b".to_string(), "d".to_string()]);
    }

    #[tokio::test]
    async fn test_same_thread_is_serialized() {
        let registry = ThreadRegistry::new();
        let lease = registry.acquire("a").await;

        let mut waiting = task::spawn(registry.acquire("a"));
        assert_pending!(waiting.poll());

        // Another thread is unaffected
        let _other = registry.acquire("b").await;

        drop(lease);
        assert!(waiting.is_woken());
        let _again = assert_ready!(waiting.poll());
    }
}
