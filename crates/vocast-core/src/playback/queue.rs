//! Streaming assembler: received chunks in sequence order, with a play cursor
//!
//! The network side enqueues as chunks arrive; the scheduler waits on the
//! chunk under its cursor. Chunks that arrive ahead of a gap are held in a
//! reorder buffer so playback order always follows `sequence_index`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::stream::AudioChunk;

/// Outcome of [`ChunkQueue::enqueue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// The chunk (and possibly buffered successors) became playable
    Ready { playable: usize },
    /// The chunk is waiting for an earlier index
    Buffered { missing: usize },
    /// A chunk with this index was already received
    Duplicate,
    /// The queue was closed before the chunk arrived
    Closed,
}

#[derive(Debug, Default)]
struct QueueState {
    /// Contiguous chunks `0..ready.len()`
    ready: Vec<Arc<AudioChunk>>,
    /// Early arrivals keyed by index
    pending: BTreeMap<usize, Arc<AudioChunk>>,
    cursor: usize,
    closed: bool,
}

/// Ordered, awaitable chunk store shared by producer and scheduler
#[derive(Debug, Default)]
pub struct ChunkQueue {
    state: Mutex<QueueState>,
    changed: Notify,
}

impl ChunkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a received chunk
    pub fn enqueue(&self, chunk: AudioChunk) -> Enqueued {
        let outcome = {
            let mut state = self.lock();
            let index = chunk.sequence_index;

            if state.closed {
                Enqueued::Closed
            } else if index < state.ready.len() || state.pending.contains_key(&index) {
                Enqueued::Duplicate
            } else if index > state.ready.len() {
                state.pending.insert(index, Arc::new(chunk));
                Enqueued::Buffered {
                    missing: state.ready.len(),
                }
            } else {
                state.ready.push(Arc::new(chunk));
                Self::drain_pending(&mut state);
                Enqueued::Ready {
                    playable: state.ready.len(),
                }
            }
        };

        match outcome {
            Enqueued::Ready { playable } => {
                debug!("Queue has {} playable chunks", playable);
                self.changed.notify_waiters();
            }
            Enqueued::Buffered { missing } => {
                debug!("Holding early chunk until index {} arrives", missing);
            }
            Enqueued::Duplicate => warn!("Dropping duplicate chunk"),
            Enqueued::Closed => warn!("Dropping chunk received after the stream closed"),
        }
        outcome
    }

    fn drain_pending(state: &mut QueueState) {
        loop {
            let next = state.ready.len();
            match state.pending.remove(&next) {
                Some(chunk) => state.ready.push(chunk),
                None => break,
            }
        }
    }

    /// Generation finished; no more chunks will arrive
    ///
    /// Chunks still waiting behind a gap are released in index order so the
    /// rest of the track can play.
    pub fn close(&self) {
        {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            if !state.pending.is_empty() {
                let expected = state.ready.len();
                let first = state.pending.keys().next().copied().unwrap_or(expected);
                warn!(
                    "Stream closed with missing chunks {}..{}, playing the rest in order",
                    expected, first
                );
                let pending = std::mem::take(&mut state.pending);
                state.ready.extend(pending.into_values());
            }
        }
        self.changed.notify_waiters();
    }

    /// Wait for the chunk at playback position `index`
    ///
    /// Returns `None` once the queue is closed and `index` is past the end.
    pub async fn wait_at(&self, index: usize) -> Option<Arc<AudioChunk>> {
        loop {
            // Registered before the check so a concurrent enqueue can't be missed.
            let notified = self.changed.notified();
            {
                let state = self.lock();
                if let Some(chunk) = state.ready.get(index) {
                    return Some(Arc::clone(chunk));
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Chunk at `index` if it is already playable
    pub fn get(&self, index: usize) -> Option<Arc<AudioChunk>> {
        self.lock().ready.get(index).cloned()
    }

    pub fn cursor(&self) -> usize {
        self.lock().cursor
    }

    /// Move the cursor past the chunk that just finished
    pub fn advance(&self) -> usize {
        let mut state = self.lock();
        state.cursor += 1;
        state.cursor
    }

    pub fn set_cursor(&self, index: usize) {
        self.lock().cursor = index;
    }

    pub fn reset_cursor(&self) {
        self.set_cursor(0);
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of chunks playable in order
    pub fn playable_len(&self) -> usize {
        self.lock().ready.len()
    }

    /// Number of chunks received, including early arrivals
    pub fn received(&self) -> usize {
        let state = self.lock();
        state.ready.len() + state.pending.len()
    }

    /// Closed and the cursor has passed the last chunk
    pub fn is_drained(&self) -> bool {
        let state = self.lock();
        state.closed && state.cursor >= state.ready.len()
    }

    /// Every received chunk in sequence order
    pub fn snapshot(&self) -> Vec<Arc<AudioChunk>> {
        let state = self.lock();
        state
            .ready
            .iter()
            .chain(state.pending.values())
            .cloned()
            .collect()
    }

    /// Forget everything and reopen
    pub fn clear(&self) {
        *self.lock() = QueueState::default();
        self.changed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_test::{assert_pending, assert_ready_eq, task};

    fn chunk(index: usize) -> AudioChunk {
        AudioChunk {
            sequence_index: index,
            audio: String::new(),
            sample_rate: 24000,
            speaker: String::new(),
            text: String::new(),
            voice_used: String::new(),
        }
    }

    fn order(queue: &ChunkQueue) -> Vec<usize> {
        queue.snapshot().iter().map(|c| c.sequence_index).collect()
    }

    #[test]
    fn test_reorders_by_index() {
        let queue = ChunkQueue::new();
        assert_eq!(queue.enqueue(chunk(2)), Enqueued::Buffered { missing: 0 });
        assert_eq!(queue.enqueue(chunk(1)), Enqueued::Buffered { missing: 0 });
        assert_eq!(queue.playable_len(), 0);
        assert_eq!(queue.enqueue(chunk(0)), Enqueued::Ready { playable: 3 });
        assert_eq!(order(&queue), vec![0, 1, 2]);
    }

    #[test]
    fn test_duplicates_are_dropped() {
        let queue = ChunkQueue::new();
        queue.enqueue(chunk(0));
        queue.enqueue(chunk(2));
        assert_eq!(queue.enqueue(chunk(0)), Enqueued::Duplicate);
        assert_eq!(queue.enqueue(chunk(2)), Enqueued::Duplicate);
        assert_eq!(queue.received(), 2);
    }

    #[test]
    fn test_close_flushes_gap() {
        let queue = ChunkQueue::new();
        queue.enqueue(chunk(0));
        queue.enqueue(chunk(3));
        queue.close();
        assert_eq!(queue.playable_len(), 2);
        assert_eq!(queue.get(1).unwrap().sequence_index, 3);
        assert_eq!(queue.enqueue(chunk(1)), Enqueued::Closed);
    }

    #[test]
    fn test_wait_blocks_until_enqueue() {
        let queue = ChunkQueue::new();
        let mut wait = task::spawn(queue.wait_at(0));
        assert_pending!(wait.poll());

        queue.enqueue(chunk(0));
        assert!(wait.is_woken());
        match wait.poll() {
            std::task::Poll::Ready(Some(c)) => assert_eq!(c.sequence_index, 0),
            other => panic!("unexpected poll result {other:?}"),
        }
    }

    #[test]
    fn test_wait_ends_on_close() {
        let queue = ChunkQueue::new();
        queue.enqueue(chunk(0));
        let mut wait = task::spawn(queue.wait_at(1));
        assert_pending!(wait.poll());

        queue.close();
        assert!(wait.is_woken());
        assert_ready_eq!(wait.poll(), None);
    }

    #[test]
    fn test_cursor_and_drain() {
        let queue = ChunkQueue::new();
        queue.enqueue(chunk(0));
        queue.enqueue(chunk(1));
        assert_eq!(queue.advance(), 1);
        queue.close();
        assert!(!queue.is_drained());
        queue.advance();
        assert!(queue.is_drained());

        queue.reset_cursor();
        assert_eq!(queue.cursor(), 0);
        assert!(!queue.is_drained());
    }

    #[tokio::test]
    async fn test_producer_slower_than_consumer() {
        let queue = Arc::new(ChunkQueue::new());
        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                for i in [1usize, 0, 2] {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    queue.enqueue(chunk(i));
                }
                queue.close();
            })
        };

        let mut seen = Vec::new();
        let mut index = 0;
        while let Some(c) = queue.wait_at(index).await {
            seen.push(c.sequence_index);
            index += 1;
        }
        producer.await.unwrap();
        assert_eq!(seen, vec![0, 1, 2]);
    }
}
