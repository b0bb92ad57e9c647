//! Consumer side of a stream: the ordered packet queue owned by one
//! consumer, with timestamp-bound and fullness accounting.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{GraphError, GraphResult};
use crate::packet::Packet;
use crate::timestamp::Timestamp;

/// Who consumes an input stream manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamConsumer {
    /// A calculator node, by id; `input_index` is the position among the
    /// node's inputs.
    Node { node_id: usize, input_index: usize },
    /// An output stream poller, by index in the graph's poller table.
    Poller(usize),
}

/// Fullness transitions produced by a queue mutation. The caller forwards
/// them to the graph's throttling bookkeeping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueEvents {
    pub became_full: bool,
    pub became_not_full: bool,
}

impl QueueEvents {
    pub fn merge(&mut self, other: QueueEvents) {
        // Opposite transitions cancel out; the last state wins.
        if other.became_full {
            if self.became_not_full {
                self.became_not_full = false;
            } else {
                self.became_full = true;
            }
        }
        if other.became_not_full {
            if self.became_full {
                self.became_full = false;
            } else {
                self.became_not_full = true;
            }
        }
    }
}

struct InputStreamState {
    queue: VecDeque<Packet>,
    next_timestamp_bound: Timestamp,
    closed: bool,
    header: Option<Packet>,
    max_queue_size: i32,
    was_full: bool,
}

impl InputStreamState {
    fn is_full(&self) -> bool {
        self.max_queue_size >= 1 && self.queue.len() >= self.max_queue_size as usize
    }

    /// Updates the reported fullness and returns the transition, if any.
    fn fullness_transition(&mut self) -> QueueEvents {
        let now_full = self.is_full();
        let events = QueueEvents {
            became_full: !self.was_full && now_full,
            became_not_full: self.was_full && !now_full,
        };
        self.was_full = now_full;
        events
    }
}

/// The FIFO queue of packets of one (stream, consumer) edge.
///
/// All operations are O(1) under a per-stream lock. Mutations return
/// [`QueueEvents`] instead of invoking callbacks, so the arena of stream
/// managers stays free of cross-references.
pub struct InputStreamManager {
    name: Arc<str>,
    consumer: StreamConsumer,
    back_edge: bool,
    state: Mutex<InputStreamState>,
}

impl InputStreamManager {
    pub fn new(name: &str, consumer: StreamConsumer, back_edge: bool) -> InputStreamManager {
        InputStreamManager {
            name: name.into(),
            consumer,
            back_edge,
            state: Mutex::new(InputStreamState {
                queue: VecDeque::new(),
                next_timestamp_bound: Timestamp::PRE_STREAM,
                closed: false,
                header: None,
                max_queue_size: -1,
                was_full: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn consumer(&self) -> StreamConsumer {
        self.consumer
    }

    pub fn is_back_edge(&self) -> bool {
        self.back_edge
    }

    pub fn prepare_for_run(&self, max_queue_size: i32) {
        let mut state = self.state.lock();
        state.queue.clear();
        state.next_timestamp_bound = Timestamp::PRE_STREAM;
        state.closed = false;
        state.header = None;
        state.max_queue_size = max_queue_size;
        state.was_full = false;
    }

    /// Appends packets (already in increasing timestamp order from the
    /// producer). Packets arriving after the consumer closed are dropped.
    pub fn add_packets(&self, packets: impl IntoIterator<Item = Packet>) -> GraphResult<QueueEvents> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(QueueEvents::default());
        }
        for packet in packets {
            let ts = packet.timestamp();
            if !ts.is_allowed_in_stream() {
                return Err(GraphError::InvalidArgument(format!(
                    "timestamp {ts} is not valid for stream '{}'",
                    self.name
                )));
            }
            if ts < state.next_timestamp_bound {
                return Err(GraphError::InvalidArgument(format!(
                    "timestamp {ts} on stream '{}' is below the bound {}",
                    self.name, state.next_timestamp_bound
                )));
            }
            state.next_timestamp_bound = ts.next_allowed_in_stream()?;
            state.queue.push_back(packet);
        }
        Ok(state.fullness_transition())
    }

    /// Advances the bound; lowering it is a no-op. Returns whether the bound
    /// actually moved (which may change the consumer's readiness).
    pub fn set_next_timestamp_bound(&self, bound: Timestamp) -> bool {
        let mut state = self.state.lock();
        if state.closed || bound <= state.next_timestamp_bound {
            return false;
        }
        state.next_timestamp_bound = bound;
        true
    }

    /// Closes the consumer side, discarding anything still queued.
    /// Idempotent.
    pub fn close(&self) -> QueueEvents {
        let mut state = self.state.lock();
        if state.closed {
            return QueueEvents::default();
        }
        state.closed = true;
        state.queue.clear();
        state.next_timestamp_bound = Timestamp::DONE;
        state.fullness_transition()
    }

    /// True when nothing can ever be delivered anymore.
    pub fn is_done(&self) -> bool {
        let state = self.state.lock();
        state.closed || (state.queue.is_empty() && state.next_timestamp_bound == Timestamp::DONE)
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }

    pub fn queue_size(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_full(&self) -> bool {
        self.state.lock().is_full()
    }

    pub fn head_timestamp(&self) -> Option<Timestamp> {
        self.state.lock().queue.front().map(|p| p.timestamp())
    }

    /// Clones the head packet without consuming it.
    pub fn peek_head(&self) -> Option<Packet> {
        self.state.lock().queue.front().cloned()
    }

    pub fn next_timestamp_bound(&self) -> Timestamp {
        self.state.lock().next_timestamp_bound
    }

    /// Pops the head packet if it sits exactly at `timestamp`.
    pub fn pop_at(&self, timestamp: Timestamp) -> (Option<Packet>, QueueEvents) {
        let mut state = self.state.lock();
        let popped = match state.queue.front() {
            Some(head) if head.timestamp() == timestamp => state.queue.pop_front(),
            _ => None,
        };
        let events = state.fullness_transition();
        (popped, events)
    }

    pub fn pop_front(&self) -> (Option<Packet>, QueueEvents) {
        let mut state = self.state.lock();
        let popped = state.queue.pop_front();
        let events = state.fullness_transition();
        (popped, events)
    }

    /// Drops every queued packet with a timestamp strictly below `timestamp`.
    pub fn discard_before(&self, timestamp: Timestamp) -> (usize, QueueEvents) {
        let mut state = self.state.lock();
        let mut dropped = 0;
        while matches!(state.queue.front(), Some(head) if head.timestamp() < timestamp) {
            state.queue.pop_front();
            dropped += 1;
        }
        let events = state.fullness_transition();
        (dropped, events)
    }

    /// Keeps only the newest `keep` packets, dropping the oldest ones.
    pub fn truncate_to(&self, keep: usize) -> (usize, QueueEvents) {
        let mut state = self.state.lock();
        let mut dropped = 0;
        while state.queue.len() > keep {
            state.queue.pop_front();
            dropped += 1;
        }
        let events = state.fullness_transition();
        (dropped, events)
    }

    pub fn max_queue_size(&self) -> i32 {
        self.state.lock().max_queue_size
    }

    pub fn set_max_queue_size(&self, max_queue_size: i32) -> QueueEvents {
        let mut state = self.state.lock();
        state.max_queue_size = max_queue_size;
        state.fullness_transition()
    }

    pub fn header(&self) -> Option<Packet> {
        self.state.lock().header.clone()
    }

    pub fn set_header(&self, header: Packet) {
        self.state.lock().header = Some(header);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(max: i32) -> InputStreamManager {
        let m = InputStreamManager::new(
            "in",
            StreamConsumer::Node {
                node_id: 0,
                input_index: 0,
            },
            false,
        );
        m.prepare_for_run(max);
        m
    }

    fn packet(ts: i64) -> Packet {
        Packet::new(ts).at(Timestamp::new(ts))
    }

    #[test]
    fn packets_below_bound_are_rejected() {
        let m = manager(-1);
        m.add_packets([packet(5)]).unwrap();
        assert_eq!(m.next_timestamp_bound(), Timestamp::new(6));
        let err = m.add_packets([packet(5)]).unwrap_err();
        assert!(matches!(err, GraphError::InvalidArgument(_)));
    }

    #[test]
    fn fullness_transitions_fire_once() {
        let m = manager(2);
        assert_eq!(m.add_packets([packet(0)]).unwrap(), QueueEvents::default());
        let events = m.add_packets([packet(1)]).unwrap();
        assert!(events.became_full);
        // Still full, no new transition.
        let (p, events) = m.pop_at(Timestamp::new(0));
        assert!(p.is_some());
        assert!(events.became_not_full);
        let (_, events) = m.pop_at(Timestamp::new(1));
        assert_eq!(events, QueueEvents::default());
    }

    #[test]
    fn growing_the_queue_unfills_it() {
        let m = manager(1);
        let events = m.add_packets([packet(0)]).unwrap();
        assert!(events.became_full);
        let events = m.set_max_queue_size(2);
        assert!(events.became_not_full);
    }

    #[test]
    fn done_via_bound_or_close() {
        let m = manager(-1);
        assert!(!m.is_done());
        m.set_next_timestamp_bound(Timestamp::DONE);
        assert!(m.is_done());

        let m = manager(-1);
        m.add_packets([packet(0)]).unwrap();
        m.set_next_timestamp_bound(Timestamp::DONE);
        // A queued packet keeps the stream alive until it is consumed.
        assert!(!m.is_done());
        m.pop_at(Timestamp::new(0));
        assert!(m.is_done());

        let m = manager(-1);
        m.add_packets([packet(0)]).unwrap();
        m.close();
        assert!(m.is_done());
        assert!(m.is_empty());
    }

    #[test]
    fn close_drops_late_arrivals() {
        let m = manager(-1);
        m.close();
        assert_eq!(m.add_packets([packet(3)]).unwrap(), QueueEvents::default());
        assert!(m.is_empty());
    }
}
