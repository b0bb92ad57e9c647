//! Producer side of a stream: the per-invocation staging shard and the
//! manager that owns the stream state between invocations.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::calculator::TypeSpec;
use crate::error::{GraphError, GraphResult};
use crate::packet::Packet;
use crate::timestamp::Timestamp;

/// Immutable description of an output stream.
#[derive(Debug, Clone)]
pub(crate) struct OutputStreamSpec {
    pub name: Arc<str>,
    /// Declared payload type; `None` accepts anything.
    pub type_spec: Option<TypeSpec>,
}

impl OutputStreamSpec {
    fn check_type(&self, packet: &Packet) -> GraphResult {
        if let Some(spec) = &self.type_spec {
            if packet.payload_type_id() != Some(spec.type_id) {
                return Err(GraphError::InvalidArgument(format!(
                    "stream '{}' carries {} but a {} was emitted",
                    self.name,
                    spec.type_name,
                    packet.type_name()
                )));
            }
        }
        Ok(())
    }
}

/// The scratch area handed to a calculator for one lifecycle invocation.
///
/// Packets collected here are not visible downstream until the invocation
/// returns and the framework propagates the whole shard atomically.
pub struct OutputStreamShard {
    pub(crate) spec: Arc<OutputStreamSpec>,
    pub(crate) packets: Vec<Packet>,
    pub(crate) next_timestamp_bound: Option<Timestamp>,
    pub(crate) header: Option<Packet>,
    pub(crate) close_requested: bool,
    /// Bound of the stream when the shard was prepared; emissions below it
    /// are rejected immediately.
    base_bound: Timestamp,
    /// Whether the stream was already closed when the shard was prepared.
    stream_closed: bool,
    last_added: Option<Timestamp>,
}

impl OutputStreamShard {
    pub(crate) fn new(
        spec: Arc<OutputStreamSpec>,
        base_bound: Timestamp,
        stream_closed: bool,
    ) -> OutputStreamShard {
        OutputStreamShard {
            spec,
            packets: Vec::new(),
            next_timestamp_bound: None,
            header: None,
            close_requested: false,
            base_bound,
            stream_closed,
            last_added: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Emits a packet. The timestamp must be valid for streaming, must not
    /// precede the stream's current bound and must strictly increase within
    /// the invocation.
    pub fn add_packet(&mut self, packet: Packet) -> GraphResult {
        if self.stream_closed || self.close_requested {
            return Err(GraphError::FailedPrecondition(format!(
                "write to closed stream '{}'",
                self.spec.name
            )));
        }
        if packet.is_empty() {
            return Err(GraphError::InvalidArgument(format!(
                "cannot emit an empty packet on stream '{}'",
                self.spec.name
            )));
        }
        let ts = packet.timestamp();
        if !ts.is_allowed_in_stream() {
            return Err(GraphError::InvalidArgument(format!(
                "timestamp {ts} is not valid for stream '{}'",
                self.spec.name
            )));
        }
        if ts < self.base_bound {
            return Err(GraphError::InvalidArgument(format!(
                "timestamp {ts} on stream '{}' is below the stream bound {}",
                self.spec.name, self.base_bound
            )));
        }
        if let Some(last) = self.last_added {
            if ts <= last {
                return Err(GraphError::InvalidArgument(format!(
                    "timestamp {ts} on stream '{}' does not increase over {last}",
                    self.spec.name
                )));
            }
        }
        self.spec.check_type(&packet)?;
        self.last_added = Some(ts);
        self.packets.push(packet);
        Ok(())
    }

    /// Convenience for `add_packet(Packet::new(value).at(timestamp))`.
    pub fn add<T: std::any::Any + Send + Sync>(
        &mut self,
        value: T,
        timestamp: Timestamp,
    ) -> GraphResult {
        self.add_packet(Packet::new(value).at(timestamp))
    }

    /// Promises that no packet below `bound` will ever be emitted, even
    /// without emitting anything now.
    pub fn set_next_timestamp_bound(&mut self, bound: Timestamp) -> GraphResult {
        if bound < self.base_bound {
            return Err(GraphError::InvalidArgument(format!(
                "bound {bound} on stream '{}' regresses below {}",
                self.spec.name, self.base_bound
            )));
        }
        self.next_timestamp_bound = Some(self.next_timestamp_bound.unwrap_or(bound).max(bound));
        Ok(())
    }

    /// Sets the stream header. Only honored during `open`.
    pub fn set_header(&mut self, header: Packet) {
        self.header = Some(header);
    }

    /// Closes the stream once the invocation returns. Idempotent.
    pub fn close(&mut self) {
        self.close_requested = true;
    }

    pub(crate) fn is_unchanged(&self) -> bool {
        self.packets.is_empty()
            && self.next_timestamp_bound.is_none()
            && self.header.is_none()
            && !self.close_requested
    }
}

/// The outcome of committing a shard: what must be forwarded to the mirrors.
#[derive(Debug)]
pub(crate) struct ShardCommit {
    pub packets: Vec<Packet>,
    /// New bound of the stream after this commit.
    pub bound: Timestamp,
    /// True if the bound advanced past its previous value.
    pub bound_advanced: bool,
    /// Set if this commit closed the stream.
    pub closed_now: bool,
    pub header: Option<Packet>,
}

struct OutputStreamState {
    next_timestamp_bound: Timestamp,
    closed: bool,
    header: Option<Packet>,
    offset: Option<i64>,
}

/// An observer registered on an output stream.
pub(crate) struct StreamObserver {
    pub callback: Mutex<Box<dyn FnMut(&Packet) -> GraphResult + Send>>,
    pub observe_timestamp_bounds: bool,
}

/// Producer-side bookkeeping of one stream: current bound, closed flag,
/// header, the downstream mirrors and the registered observers.
pub(crate) struct OutputStreamManager {
    spec: Arc<OutputStreamSpec>,
    /// Input stream manager indices fed by this stream.
    mirrors: RwLock<Vec<usize>>,
    observers: RwLock<Vec<StreamObserver>>,
    state: Mutex<OutputStreamState>,
}

impl OutputStreamManager {
    pub fn new(name: &str, type_spec: Option<TypeSpec>) -> OutputStreamManager {
        OutputStreamManager {
            spec: Arc::new(OutputStreamSpec {
                name: name.into(),
                type_spec,
            }),
            mirrors: RwLock::new(Vec::new()),
            observers: RwLock::new(Vec::new()),
            state: Mutex::new(OutputStreamState {
                next_timestamp_bound: Timestamp::PRE_STREAM,
                closed: false,
                header: None,
                offset: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn prepare_for_run(&self) {
        let mut state = self.state.lock();
        state.next_timestamp_bound = Timestamp::PRE_STREAM;
        state.closed = false;
        state.header = None;
        state.offset = None;
    }

    pub fn add_mirror(&self, input_stream_index: usize) {
        self.mirrors.write().push(input_stream_index);
    }

    pub fn mirrors(&self) -> Vec<usize> {
        self.mirrors.read().clone()
    }

    pub fn add_observer(&self, observer: StreamObserver) {
        self.observers.write().push(observer);
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn set_header(&self, header: Packet) {
        self.state.lock().header = Some(header);
    }

    pub fn next_timestamp_bound(&self) -> Timestamp {
        self.state.lock().next_timestamp_bound
    }

    /// Records the timestamp offset declared by the producing node's `open`.
    pub fn set_offset(&self, offset: Option<i64>) {
        self.state.lock().offset = offset;
    }

    /// Prepares the staging shard for one invocation of the producer.
    pub fn make_shard(&self) -> OutputStreamShard {
        let state = self.state.lock();
        OutputStreamShard::new(self.spec.clone(), state.next_timestamp_bound, state.closed)
    }

    /// Folds a returned shard into the stream state.
    ///
    /// `input_timestamp` is the timestamp of the invocation that produced the
    /// shard; together with the declared offset it advances the bound even
    /// when nothing was emitted.
    pub fn commit_shard(
        &self,
        shard: OutputStreamShard,
        input_timestamp: Option<Timestamp>,
    ) -> GraphResult<ShardCommit> {
        let mut state = self.state.lock();
        if state.closed {
            // The stream was closed concurrently (e.g. the run is winding
            // down); drop the emissions instead of resurrecting it.
            return Ok(ShardCommit {
                packets: Vec::new(),
                bound: Timestamp::DONE,
                bound_advanced: false,
                closed_now: false,
                header: None,
            });
        }

        let previous_bound = state.next_timestamp_bound;
        let mut bound = previous_bound;
        if let Some(last) = shard.packets.last() {
            bound = bound.max(last.timestamp().next_allowed_in_stream()?);
        }
        if let Some(explicit) = shard.next_timestamp_bound {
            bound = bound.max(explicit);
        }
        if let (Some(offset), Some(ts)) = (state.offset, input_timestamp) {
            // Source invocations carry no input timestamp worth offsetting.
            if ts.is_allowed_in_stream() {
                let implied = ts.saturating_add(offset).next_allowed_in_stream()?;
                bound = bound.max(implied);
            }
        }
        if shard.close_requested {
            bound = Timestamp::DONE;
            state.closed = true;
        }
        state.next_timestamp_bound = bound;
        if let Some(header) = &shard.header {
            state.header = Some(header.clone());
        }

        Ok(ShardCommit {
            packets: shard.packets,
            bound,
            bound_advanced: bound > previous_bound,
            closed_now: shard.close_requested,
            header: shard.header,
        })
    }

    /// Advances the bound without emissions, as implied by the producer's
    /// declared offset. Returns the commit to propagate, if the bound moved.
    pub fn advance_bound(&self, bound: Timestamp) -> Option<ShardCommit> {
        let mut state = self.state.lock();
        if state.closed || bound <= state.next_timestamp_bound {
            return None;
        }
        state.next_timestamp_bound = bound;
        Some(ShardCommit {
            packets: Vec::new(),
            bound,
            bound_advanced: true,
            closed_now: false,
            header: None,
        })
    }

    /// Closes the stream directly (without a shard). Returns `false` if it
    /// was already closed.
    pub fn close(&self) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.closed = true;
        state.next_timestamp_bound = Timestamp::DONE;
        true
    }

    /// Invokes the observer callbacks for a committed shard, in emission
    /// order. Bound-only progress is delivered as an empty packet to the
    /// observers that asked for it. Returns whether any packet reached an
    /// observer, plus the errors returned by the callbacks.
    pub fn notify_observers(&self, commit: &ShardCommit) -> (bool, Vec<GraphError>) {
        let observers = self.observers.read();
        if observers.is_empty() {
            return (false, Vec::new());
        }
        let mut errors = Vec::new();
        for observer in observers.iter() {
            let mut callback = observer.callback.lock();
            for packet in &commit.packets {
                if let Err(e) = callback(packet) {
                    errors.push(e);
                }
            }
            if commit.packets.is_empty()
                && commit.bound_advanced
                && observer.observe_timestamp_bounds
            {
                // A closed stream reports a terminal bound, never a packet.
                let bound_packet = Packet::empty().at(commit.bound);
                if let Err(e) = callback(&bound_packet) {
                    errors.push(e);
                }
            }
        }
        (!commit.packets.is_empty(), errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard(manager: &OutputStreamManager) -> OutputStreamShard {
        manager.make_shard()
    }

    #[test]
    fn emissions_must_increase() {
        let manager = OutputStreamManager::new("out", None);
        let mut s = shard(&manager);
        s.add(1i32, Timestamp::new(5)).unwrap();
        let err = s.add(2i32, Timestamp::new(5)).unwrap_err();
        assert!(matches!(err, GraphError::InvalidArgument(_)));
        s.add(2i32, Timestamp::new(6)).unwrap();
    }

    #[test]
    fn commit_advances_bound_past_last_packet() {
        let manager = OutputStreamManager::new("out", None);
        let mut s = shard(&manager);
        s.add(1i32, Timestamp::new(3)).unwrap();
        let commit = manager.commit_shard(s, None).unwrap();
        assert_eq!(commit.bound, Timestamp::new(4));
        assert!(commit.bound_advanced);
        assert_eq!(manager.next_timestamp_bound(), Timestamp::new(4));

        // A later shard may not emit below the new bound.
        let mut s = shard(&manager);
        let err = s.add(9i32, Timestamp::new(3)).unwrap_err();
        assert!(matches!(err, GraphError::InvalidArgument(_)));
    }

    #[test]
    fn offset_advances_bound_without_packets() {
        let manager = OutputStreamManager::new("out", None);
        manager.set_offset(Some(0));
        let s = shard(&manager);
        let commit = manager.commit_shard(s, Some(Timestamp::new(10))).unwrap();
        assert_eq!(commit.bound, Timestamp::new(11));
        assert!(commit.bound_advanced);
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let manager = OutputStreamManager::new("ints", Some(TypeSpec::of::<i32>()));
        let mut s = shard(&manager);
        assert!(s.add(1i32, Timestamp::new(0)).is_ok());
        let err = s.add("nope", Timestamp::new(1)).unwrap_err();
        assert!(err.to_string().contains("ints"));
    }

    #[test]
    fn close_is_idempotent() {
        let manager = OutputStreamManager::new("out", None);
        assert!(manager.close());
        assert!(!manager.close());
        assert!(manager.is_closed());

        let mut s = shard(&manager);
        assert!(s.add(1i32, Timestamp::new(0)).is_err());
    }
}
