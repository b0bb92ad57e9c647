//! Input stream handlers: the per-node policies deciding when a node is
//! ready to run and which packets each invocation receives.

use std::sync::atomic::{AtomicI64, Ordering};

use crate::calculator::InputSet;
use crate::error::{GraphError, GraphResult};
use crate::packet::Packet;
use crate::stream::input::InputStreamManager;
use crate::timestamp::Timestamp;

/// What a handler decided about a node, given its input streams.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeReadiness {
    NotReady,
    /// Run `process` with the input set at this timestamp.
    ReadyForProcess(Timestamp),
    /// Every relevant input is exhausted; the node can be closed.
    ReadyForClose,
}

/// Policy deciding when a node becomes ready from its inputs and how the
/// queued packets are grouped into invocations.
///
/// A handler yields a sequence of input sets; for handlers that align
/// timestamps, successive input sets carry strictly increasing timestamps
/// (the framework enforces this when [`enforces_monotonicity`] is true).
///
/// [`enforces_monotonicity`]: InputStreamHandler::enforces_monotonicity
pub trait InputStreamHandler: Send + Sync {
    /// Called once per run before any readiness query.
    fn prepare_for_run(&self) {}

    /// Gives the handler a chance to drop queued packets before readiness is
    /// evaluated. Returns the local indices of streams whose queue dropped
    /// below the maximum size.
    fn prepare_readiness(&self, _streams: &[&InputStreamManager]) -> Vec<usize> {
        Vec::new()
    }

    fn readiness(&self, streams: &[&InputStreamManager]) -> GraphResult<NodeReadiness>;

    /// Pops the packets for one invocation at `timestamp` into `set`.
    /// Returns the local indices of streams whose queue dropped below the
    /// maximum size.
    fn fill_input_set(
        &self,
        timestamp: Timestamp,
        streams: &[&InputStreamManager],
        set: &mut InputSet,
    ) -> GraphResult<Vec<usize>>;

    /// Whether the framework should verify that invocation timestamps are
    /// strictly increasing for this handler.
    fn enforces_monotonicity(&self) -> bool {
        true
    }
}

/// Readiness shared by the timestamp-aligned handlers: the node is ready at
/// the smallest head timestamp, provided no packet-less stream could still
/// deliver a packet at that very timestamp.
fn aligned_readiness(streams: &[&InputStreamManager]) -> NodeReadiness {
    if streams.iter().all(|s| s.is_done()) {
        return NodeReadiness::ReadyForClose;
    }
    let mut min_head: Option<Timestamp> = None;
    let mut min_open_bound = Timestamp::DONE;
    for stream in streams {
        match stream.head_timestamp() {
            Some(head) => min_head = Some(min_head.map_or(head, |m| m.min(head))),
            None if !stream.is_done() => {
                min_open_bound = min_open_bound.min(stream.next_timestamp_bound());
            }
            None => {}
        }
    }
    match min_head {
        Some(t) if t < min_open_bound => NodeReadiness::ReadyForProcess(t),
        _ => NodeReadiness::NotReady,
    }
}

/// Pops, for every stream, the packet sitting exactly at `timestamp`.
fn aligned_fill(
    timestamp: Timestamp,
    streams: &[&InputStreamManager],
    set: &mut InputSet,
) -> Vec<usize> {
    let mut not_full = Vec::new();
    for (i, stream) in streams.iter().enumerate() {
        let (packet, events) = stream.pop_at(timestamp);
        set.packets[i] = packet.unwrap_or_else(|| Packet::empty().at(timestamp));
        if events.became_not_full {
            not_full.push(i);
        }
    }
    not_full
}

/// Timestamp-aligned delivery: one input set per timestamp, with empty slots
/// where a stream's bound already passed it.
#[derive(Default)]
pub struct DefaultInputStreamHandler;

impl InputStreamHandler for DefaultInputStreamHandler {
    fn readiness(&self, streams: &[&InputStreamManager]) -> GraphResult<NodeReadiness> {
        Ok(aligned_readiness(streams))
    }

    fn fill_input_set(
        &self,
        timestamp: Timestamp,
        streams: &[&InputStreamManager],
        set: &mut InputSet,
    ) -> GraphResult<Vec<usize>> {
        Ok(aligned_fill(timestamp, streams, set))
    }
}

/// Delivers every packet as soon as it arrives, one input per invocation;
/// timestamps across inputs need not align.
#[derive(Default)]
pub struct ImmediateInputStreamHandler;

impl InputStreamHandler for ImmediateInputStreamHandler {
    fn readiness(&self, streams: &[&InputStreamManager]) -> GraphResult<NodeReadiness> {
        if streams.iter().all(|s| s.is_done()) {
            return Ok(NodeReadiness::ReadyForClose);
        }
        let mut best: Option<Timestamp> = None;
        for stream in streams {
            if let Some(head) = stream.head_timestamp() {
                best = Some(best.map_or(head, |b| b.min(head)));
            }
        }
        Ok(match best {
            Some(t) => NodeReadiness::ReadyForProcess(t),
            None => NodeReadiness::NotReady,
        })
    }

    fn fill_input_set(
        &self,
        timestamp: Timestamp,
        streams: &[&InputStreamManager],
        set: &mut InputSet,
    ) -> GraphResult<Vec<usize>> {
        let mut not_full = Vec::new();
        for slot in set.packets.iter_mut() {
            *slot = Packet::empty().at(timestamp);
        }
        // Deliver exactly one packet: the earliest head, lowest index first.
        let chosen = streams
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.head_timestamp().map(|t| (t, i)))
            .min();
        if let Some((_, i)) = chosen {
            let (packet, events) = streams[i].pop_front();
            if let Some(packet) = packet {
                set.packets[i] = packet;
            }
            if events.became_not_full {
                not_full.push(i);
            }
        }
        Ok(not_full)
    }

    fn enforces_monotonicity(&self) -> bool {
        false
    }
}

/// Groups the i-th packet of every input into the i-th invocation, ignoring
/// timestamps entirely. Invocation timestamps are synthesized as 0, 1, 2, …
pub struct BarrierInputStreamHandler {
    invocation: AtomicI64,
}

impl Default for BarrierInputStreamHandler {
    fn default() -> Self {
        BarrierInputStreamHandler {
            invocation: AtomicI64::new(0),
        }
    }
}

impl InputStreamHandler for BarrierInputStreamHandler {
    fn prepare_for_run(&self) {
        self.invocation.store(0, Ordering::Relaxed);
    }

    fn readiness(&self, streams: &[&InputStreamManager]) -> GraphResult<NodeReadiness> {
        if streams.iter().all(|s| !s.is_empty()) {
            let n = self.invocation.load(Ordering::Relaxed);
            return Ok(NodeReadiness::ReadyForProcess(Timestamp::new(n)));
        }
        if streams.iter().any(|s| s.is_done()) {
            // Some input is exhausted, no barrier can ever complete again.
            return Ok(NodeReadiness::ReadyForClose);
        }
        Ok(NodeReadiness::NotReady)
    }

    fn fill_input_set(
        &self,
        timestamp: Timestamp,
        streams: &[&InputStreamManager],
        set: &mut InputSet,
    ) -> GraphResult<Vec<usize>> {
        self.invocation.fetch_add(1, Ordering::Relaxed);
        let mut not_full = Vec::new();
        for (i, stream) in streams.iter().enumerate() {
            let (packet, events) = stream.pop_front();
            set.packets[i] = packet.unwrap_or_else(|| Packet::empty().at(timestamp));
            if events.became_not_full {
                not_full.push(i);
            }
        }
        Ok(not_full)
    }

    fn enforces_monotonicity(&self) -> bool {
        false
    }
}

/// Timestamp-aligned delivery that closes the node as soon as any input is
/// exhausted. Used by nodes on a cycle, which would otherwise wait forever
/// on their back edge.
#[derive(Default)]
pub struct EarlyCloseInputStreamHandler;

impl InputStreamHandler for EarlyCloseInputStreamHandler {
    fn readiness(&self, streams: &[&InputStreamManager]) -> GraphResult<NodeReadiness> {
        if streams.iter().any(|s| s.is_done()) {
            return Ok(NodeReadiness::ReadyForClose);
        }
        Ok(aligned_readiness(streams))
    }

    fn fill_input_set(
        &self,
        timestamp: Timestamp,
        streams: &[&InputStreamManager],
        set: &mut InputSet,
    ) -> GraphResult<Vec<usize>> {
        Ok(aligned_fill(timestamp, streams, set))
    }
}

/// Timestamp-aligned delivery that bounds every queue to a fixed number of
/// packets, dropping the oldest ones. The drops are the one sanctioned way
/// for packets to disappear from a stream.
pub struct FixedSizeInputStreamHandler {
    target_queue_size: usize,
}

impl FixedSizeInputStreamHandler {
    pub fn new(target_queue_size: usize) -> Self {
        FixedSizeInputStreamHandler { target_queue_size }
    }

    pub(crate) fn from_options(options: &serde_json::Value) -> GraphResult<Self> {
        let target = options
            .get("target_queue_size")
            .map(|v| {
                v.as_u64().ok_or_else(|| {
                    GraphError::InvalidArgument(
                        "target_queue_size must be a non-negative integer".into(),
                    )
                })
            })
            .transpose()?
            .unwrap_or(1);
        Ok(FixedSizeInputStreamHandler::new(target as usize))
    }
}

impl InputStreamHandler for FixedSizeInputStreamHandler {
    fn prepare_readiness(&self, streams: &[&InputStreamManager]) -> Vec<usize> {
        let mut not_full = Vec::new();
        for (i, stream) in streams.iter().enumerate() {
            let (dropped, events) = stream.truncate_to(self.target_queue_size);
            if dropped > 0 {
                trace!(
                    "dropped {dropped} stale packets from stream '{}'",
                    stream.name()
                );
            }
            if events.became_not_full {
                not_full.push(i);
            }
        }
        not_full
    }

    fn readiness(&self, streams: &[&InputStreamManager]) -> GraphResult<NodeReadiness> {
        Ok(aligned_readiness(streams))
    }

    fn fill_input_set(
        &self,
        timestamp: Timestamp,
        streams: &[&InputStreamManager],
        set: &mut InputSet,
    ) -> GraphResult<Vec<usize>> {
        Ok(aligned_fill(timestamp, streams, set))
    }

    fn enforces_monotonicity(&self) -> bool {
        false
    }
}

/// Multiplexer policy: the last input stream carries integer selections, the
/// others carry data. An invocation needs the control packet plus the packet
/// of the selected data stream at the same timestamp; the other data streams
/// are drained past it.
#[derive(Default)]
pub struct MuxInputStreamHandler;

impl MuxInputStreamHandler {
    fn select(&self, control: &Packet, num_data: usize) -> GraphResult<usize> {
        let select = *control.get::<i32>()? as usize;
        if select >= num_data {
            return Err(GraphError::InvalidArgument(format!(
                "mux select value {select} exceeds the {num_data} data streams"
            )));
        }
        Ok(select)
    }
}

impl InputStreamHandler for MuxInputStreamHandler {
    fn readiness(&self, streams: &[&InputStreamManager]) -> GraphResult<NodeReadiness> {
        let (control, data) = streams.split_last().ok_or_else(|| {
            GraphError::InvalidArgument("mux handler needs at least a control stream".into())
        })?;
        if control.is_done() {
            return Ok(NodeReadiness::ReadyForClose);
        }
        let Some(control_packet) = control.peek_head() else {
            return Ok(NodeReadiness::NotReady);
        };
        let t = control_packet.timestamp();
        let select = self.select(&control_packet, data.len())?;
        let selected = data[select];
        match selected.head_timestamp() {
            Some(head) if head == t => Ok(NodeReadiness::ReadyForProcess(t)),
            Some(head) if head < t => {
                // Stale data below the control timestamp; drop it and look
                // again on the next notification.
                selected.discard_before(t);
                self.readiness(streams)
            }
            _ if selected.next_timestamp_bound() > t => Err(GraphError::InvalidArgument(format!(
                "mux data stream '{}' has no packet at {t}",
                selected.name()
            ))),
            _ => Ok(NodeReadiness::NotReady),
        }
    }

    fn fill_input_set(
        &self,
        timestamp: Timestamp,
        streams: &[&InputStreamManager],
        set: &mut InputSet,
    ) -> GraphResult<Vec<usize>> {
        let (control, data) = streams.split_last().expect("checked in readiness");
        let control_index = streams.len() - 1;
        let mut not_full = Vec::new();

        let control_packet = control
            .peek_head()
            .ok_or_else(|| GraphError::Internal("mux control packet disappeared".into()))?;
        let select = self.select(&control_packet, data.len())?;

        for (i, stream) in data.iter().enumerate() {
            if i == select {
                continue;
            }
            set.packets[i] = Packet::empty().at(timestamp);
            let (_, events) = stream.discard_before(timestamp.next_allowed_in_stream()?);
            if events.became_not_full {
                not_full.push(i);
            }
        }

        let (packet, events) = data[select].pop_at(timestamp);
        set.packets[select] = packet
            .ok_or_else(|| GraphError::Internal("mux selected packet disappeared".into()))?;
        if events.became_not_full {
            not_full.push(select);
        }

        let (packet, events) = control.pop_at(timestamp);
        set.packets[control_index] = packet
            .ok_or_else(|| GraphError::Internal("mux control packet disappeared".into()))?;
        if events.became_not_full {
            not_full.push(control_index);
        }

        Ok(not_full)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::input::StreamConsumer;

    fn stream(name: &str) -> InputStreamManager {
        let m = InputStreamManager::new(
            name,
            StreamConsumer::Node {
                node_id: 0,
                input_index: 0,
            },
            false,
        );
        m.prepare_for_run(-1);
        m
    }

    fn packet(value: i32, ts: i64) -> Packet {
        Packet::new(value).at(Timestamp::new(ts))
    }

    #[test]
    fn default_waits_for_unsettled_bounds() {
        let a = stream("a");
        let b = stream("b");
        let handler = DefaultInputStreamHandler;

        a.add_packets([packet(1, 5)]).unwrap();
        // b could still deliver a packet at 5.
        b.set_next_timestamp_bound(Timestamp::new(5));
        let streams = [&a, &b];
        assert_eq!(handler.readiness(&streams).unwrap(), NodeReadiness::NotReady);

        // Once b's bound passes 5, the node is ready with b empty.
        b.set_next_timestamp_bound(Timestamp::new(6));
        assert_eq!(
            handler.readiness(&streams).unwrap(),
            NodeReadiness::ReadyForProcess(Timestamp::new(5))
        );

        let mut set = InputSet::empty(2);
        handler
            .fill_input_set(Timestamp::new(5), &streams, &mut set)
            .unwrap();
        assert_eq!(*set.get(0).get::<i32>().unwrap(), 1);
        assert!(set.get(1).is_empty());
    }

    #[test]
    fn default_closes_when_all_inputs_are_done() {
        let a = stream("a");
        let b = stream("b");
        let handler = DefaultInputStreamHandler;
        a.set_next_timestamp_bound(Timestamp::DONE);
        b.close();
        assert_eq!(
            handler.readiness(&[&a, &b]).unwrap(),
            NodeReadiness::ReadyForClose
        );
    }

    #[test]
    fn immediate_delivers_single_packets() {
        let a = stream("a");
        let b = stream("b");
        let handler = ImmediateInputStreamHandler;
        b.add_packets([packet(7, 3)]).unwrap();
        a.add_packets([packet(9, 10)]).unwrap();

        let streams = [&a, &b];
        let NodeReadiness::ReadyForProcess(t) = handler.readiness(&streams).unwrap() else {
            panic!("expected readiness");
        };
        assert_eq!(t, Timestamp::new(3));
        let mut set = InputSet::empty(2);
        handler.fill_input_set(t, &streams, &mut set).unwrap();
        assert!(set.get(0).is_empty());
        assert_eq!(*set.get(1).get::<i32>().unwrap(), 7);
    }

    #[test]
    fn barrier_groups_by_position() {
        let a = stream("a");
        let b = stream("b");
        let handler = BarrierInputStreamHandler::default();
        handler.prepare_for_run();
        a.add_packets([packet(1, 100)]).unwrap();
        assert_eq!(
            handler.readiness(&[&a, &b]).unwrap(),
            NodeReadiness::NotReady
        );
        b.add_packets([packet(2, 1)]).unwrap();
        let NodeReadiness::ReadyForProcess(t) = handler.readiness(&[&a, &b]).unwrap() else {
            panic!("expected readiness");
        };
        assert_eq!(t, Timestamp::new(0));
        let mut set = InputSet::empty(2);
        handler.fill_input_set(t, &[&a, &b], &mut set).unwrap();
        assert_eq!(*set.get(0).get::<i32>().unwrap(), 1);
        assert_eq!(*set.get(1).get::<i32>().unwrap(), 2);
    }

    #[test]
    fn early_close_fires_on_first_done_input() {
        let a = stream("a");
        let b = stream("b");
        let handler = EarlyCloseInputStreamHandler;
        b.add_packets([packet(1, 0)]).unwrap();
        a.set_next_timestamp_bound(Timestamp::DONE);
        assert_eq!(
            handler.readiness(&[&a, &b]).unwrap(),
            NodeReadiness::ReadyForClose
        );
    }

    #[test]
    fn fixed_size_drops_the_oldest() {
        let a = stream("a");
        let handler = FixedSizeInputStreamHandler::new(1);
        a.add_packets([packet(0, 0), packet(1, 1), packet(2, 2)])
            .unwrap();
        handler.prepare_readiness(&[&a]);
        assert_eq!(a.queue_size(), 1);
        assert_eq!(a.head_timestamp(), Some(Timestamp::new(2)));
    }

    #[test]
    fn mux_consumes_unselected_streams() {
        let select = stream("select");
        let d0 = stream("d0");
        let d1 = stream("d1");
        let handler = MuxInputStreamHandler;

        d0.add_packets([packet(10, 0)]).unwrap();
        d1.add_packets([packet(20, 0)]).unwrap();
        select.add_packets([Packet::new(1i32).at(Timestamp::new(0))])
            .unwrap();

        let streams = [&d0, &d1, &select];
        let NodeReadiness::ReadyForProcess(t) = handler.readiness(&streams).unwrap() else {
            panic!("expected readiness");
        };
        let mut set = InputSet::empty(3);
        handler.fill_input_set(t, &streams, &mut set).unwrap();
        assert!(set.get(0).is_empty());
        assert_eq!(*set.get(1).get::<i32>().unwrap(), 20);
        assert_eq!(*set.get(2).get::<i32>().unwrap(), 1);
        // The unselected packet at the same timestamp was discarded.
        assert!(d0.is_empty());
    }
}
