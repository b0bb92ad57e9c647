//! Calculators and helpers shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Once};

use flowgraph::prelude::*;
use flowgraph::register_calculator;

/// Initializes logging and registers every test calculator, once per test
/// binary.
pub fn setup() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
        register_calculators();
    });
}

/// A thread-safe collector the tests hand to observers and close trackers.
#[derive(Clone, Default)]
pub struct Collector<T> {
    items: Arc<Mutex<Vec<T>>>,
}

impl<T: Clone> Collector<T> {
    pub fn new() -> Self {
        Collector {
            items: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn push(&self, item: T) {
        self.items.lock().unwrap().push(item);
    }

    pub fn items(&self) -> Vec<T> {
        self.items.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }
}

/// Observes a stream into a collector of `(timestamp value, payload)` pairs.
pub fn collect_stream<T: Clone + Send + Sync + 'static>(
    graph: &Graph,
    stream: &str,
    collector: &Collector<(i64, T)>,
) {
    let sink = collector.clone();
    graph
        .observe_output_stream(
            stream,
            move |packet| {
                sink.push((packet.timestamp().value(), packet.get::<T>()?.clone()));
                Ok(())
            },
            false,
        )
        .unwrap();
}

fn options_i64(cc: &CalculatorContext, key: &str, default: i64) -> i64 {
    cc.options().get(key).and_then(|v| v.as_i64()).unwrap_or(default)
}

/// Passes every input stream through to the output stream of the same index.
pub struct PassThroughCalculator;

impl Calculator for PassThroughCalculator {
    fn open(&mut self, cc: &mut CalculatorContext) -> GraphResult {
        cc.set_offset(0)
    }

    fn process(&mut self, cc: &mut CalculatorContext) -> GraphResult<Continuation> {
        for i in 0..cc.inputs().len() {
            let packet = cc.input(i).clone();
            if !packet.is_empty() {
                cc.output(i).add_packet(packet)?;
            }
        }
        Ok(Continuation::Continue)
    }
}

/// Doubles its integer input.
pub struct DoublerCalculator;

impl Calculator for DoublerCalculator {
    fn contract(&self, contract: &mut Contract) -> GraphResult {
        contract.set_input_type::<i32>(0)?;
        contract.set_output_type::<i32>(0)
    }

    fn open(&mut self, cc: &mut CalculatorContext) -> GraphResult {
        cc.set_offset(0)
    }

    fn process(&mut self, cc: &mut CalculatorContext) -> GraphResult<Continuation> {
        let v = *cc.input(0).get::<i32>()?;
        let ts = cc.input_timestamp();
        cc.output(0).add(v * 2, ts)?;
        Ok(Continuation::Continue)
    }
}

/// Squares its integer input.
pub struct SquareCalculator;

impl Calculator for SquareCalculator {
    fn contract(&self, contract: &mut Contract) -> GraphResult {
        contract.set_input_type::<i32>(0)?;
        contract.set_output_type::<i32>(0)
    }

    fn open(&mut self, cc: &mut CalculatorContext) -> GraphResult {
        cc.set_offset(0)
    }

    fn process(&mut self, cc: &mut CalculatorContext) -> GraphResult<Continuation> {
        let v = *cc.input(0).get::<i32>()?;
        let ts = cc.input_timestamp();
        cc.output(0).add(v * v, ts)?;
        Ok(Continuation::Continue)
    }
}

/// Sums the integer packets of all its inputs, treating empty slots as zero.
pub struct IntAdderCalculator;

impl Calculator for IntAdderCalculator {
    fn open(&mut self, cc: &mut CalculatorContext) -> GraphResult {
        cc.set_offset(0)
    }

    fn process(&mut self, cc: &mut CalculatorContext) -> GraphResult<Continuation> {
        let mut sum = 0i32;
        for i in 0..cc.inputs().len() {
            if !cc.input(i).is_empty() {
                sum += *cc.input(i).get::<i32>()?;
            }
        }
        let ts = cc.input_timestamp();
        cc.output(0).add(sum, ts)?;
        Ok(Continuation::Continue)
    }
}

/// Emits 0 at timestamp 0 during `open`, then forwards each input packet
/// delayed by one time unit.
pub struct UnitDelayCalculator;

impl Calculator for UnitDelayCalculator {
    fn open(&mut self, cc: &mut CalculatorContext) -> GraphResult {
        cc.output(0).add(0i32, Timestamp::new(0))
    }

    fn process(&mut self, cc: &mut CalculatorContext) -> GraphResult<Continuation> {
        let packet = cc.input(0).clone();
        let delayed = packet.timestamp().next_allowed_in_stream()?;
        cc.output(0).add_packet(packet.at(delayed))?;
        Ok(Continuation::Continue)
    }
}

/// Untimed variant: emits the initial 0 at the smallest stream timestamp and
/// forwards packets unchanged. Meant for barrier-scheduled graphs.
pub struct UnitDelayUntimedCalculator;

impl Calculator for UnitDelayUntimedCalculator {
    fn open(&mut self, cc: &mut CalculatorContext) -> GraphResult {
        cc.output(0).add(0i32, Timestamp::MIN)
    }

    fn process(&mut self, cc: &mut CalculatorContext) -> GraphResult<Continuation> {
        let packet = cc.input(0).clone();
        cc.output(0).add_packet(packet)?;
        Ok(Continuation::Continue)
    }
}

/// Source emitting the integers of its `"values"` option at timestamps
/// 0, 1, 2, …, one per `process`, then stopping.
#[derive(Default)]
pub struct CountingSourceCalculator {
    index: usize,
}

impl Calculator for CountingSourceCalculator {
    fn process(&mut self, cc: &mut CalculatorContext) -> GraphResult<Continuation> {
        let values = cc
            .options()
            .get("values")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let value = values[self.index].as_i64().unwrap() as i32;
        cc.output(0).add(value, Timestamp::new(self.index as i64))?;
        self.index += 1;
        if self.index >= values.len() {
            Ok(Continuation::Stop)
        } else {
            Ok(Continuation::Continue)
        }
    }
}

/// Source that emits all of its packets in a single `process` call and
/// stops. The burst deliberately overfills downstream queues.
pub struct OutputAllSourceCalculator;

impl Calculator for OutputAllSourceCalculator {
    fn process(&mut self, cc: &mut CalculatorContext) -> GraphResult<Continuation> {
        let count = options_i64(cc, "count", 100);
        for i in 0..count {
            cc.output(0).add(0i32, Timestamp::new(i))?;
        }
        Ok(Continuation::Stop)
    }
}

/// Source that emits one packet per `process` call, `"count"` times.
#[derive(Default)]
pub struct OutputOneAtATimeSourceCalculator {
    index: i64,
}

impl Calculator for OutputOneAtATimeSourceCalculator {
    fn process(&mut self, cc: &mut CalculatorContext) -> GraphResult<Continuation> {
        if self.index < options_i64(cc, "count", 1000) {
            cc.output(0).add(0i32, Timestamp::new(self.index))?;
            self.index += 1;
            Ok(Continuation::Continue)
        } else {
            Ok(Continuation::Stop)
        }
    }
}

/// Source reading an `Arc<AtomicI32>` side packet named `counter` and
/// emitting the shared count, `"count"` times, at timestamps 0, 1, 2, …
#[derive(Default)]
pub struct GlobalCountSourceCalculator {
    local_count: i64,
}

impl Calculator for GlobalCountSourceCalculator {
    fn process(&mut self, cc: &mut CalculatorContext) -> GraphResult<Continuation> {
        let counter = cc
            .side_packet("counter")
            .expect("counter side packet")
            .get::<Arc<AtomicI32>>()?
            .clone();
        let count = counter.fetch_add(1, Ordering::Relaxed);
        cc.output(0).add(count, Timestamp::new(self.local_count))?;
        self.local_count += 1;
        if self.local_count >= options_i64(cc, "count", 5) {
            Ok(Continuation::Stop)
        } else {
            Ok(Continuation::Continue)
        }
    }
}

/// Passes through one of every `"ratio"` input packets and silently drops
/// the rest. Deliberately declares no offset, so downstream nodes stall on
/// its timestamp bound between the surviving packets.
#[derive(Default)]
pub struct DecimatorCalculator {
    index: i64,
}

impl Calculator for DecimatorCalculator {
    fn process(&mut self, cc: &mut CalculatorContext) -> GraphResult<Continuation> {
        if self.index % options_i64(cc, "ratio", 101) == 0 {
            let packet = cc.input(0).clone();
            cc.output(0).add_packet(packet)?;
        }
        self.index += 1;
        Ok(Continuation::Continue)
    }
}

/// Merges all inputs into a readable line, with `empty` for absent slots.
pub struct MergeCalculator;

impl Calculator for MergeCalculator {
    fn open(&mut self, cc: &mut CalculatorContext) -> GraphResult {
        cc.set_offset(0)
    }

    fn process(&mut self, cc: &mut CalculatorContext) -> GraphResult<Continuation> {
        let mut parts = Vec::new();
        for i in 0..cc.inputs().len() {
            if cc.input(i).is_empty() {
                parts.push("empty".to_string());
            } else {
                parts.push(cc.input(i).get::<i32>()?.to_string());
            }
        }
        let ts = cc.input_timestamp();
        cc.output(0).add(parts.join(","), ts)?;
        Ok(Continuation::Continue)
    }
}

/// Routes the `input(0)` packet to the output selected by the integer on
/// `input(1)`, and advances the bound of the unselected outputs.
pub struct DemuxCalculator;

impl Calculator for DemuxCalculator {
    fn open(&mut self, cc: &mut CalculatorContext) -> GraphResult {
        cc.set_offset(0)
    }

    fn process(&mut self, cc: &mut CalculatorContext) -> GraphResult<Continuation> {
        let select = *cc.input(1).get::<i32>()? as usize;
        let packet = cc.input(0).clone();
        let next = cc.input_timestamp().next_allowed_in_stream()?;
        for i in 0..cc.num_outputs() {
            if i == select {
                cc.output(i).add_packet(packet.clone())?;
            } else {
                cc.output(i).set_next_timestamp_bound(next)?;
            }
        }
        Ok(Continuation::Continue)
    }
}

/// Forwards the data input selected by the integer on `input(0)`; the data
/// inputs start at `input(1)`.
pub struct MuxCalculator;

impl Calculator for MuxCalculator {
    fn open(&mut self, cc: &mut CalculatorContext) -> GraphResult {
        cc.set_offset(0)
    }

    fn process(&mut self, cc: &mut CalculatorContext) -> GraphResult<Continuation> {
        let select = *cc.input(0).get::<i32>()? as usize;
        let packet = cc.input(1 + select).clone();
        cc.output(0).add_packet(packet)?;
        Ok(Continuation::Continue)
    }
}

/// Passes packets through and asks the graph to stop all packet sources
/// after `"limit"` packets.
#[derive(Default)]
pub struct StopAfterCalculator {
    seen: i64,
}

impl Calculator for StopAfterCalculator {
    fn process(&mut self, cc: &mut CalculatorContext) -> GraphResult<Continuation> {
        let packet = cc.input(0).clone();
        cc.output(0).add_packet(packet)?;
        self.seen += 1;
        if self.seen >= options_i64(cc, "limit", 3) {
            Ok(Continuation::Stop)
        } else {
            Ok(Continuation::Continue)
        }
    }
}

/// Fails in `open` when the `fail` option is set; passes through otherwise.
/// Logs its lifecycle into the optional `lifecycle_log` side packet.
pub struct ErrorOnOpenCalculator;

impl ErrorOnOpenCalculator {
    fn log(cc: &CalculatorContext, event: &str) {
        if let Some(packet) = cc.side_packet("lifecycle_log") {
            let collector = packet.get::<Collector<String>>().expect("collector type");
            collector.push(format!("{}:{event}", cc.node_name()));
        }
    }
}

impl Calculator for ErrorOnOpenCalculator {
    fn open(&mut self, cc: &mut CalculatorContext) -> GraphResult {
        Self::log(cc, "open");
        if cc.options().get("fail").and_then(|v| v.as_bool()) == Some(true) {
            return Err(GraphError::NotFound("expected error".into()));
        }
        Ok(())
    }

    fn process(&mut self, cc: &mut CalculatorContext) -> GraphResult<Continuation> {
        let packet = cc.input(0).clone();
        cc.output(0).add_packet(packet)?;
        Ok(Continuation::Continue)
    }

    fn close(&mut self, cc: &mut CalculatorContext) -> GraphResult {
        Self::log(cc, "close");
        Ok(())
    }
}

/// Forwards the data input selected by the integer on the *last* input,
/// the layout expected by `MuxInputStreamHandler`.
pub struct MuxByHandlerCalculator;

impl Calculator for MuxByHandlerCalculator {
    fn process(&mut self, cc: &mut CalculatorContext) -> GraphResult<Continuation> {
        let control = cc.inputs().len() - 1;
        let select = *cc.input(control).get::<i32>()? as usize;
        let packet = cc.input(select).clone();
        cc.output(0).add_packet(packet)?;
        Ok(Continuation::Continue)
    }
}

/// Calls `set_offset` from `process`, which the framework must reject.
pub struct SetOffsetInProcessCalculator;

impl Calculator for SetOffsetInProcessCalculator {
    fn process(&mut self, cc: &mut CalculatorContext) -> GraphResult<Continuation> {
        cc.set_offset(0)?;
        Ok(Continuation::Continue)
    }
}

/// Fails on its first `process` invocation.
pub struct ErrorInProcessCalculator;

impl Calculator for ErrorInProcessCalculator {
    fn process(&mut self, _cc: &mut CalculatorContext) -> GraphResult<Continuation> {
        Err(GraphError::Internal("process failed on purpose".into()))
    }
}

/// Records every lifecycle call into the `Collector<String>` provided as
/// the `lifecycle_log` side packet, and passes packets through.
pub struct LifecycleTrackCalculator;

impl LifecycleTrackCalculator {
    fn log(cc: &CalculatorContext, event: &str) {
        let collector = cc
            .side_packet("lifecycle_log")
            .expect("lifecycle_log side packet")
            .get::<Collector<String>>()
            .expect("collector type")
            .clone();
        collector.push(format!("{}:{event}", cc.node_name()));
    }
}

impl Calculator for LifecycleTrackCalculator {
    fn open(&mut self, cc: &mut CalculatorContext) -> GraphResult {
        Self::log(cc, "open");
        cc.set_offset(0)
    }

    fn process(&mut self, cc: &mut CalculatorContext) -> GraphResult<Continuation> {
        Self::log(cc, "process");
        for i in 0..cc.inputs().len() {
            let packet = cc.input(i).clone();
            if !packet.is_empty() {
                cc.output(i).add_packet(packet)?;
            }
        }
        Ok(Continuation::Continue)
    }

    fn close(&mut self, cc: &mut CalculatorContext) -> GraphResult {
        Self::log(cc, "close");
        Ok(())
    }
}

/// Counts its input packets and publishes the total as the
/// `total_count` output side packet when it closes.
#[derive(Default)]
pub struct CountToSidePacketCalculator {
    count: i64,
}

impl Calculator for CountToSidePacketCalculator {
    fn process(&mut self, _cc: &mut CalculatorContext) -> GraphResult<Continuation> {
        self.count += 1;
        Ok(Continuation::Continue)
    }

    fn close(&mut self, cc: &mut CalculatorContext) -> GraphResult {
        cc.set_output_side_packet("total_count", Packet::new(self.count))
    }
}

fn register_calculators() {
    register_calculator("PassThroughCalculator", || Box::new(PassThroughCalculator));
    register_calculator("DoublerCalculator", || Box::new(DoublerCalculator));
    register_calculator("SquareCalculator", || Box::new(SquareCalculator));
    register_calculator("IntAdderCalculator", || Box::new(IntAdderCalculator));
    register_calculator("UnitDelayCalculator", || Box::new(UnitDelayCalculator));
    register_calculator("UnitDelayUntimedCalculator", || {
        Box::new(UnitDelayUntimedCalculator)
    });
    register_calculator("CountingSourceCalculator", || {
        Box::new(CountingSourceCalculator::default())
    });
    register_calculator("OutputAllSourceCalculator", || {
        Box::new(OutputAllSourceCalculator)
    });
    register_calculator("OutputOneAtATimeSourceCalculator", || {
        Box::new(OutputOneAtATimeSourceCalculator::default())
    });
    register_calculator("GlobalCountSourceCalculator", || {
        Box::new(GlobalCountSourceCalculator::default())
    });
    register_calculator("DecimatorCalculator", || {
        Box::new(DecimatorCalculator::default())
    });
    register_calculator("MergeCalculator", || Box::new(MergeCalculator));
    register_calculator("DemuxCalculator", || Box::new(DemuxCalculator));
    register_calculator("MuxCalculator", || Box::new(MuxCalculator));
    register_calculator("StopAfterCalculator", || {
        Box::new(StopAfterCalculator::default())
    });
    register_calculator("ErrorOnOpenCalculator", || Box::new(ErrorOnOpenCalculator));
    register_calculator("MuxByHandlerCalculator", || Box::new(MuxByHandlerCalculator));
    register_calculator("ErrorInProcessCalculator", || {
        Box::new(ErrorInProcessCalculator)
    });
    register_calculator("SetOffsetInProcessCalculator", || {
        Box::new(SetOffsetInProcessCalculator)
    });
    register_calculator("LifecycleTrackCalculator", || {
        Box::new(LifecycleTrackCalculator)
    });
    register_calculator("CountToSidePacketCalculator", || {
        Box::new(CountToSidePacketCalculator::default())
    });
}
