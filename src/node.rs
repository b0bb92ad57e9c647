//! The per-node state machine wrapping a calculator instance.
//!
//! A node moves through `Unprepared → Prepared → Opened → Closed`; while
//! `Opened`, invocations run one at a time (the `in_flight` flag). The
//! surrounding graph owns the stream arenas and builds the contexts; this
//! module only guards the state transitions and runs the lifecycle
//! callbacks.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::calculator::{Calculator, CalculatorContext, Continuation, LifecyclePhase};
use crate::error::{GraphError, GraphResult};
use crate::packet::Packet;
use crate::registry::CalculatorFactory;
use crate::stream::handler::InputStreamHandler;
use crate::timestamp::Timestamp;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum NodeStage {
    Unprepared,
    Prepared,
    Opened,
    Closed,
}

struct NodeRunState {
    stage: NodeStage,
    /// An invocation (open, process or close) is currently scheduled or
    /// running.
    in_flight: bool,
    /// For sources: the scheduler activated this node's layer.
    activated: bool,
    /// `open` returned an error; `close` must be skipped.
    open_error: bool,
    last_process_timestamp: Timestamp,
    offset: Option<i64>,
    side_packets: Arc<Vec<Packet>>,
    source_process_order: i64,
}

/// A calculator plus everything the scheduler needs to drive it.
pub(crate) struct CalculatorNode {
    id: usize,
    name: Arc<str>,
    factory: CalculatorFactory,
    calculator: Mutex<Option<Box<dyn Calculator>>>,
    options: Arc<serde_json::Value>,
    is_source: bool,
    source_layer: i32,
    /// Scheduler queue this node is bound to.
    queue_index: usize,
    /// Input stream manager indices, aligned with the config inputs.
    input_stream_ids: Vec<usize>,
    /// Output stream manager indices, aligned with the config outputs.
    output_stream_ids: Vec<usize>,
    handler: Box<dyn InputStreamHandler>,
    input_side_names: Arc<Vec<String>>,
    output_side_names: Arc<Vec<String>>,
    state: Mutex<NodeRunState>,
}

impl CalculatorNode {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        name: &str,
        factory: CalculatorFactory,
        options: serde_json::Value,
        source_layer: i32,
        queue_index: usize,
        input_stream_ids: Vec<usize>,
        output_stream_ids: Vec<usize>,
        handler: Box<dyn InputStreamHandler>,
        input_side_names: Vec<String>,
        output_side_names: Vec<String>,
    ) -> CalculatorNode {
        CalculatorNode {
            id,
            name: name.into(),
            factory,
            calculator: Mutex::new(None),
            options: Arc::new(options),
            is_source: input_stream_ids.is_empty(),
            source_layer,
            queue_index,
            input_stream_ids,
            output_stream_ids,
            handler,
            input_side_names: Arc::new(input_side_names),
            output_side_names: Arc::new(output_side_names),
            state: Mutex::new(NodeRunState {
                stage: NodeStage::Unprepared,
                in_flight: false,
                activated: false,
                open_error: false,
                last_process_timestamp: Timestamp::UNSTARTED,
                offset: None,
                side_packets: Arc::new(Vec::new()),
                source_process_order: 0,
            }),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    pub fn is_source(&self) -> bool {
        self.is_source
    }

    pub fn source_layer(&self) -> i32 {
        self.source_layer
    }

    pub fn queue_index(&self) -> usize {
        self.queue_index
    }

    pub fn input_stream_ids(&self) -> &[usize] {
        &self.input_stream_ids
    }

    pub fn output_stream_ids(&self) -> &[usize] {
        &self.output_stream_ids
    }

    pub fn handler(&self) -> &dyn InputStreamHandler {
        &*self.handler
    }

    pub fn options(&self) -> Arc<serde_json::Value> {
        self.options.clone()
    }

    pub fn input_side_names(&self) -> Arc<Vec<String>> {
        self.input_side_names.clone()
    }

    pub fn output_side_names(&self) -> Arc<Vec<String>> {
        self.output_side_names.clone()
    }

    pub fn side_packets(&self) -> Arc<Vec<Packet>> {
        self.state.lock().side_packets.clone()
    }

    pub fn source_process_order(&self) -> i64 {
        self.state.lock().source_process_order
    }

    pub fn offset(&self) -> Option<i64> {
        self.state.lock().offset
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().stage == NodeStage::Closed
    }

    /// Instantiates a fresh calculator and resets the run state. The side
    /// packets are the node's declared inputs, already resolved by name.
    pub fn prepare_for_run(&self, side_packets: Vec<Packet>) -> GraphResult {
        let calculator = (self.factory)();
        let source_process_order = calculator.source_process_order();
        *self.calculator.lock() = Some(calculator);
        self.handler.prepare_for_run();
        let mut state = self.state.lock();
        state.stage = NodeStage::Prepared;
        state.in_flight = false;
        state.activated = false;
        state.open_error = false;
        state.last_process_timestamp = Timestamp::UNSTARTED;
        state.offset = None;
        state.side_packets = Arc::new(side_packets);
        state.source_process_order = source_process_order;
        Ok(())
    }

    /// Marks a source node as belonging to the active layer.
    pub fn activate(&self) {
        self.state.lock().activated = true;
    }

    /// Claims the node for one invocation. Fails when the node is closed or
    /// an invocation is already in flight, which for sources simply means
    /// the node will be rescheduled after the current call.
    pub fn try_to_begin_scheduling(&self) -> bool {
        let mut state = self.state.lock();
        if state.stage != NodeStage::Opened || state.in_flight {
            return false;
        }
        if self.is_source && !state.activated {
            return false;
        }
        state.in_flight = true;
        true
    }

    /// Releases the claim taken by [`try_to_begin_scheduling`].
    ///
    /// [`try_to_begin_scheduling`]: CalculatorNode::try_to_begin_scheduling
    pub fn end_scheduling(&self) {
        self.state.lock().in_flight = false;
    }

    /// Verifies the handler contract that invocation timestamps strictly
    /// increase, and records `timestamp` as the latest one.
    pub fn check_process_timestamp(&self, timestamp: Timestamp) -> GraphResult {
        let mut state = self.state.lock();
        if self.handler.enforces_monotonicity() && timestamp <= state.last_process_timestamp {
            return Err(GraphError::Internal(format!(
                "timestamp mismatch on calculator '{}': {timestamp} does not increase over {}",
                self.name, state.last_process_timestamp
            )));
        }
        state.last_process_timestamp = state.last_process_timestamp.max(timestamp);
        Ok(())
    }

    /// Runs `open`. On success the declared offset is recorded and the node
    /// moves to `Opened`; on error it is closed without a `close` call.
    pub fn open_node(&self, cc: &mut CalculatorContext) -> GraphResult {
        debug_assert_eq!(cc.phase, LifecyclePhase::Open);
        let mut calculator = self.calculator.lock();
        let calculator = calculator.as_mut().expect("node not prepared");
        let result = calculator.open(cc);
        let mut state = self.state.lock();
        match &result {
            Ok(()) => {
                state.stage = NodeStage::Opened;
                state.offset = cc.offset;
            }
            Err(_) => {
                state.stage = NodeStage::Closed;
                state.open_error = true;
            }
        }
        result
    }

    /// Runs `process`. `Stop` is returned to the caller; error handling and
    /// propagation belong to the scheduler queue and the graph.
    pub fn process_node(&self, cc: &mut CalculatorContext) -> GraphResult<Continuation> {
        debug_assert_eq!(cc.phase, LifecyclePhase::Process);
        let mut calculator = self.calculator.lock();
        let calculator = calculator.as_mut().expect("node not prepared");
        calculator.process(cc)
    }

    /// Claims the close transition. Returns `None` if the node is already
    /// closed, otherwise whether the `close` callback should run and whether
    /// its result matters (a node that never opened is closed silently).
    pub fn begin_close(&self) -> Option<CloseMode> {
        let mut state = self.state.lock();
        if state.stage == NodeStage::Closed {
            return None;
        }
        let was_opened = state.stage == NodeStage::Opened;
        state.stage = NodeStage::Closed;
        Some(CloseMode {
            invoke_close: !state.open_error,
            report_result: was_opened,
        })
    }

    /// Runs `close` after a successful [`begin_close`].
    ///
    /// [`begin_close`]: CalculatorNode::begin_close
    pub fn close_node(&self, cc: &mut CalculatorContext) -> GraphResult {
        debug_assert_eq!(cc.phase, LifecyclePhase::Close);
        let mut calculator = self.calculator.lock();
        let calculator = calculator.as_mut().expect("node not prepared");
        calculator.close(cc)
    }
}

/// How a claimed close transition must be carried out.
#[derive(Clone, Copy, Debug)]
pub(crate) struct CloseMode {
    /// Run the `close` callback (skipped after an `open` error).
    pub invoke_close: bool,
    /// Whether a `close` error should be recorded (ignored for nodes that
    /// never opened).
    pub report_result: bool,
}
