//! The per-executor priority queue of runnable node tasks.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::calculator::{CalculatorContext, Continuation};
use crate::executor::{Executor, TaskQueue};
use crate::graph::GraphCore;
use crate::timestamp::Timestamp;

/// One entry of the queue: an `open` task or a `process` task with its
/// prepared context.
pub(crate) struct Item {
    node_id: usize,
    is_open_task: bool,
    is_source: bool,
    layer: i32,
    source_process_order: i64,
    context: Option<Box<CalculatorContext>>,
}

impl Item {
    pub fn process(
        node_id: usize,
        is_source: bool,
        layer: i32,
        source_process_order: i64,
        context: Box<CalculatorContext>,
    ) -> Item {
        Item {
            node_id,
            is_open_task: false,
            is_source,
            layer,
            source_process_order,
            context: Some(context),
        }
    }

    pub fn open(node_id: usize, is_source: bool, layer: i32) -> Item {
        Item {
            node_id,
            is_open_task: true,
            is_source,
            layer,
            source_process_order: Timestamp::UNSTARTED.value(),
            context: None,
        }
    }

    pub fn node_id(&self) -> usize {
        self.node_id
    }

    pub fn into_context(self) -> Option<Box<CalculatorContext>> {
        self.context
    }
}

/// Priority ordering, `Greater` meaning "runs first":
/// open tasks precede process tasks (lower node ids first among them);
/// non-source process tasks precede sources and favor higher node ids, so
/// the graph drains toward the leaves before new data is injected; sources
/// order by layer, then declared process order, then node id.
impl Ord for Item {
    fn cmp(&self, other: &Item) -> Ordering {
        if self.is_open_task || other.is_open_task {
            return match (self.is_open_task, other.is_open_task) {
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                _ => self.node_id.cmp(&other.node_id).reverse(),
            };
        }
        match (self.is_source, other.is_source) {
            (false, true) => Ordering::Greater,
            (true, false) => Ordering::Less,
            (false, false) => self.node_id.cmp(&other.node_id),
            (true, true) => self
                .layer
                .cmp(&other.layer)
                .reverse()
                .then(self.source_process_order.cmp(&other.source_process_order).reverse())
                .then(self.node_id.cmp(&other.node_id).reverse()),
        }
    }
}

impl PartialOrd for Item {
    fn partial_cmp(&self, other: &Item) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Item {
    fn eq(&self, other: &Item) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Item {}

struct QueueState {
    queue: BinaryHeap<Item>,
    /// Tasks handed to the executor and not yet finished.
    num_pending_tasks: usize,
    /// Tasks queued but not yet handed to the executor.
    num_tasks_to_add: usize,
    /// Net `set_running(true)` calls; tasks are only submitted while > 0.
    running_count: i32,
}

/// A priority queue of runnable node tasks bound to one executor.
///
/// Idle transitions are reported to the scheduler: exactly one
/// `queue_idle_state_changed(false)` when the queue becomes active and one
/// `queue_idle_state_changed(true)` once it has fully drained. The "became
/// active" report always precedes the matching "became idle" one because it
/// is issued before the task reaches the executor.
pub(crate) struct SchedulerQueue {
    index: usize,
    executor: OnceCell<Arc<dyn Executor>>,
    state: Mutex<QueueState>,
}

/// The handle handed to executors; `run_next_task` routes back into the
/// queue with the graph context attached.
struct QueueTask {
    graph: Arc<GraphCore>,
    queue_index: usize,
}

impl TaskQueue for QueueTask {
    fn run_next_task(&self) {
        self.graph
            .scheduler()
            .queue(self.queue_index)
            .run_next_task(&self.graph);
    }
}

impl SchedulerQueue {
    pub fn new(index: usize) -> SchedulerQueue {
        SchedulerQueue {
            index,
            executor: OnceCell::new(),
            state: Mutex::new(QueueState {
                queue: BinaryHeap::new(),
                num_pending_tasks: 0,
                num_tasks_to_add: 0,
                running_count: 0,
            }),
        }
    }

    pub fn set_executor(&self, executor: Arc<dyn Executor>) {
        if self.executor.set(executor).is_err() {
            panic!("the executor of a scheduler queue can only be set once");
        }
    }

    fn executor(&self) -> &Arc<dyn Executor> {
        self.executor.get().expect("scheduler queue has no executor")
    }

    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.num_pending_tasks = 0;
        state.num_tasks_to_add = 0;
        state.running_count = 0;
    }

    fn is_idle(state: &QueueState) -> bool {
        state.queue.is_empty() && state.num_pending_tasks == 0
    }

    pub fn set_running(&self, running: bool) {
        let mut state = self.state.lock();
        state.running_count += if running { 1 } else { -1 };
        debug_assert!(state.running_count <= 1);
    }

    /// Moves queued tasks into the pending count; the caller must submit
    /// exactly the returned number of tasks to the executor.
    fn take_tasks_to_submit(state: &mut QueueState) -> usize {
        let tasks = state.num_tasks_to_add;
        state.num_tasks_to_add = 0;
        state.num_pending_tasks += tasks;
        tasks
    }

    /// Submits tasks accumulated while the queue was not running.
    pub fn submit_waiting_tasks(&self, graph: &Arc<GraphCore>) {
        let tasks = {
            let mut state = self.state.lock();
            if state.running_count > 0 {
                Self::take_tasks_to_submit(&mut state)
            } else {
                0
            }
        };
        self.submit(graph, tasks);
    }

    fn submit(&self, graph: &Arc<GraphCore>, tasks: usize) {
        for _ in 0..tasks {
            let task = Arc::new(QueueTask {
                graph: graph.clone(),
                queue_index: self.index,
            });
            self.executor().add_task(task);
        }
    }

    /// Adds a source node task, claiming the node first. A claim failure
    /// means the node is closed or already running; in the latter case the
    /// node is rescheduled when the running invocation ends, so the call is
    /// not lost.
    pub fn add_source_node(&self, graph: &Arc<GraphCore>, node_id: usize) {
        if graph.scheduler().shared().has_error() {
            return;
        }
        let node = graph.node(node_id);
        if !node.try_to_begin_scheduling() {
            debug_assert!(node.is_source());
            return;
        }
        let item = Item::process(
            node_id,
            true,
            node.source_layer(),
            node.source_process_order(),
            graph.make_source_context(node_id),
        );
        self.add_item(graph, item);
    }

    /// Adds a process task whose claim and context were already prepared.
    pub fn add_prepared(&self, graph: &Arc<GraphCore>, item: Item) {
        if graph.scheduler().shared().has_error() {
            // The run is being torn down; release the claim so that close
            // can proceed.
            graph.node(item.node_id()).end_scheduling();
            return;
        }
        self.add_item(graph, item);
    }

    pub fn add_node_for_open(&self, graph: &Arc<GraphCore>, node_id: usize) {
        if graph.scheduler().shared().has_error() {
            return;
        }
        let node = graph.node(node_id);
        self.add_item(
            graph,
            Item::open(node_id, node.is_source(), node.source_layer()),
        );
    }

    pub fn add_item(&self, graph: &Arc<GraphCore>, item: Item) {
        let node_id = item.node_id();
        let (was_idle, tasks) = {
            let mut state = self.state.lock();
            let was_idle = Self::is_idle(&state);
            state.queue.push(item);
            state.num_tasks_to_add += 1;
            trace!("node {node_id} queued on scheduler queue {}", self.index);
            let tasks = if state.running_count > 0 {
                Self::take_tasks_to_submit(&mut state)
            } else {
                0
            };
            (was_idle, tasks)
        };
        if was_idle {
            graph.scheduler().queue_idle_state_changed(graph, false);
        }
        // Submitting after the idle report keeps the active/idle pairing.
        self.submit(graph, tasks);
    }

    /// Pops and runs the highest priority task. Invoked by the executor.
    pub fn run_next_task(&self, graph: &Arc<GraphCore>) {
        let item = {
            let mut state = self.state.lock();
            state
                .queue
                .pop()
                .expect("run_next_task called with an empty queue")
        };
        let node_id = item.node_id();
        let is_open = item.is_open_task;

        if is_open {
            self.open_calculator_node(graph, node_id);
        } else {
            let context = item.into_context().expect("process item without context");
            self.run_calculator_node(graph, node_id, context);
        }

        let became_idle = {
            let mut state = self.state.lock();
            debug_assert!(state.num_pending_tasks > 0);
            state.num_pending_tasks -= 1;
            Self::is_idle(&state)
        };
        if became_idle {
            graph.scheduler().queue_idle_state_changed(graph, true);
        }
    }

    fn open_calculator_node(&self, graph: &Arc<GraphCore>, node_id: usize) {
        trace!("opening node {node_id}");
        let shared = graph.scheduler().shared();
        let start = shared.timer.start_node();
        let result = graph.open_node_task(node_id);
        shared.timer.end_node(start);
        match result {
            Ok(()) => graph.node_opened(node_id),
            Err(e) => {
                debug!("node {node_id} failed to open: {e}");
                graph.record_error(e);
            }
        }
    }

    fn run_calculator_node(
        &self,
        graph: &Arc<GraphCore>,
        node_id: usize,
        context: Box<CalculatorContext>,
    ) {
        let shared = graph.scheduler().shared();
        let node = graph.node(node_id);

        // When the graph is winding down, a scheduled source is closed
        // instead of being run.
        if shared.is_stopping() && node.is_source() {
            trace!("closing source node {node_id} while stopping");
            let start = shared.timer.start_node();
            graph.close_node(node_id, Ok(()), false);
            shared.timer.end_node(start);
            node.end_scheduling();
            graph.schedule_if_ready(node_id);
            return;
        }

        let start = shared.timer.start_node();
        let result = graph.process_node_task(node_id, context);
        shared.timer.end_node(start);

        match result {
            Ok(Continuation::Continue) => {}
            Ok(Continuation::Stop) => {
                if node.is_source() {
                    graph.close_node(node_id, Ok(()), false);
                } else {
                    // A non-source asking to stop shuts every source down at
                    // the next scheduling opportunity.
                    shared.set_stopping();
                }
            }
            Err(e) => {
                debug!("node {node_id} returned an error: {e}");
                graph.record_error(e);
            }
        }

        node.end_scheduling();
        graph.schedule_if_ready(node_id);
    }

    /// Drops whatever is still queued at the end of a run.
    pub fn cleanup_after_run(&self, graph: &Arc<GraphCore>) {
        let was_idle = {
            let mut state = self.state.lock();
            let was_idle = Self::is_idle(&state);
            debug_assert_eq!(state.num_pending_tasks, 0);
            state.num_tasks_to_add = 0;
            state.queue.clear();
            was_idle
        };
        if !was_idle {
            graph.scheduler().queue_idle_state_changed(graph, true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> Box<CalculatorContext> {
        use crate::calculator::{InputSet, LifecyclePhase};
        Box::new(CalculatorContext {
            node_id: 0,
            node_name: "test".into(),
            options: Arc::new(serde_json::Value::Null),
            side_packet_names: Arc::new(Vec::new()),
            side_packets: Arc::new(Vec::new()),
            output_side_names: Arc::new(Vec::new()),
            input_headers: Vec::new(),
            inputs: InputSet::empty(0),
            outputs: Vec::new(),
            input_timestamp: Timestamp::UNSET,
            phase: LifecyclePhase::Process,
            offset: None,
            staged_side_outputs: Vec::new(),
            final_status: Ok(()),
        })
    }

    #[test]
    fn open_tasks_run_before_process_tasks() {
        let mut heap = BinaryHeap::new();
        heap.push(Item::process(0, false, 0, 0, ctx()));
        heap.push(Item::open(5, false, 0));
        heap.push(Item::open(2, false, 0));
        assert!(heap.pop().unwrap().is_open_task);
        let second = heap.pop().unwrap();
        assert!(second.is_open_task);
        // Lower node ids open first.
        assert_eq!(heap.pop().unwrap().node_id(), 0);
    }

    #[test]
    fn non_sources_run_before_sources_and_toward_leaves() {
        let mut heap = BinaryHeap::new();
        heap.push(Item::process(1, true, 0, 0, ctx()));
        heap.push(Item::process(3, false, 0, 0, ctx()));
        heap.push(Item::process(7, false, 0, 0, ctx()));
        // Non-sources first, higher id first.
        assert_eq!(heap.pop().unwrap().node_id(), 7);
        assert_eq!(heap.pop().unwrap().node_id(), 3);
        assert_eq!(heap.pop().unwrap().node_id(), 1);
    }

    #[test]
    fn sources_order_by_layer_then_process_order_then_id() {
        let mut heap = BinaryHeap::new();
        heap.push(Item::process(4, true, 1, 0, ctx()));
        heap.push(Item::process(5, true, 0, 7, ctx()));
        heap.push(Item::process(6, true, 0, 3, ctx()));
        heap.push(Item::process(2, true, 0, 3, ctx()));
        assert_eq!(heap.pop().unwrap().node_id(), 2);
        assert_eq!(heap.pop().unwrap().node_id(), 6);
        assert_eq!(heap.pop().unwrap().node_id(), 5);
        assert_eq!(heap.pop().unwrap().node_id(), 4);
    }
}
