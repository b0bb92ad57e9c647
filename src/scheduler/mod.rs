//! The global coordinator driving a graph run: idle detection, source
//! layering, throttling resolution, cancellation and termination.

use std::collections::{BTreeSet, BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::{GraphError, GraphResult};
use crate::executor::Task;
use crate::graph::GraphCore;

pub(crate) mod queue;
pub(crate) mod shared;

pub use shared::SchedulerTimes;

use queue::SchedulerQueue;
use shared::SchedulerShared;

/// Scheduler lifecycle states. Transitions:
///
/// ```text
///   NotStarted -> Running <-> Paused
///                    |          |
///                    |          v
///                    +----> Cancelling
///                    |          |
///                    v          v
///                   Terminated
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum SchedulerState {
    NotStarted = 0,
    Running = 1,
    Paused = 2,
    /// Queues keep running so that in-flight work can drain, but the
    /// scheduler can no longer be paused.
    Cancelling = 3,
    Terminated = 4,
}

impl SchedulerState {
    fn from_u8(value: u8) -> SchedulerState {
        match value {
            0 => SchedulerState::NotStarted,
            1 => SchedulerState::Running,
            2 => SchedulerState::Paused,
            3 => SchedulerState::Cancelling,
            _ => SchedulerState::Terminated,
        }
    }
}

/// A source waiting in the layer queue; min-ordered by (layer, declared
/// process order, id).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct SourceEntry {
    layer: i32,
    source_process_order: i64,
    node_id: usize,
}

impl Ord for SourceEntry {
    fn cmp(&self, other: &SourceEntry) -> std::cmp::Ordering {
        // BinaryHeap pops the greatest entry; reverse so the smallest layer
        // comes out first.
        (self.layer, self.source_process_order, self.node_id)
            .cmp(&(other.layer, other.source_process_order, other.node_id))
            .reverse()
    }
}

impl PartialOrd for SourceEntry {
    fn partial_cmp(&self, other: &SourceEntry) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct SchedulerInner {
    /// Sources that are yet to be activated, by layer.
    sources_queue: BinaryHeap<SourceEntry>,
    /// Sources whose `open` has not completed, ordered by (layer, id).
    unopened_sources: BTreeSet<(i32, usize)>,
    /// Sources of the currently active layer, not yet closed.
    active_sources: Vec<usize>,
    /// Queues that still have queued or running tasks.
    non_idle_queue_count: i32,
    /// Tasks to run on the application thread, drained by the wait calls.
    app_thread_tasks: VecDeque<Task>,
    /// Reentrancy guard for `handle_idle`.
    handling_idle: bool,
    graph_input_streams_closed: bool,
    throttled_graph_input_count: i32,
    /// Incremented on every graph input unthrottle, so concurrent waiters
    /// each observe their own event.
    unthrottle_seq_num: u64,
    observed_output_signal: bool,
    waiting_for_observed_output: bool,
}

/// The scheduler: owns the scheduler queues (one per executor) and decides
/// when to activate sources, when to unthrottle and when to terminate.
pub(crate) struct Scheduler {
    shared: SchedulerShared,
    /// Queue 0 is bound to the default executor.
    queues: Vec<SchedulerQueue>,
    queue_index_by_name: HashMap<String, usize>,
    state: AtomicU8,
    inner: Mutex<SchedulerInner>,
    cond: Condvar,
}

impl Scheduler {
    /// Creates the scheduler with the default queue plus one queue per
    /// named executor.
    pub fn new(executor_names: &[String]) -> Scheduler {
        let mut queues = vec![SchedulerQueue::new(0)];
        let mut queue_index_by_name = HashMap::new();
        for name in executor_names {
            queue_index_by_name.insert(name.clone(), queues.len());
            queues.push(SchedulerQueue::new(queues.len()));
        }
        Scheduler {
            shared: SchedulerShared::new(),
            queues,
            queue_index_by_name,
            state: AtomicU8::new(SchedulerState::NotStarted as u8),
            inner: Mutex::new(SchedulerInner {
                sources_queue: BinaryHeap::new(),
                unopened_sources: BTreeSet::new(),
                active_sources: Vec::new(),
                non_idle_queue_count: 0,
                app_thread_tasks: VecDeque::new(),
                handling_idle: false,
                graph_input_streams_closed: false,
                throttled_graph_input_count: 0,
                unthrottle_seq_num: 0,
                observed_output_signal: false,
                waiting_for_observed_output: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn shared(&self) -> &SchedulerShared {
        &self.shared
    }

    pub fn queue(&self, index: usize) -> &SchedulerQueue {
        &self.queues[index]
    }

    /// Resolves an executor name to the index of its queue.
    pub fn queue_index(&self, executor_name: &str) -> Option<usize> {
        if executor_name.is_empty() {
            Some(0)
        } else {
            self.queue_index_by_name.get(executor_name).copied()
        }
    }

    pub fn state(&self) -> SchedulerState {
        SchedulerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: SchedulerState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == SchedulerState::Terminated
    }

    /// Resets everything at the beginning of a run.
    pub fn reset(&self, graph_input_streams_closed: bool) {
        {
            let mut inner = self.inner.lock();
            self.set_state(SchedulerState::NotStarted);
            inner.sources_queue.clear();
            inner.unopened_sources.clear();
            inner.active_sources.clear();
            inner.non_idle_queue_count = 0;
            inner.app_thread_tasks.clear();
            inner.handling_idle = false;
            inner.graph_input_streams_closed = graph_input_streams_closed;
            inner.throttled_graph_input_count = 0;
            inner.unthrottle_seq_num = 0;
            inner.observed_output_signal = false;
            inner.waiting_for_observed_output = false;
        }
        for queue in &self.queues {
            queue.reset();
        }
        self.shared.stopping.store(false, Ordering::SeqCst);
        self.shared.set_has_error(false);
    }

    fn set_queues_running(&self, running: bool) {
        for queue in &self.queues {
            queue.set_running(running);
        }
    }

    fn submit_waiting_tasks_on_queues(&self, graph: &Arc<GraphCore>) {
        for queue in &self.queues {
            queue.submit_waiting_tasks(graph);
        }
    }

    /// Starts scheduling nodes. Returns once the queues are running; with an
    /// application-thread executor the actual work happens inside the wait
    /// calls.
    pub fn start(&self, graph: &Arc<GraphCore>) {
        debug!("starting scheduler");
        self.shared.timer.start_run();
        {
            let mut inner = self.inner.lock();
            assert_eq!(self.state(), SchedulerState::NotStarted);
            self.set_state(SchedulerState::Running);
            self.set_queues_running(true);
            // Get the ball rolling.
            self.handle_idle(graph, &mut inner);
        }
        self.submit_waiting_tasks_on_queues(graph);
    }

    fn is_idle(inner: &SchedulerInner) -> bool {
        inner.non_idle_queue_count == 0
    }

    /// Drops closed sources from the back of the active list.
    fn cleanup_active_sources(&self, graph: &Arc<GraphCore>, inner: &mut SchedulerInner) {
        while let Some(&last) = inner.active_sources.last() {
            if graph.node(last).is_closed() {
                inner.active_sources.pop();
            } else {
                break;
            }
        }
    }

    /// The idle loop: activates source layers, unthrottles to break
    /// deadlocks, or terminates.
    ///
    /// Entered and left with the inner mutex held; the mutex is temporarily
    /// released while unthrottling (which walks graph data) and while
    /// enqueueing a source layer (which touches the queues). Reentrant calls
    /// arising from nodes becoming runnable during those windows are
    /// filtered by the `handling_idle` flag; the original invocation runs
    /// the loop again and misses nothing.
    fn handle_idle(&self, graph: &Arc<GraphCore>, inner: &mut MutexGuard<'_, SchedulerInner>) {
        if inner.handling_idle {
            trace!("handle_idle: already in progress");
            return;
        }
        inner.handling_idle = true;

        while Self::is_idle(inner)
            && matches!(
                self.state(),
                SchedulerState::Running | SchedulerState::Cancelling
            )
        {
            self.cleanup_active_sources(graph, inner);

            // Quit on errors, or when no packet source remains.
            if self.shared.has_error()
                || (inner.active_sources.is_empty()
                    && inner.sources_queue.is_empty()
                    && inner.graph_input_streams_closed)
            {
                trace!("handle_idle: quitting");
                self.quit(inner);
                break;
            }

            // Activate the next source layer if the previous one is done.
            if inner.active_sources.is_empty() && !inner.sources_queue.is_empty() {
                trace!("handle_idle: activating sources");
                let did_activate = self.try_to_schedule_next_source_layer(graph, inner);
                debug_assert!(did_activate || inner.active_sources.is_empty());
                continue;
            }

            // If we are idle with live sources or throttled graph inputs,
            // they must all be blocked on full queues: unthrottle.
            if !inner.active_sources.is_empty() || inner.throttled_graph_input_count > 0 {
                trace!("handle_idle: unthrottling");
                let did_unthrottle =
                    MutexGuard::unlocked(inner, || graph.unthrottle_sources());
                if did_unthrottle {
                    continue;
                }
            }

            break;
        }

        inner.handling_idle = false;
    }

    /// Terminates the scheduler. Only called by `handle_idle`, with the
    /// inner mutex held.
    fn quit(&self, _inner: &mut MutexGuard<'_, SchedulerInner>) {
        debug_assert!(matches!(
            self.state(),
            SchedulerState::Running | SchedulerState::Cancelling
        ));
        self.set_queues_running(false);
        self.shared.timer.end_run();
        debug!("signaling scheduler termination");
        self.set_state(SchedulerState::Terminated);
        self.cond.notify_all();
    }

    /// Activates every source sharing the smallest waiting layer. Returns
    /// true if any source was activated.
    fn try_to_schedule_next_source_layer(
        &self,
        graph: &Arc<GraphCore>,
        inner: &mut MutexGuard<'_, SchedulerInner>,
    ) -> bool {
        debug_assert!(inner.active_sources.is_empty());
        debug_assert!(!inner.sources_queue.is_empty());

        let next_layer = inner.sources_queue.peek().unwrap().layer;
        if let Some(&(unopened_layer, _)) = inner.unopened_sources.iter().next() {
            if unopened_layer < next_layer {
                // A lower layer exists but none of its sources has opened:
                // with all graph inputs closed there is no packet source
                // left to make progress, and this is a deadlock.
                if inner.graph_input_streams_closed {
                    MutexGuard::unlocked(inner, || {
                        graph.record_error(GraphError::Internal(
                            "deadlock: source nodes cannot be activated while a source at a \
                             lower layer is still unopened"
                                .into(),
                        ));
                    });
                }
                return false;
            }
        }

        let mut to_schedule = Vec::new();
        while let Some(&entry) = inner.sources_queue.peek() {
            if entry.layer != next_layer {
                break;
            }
            inner.sources_queue.pop();
            inner.active_sources.push(entry.node_id);
            to_schedule.push(entry.node_id);
        }
        if to_schedule.is_empty() {
            return false;
        }

        debug!("activating source layer {next_layer}: {to_schedule:?}");
        MutexGuard::unlocked(inner, || {
            // Pause the queues while the whole layer is added, so that the
            // sources start in round-robin fashion rather than the first one
            // monopolizing a worker.
            self.set_queues_running(false);
            for &node_id in &to_schedule {
                graph.node(node_id).activate();
                self.schedule_node_if_not_throttled(graph, node_id);
            }
            self.set_queues_running(true);
            self.submit_waiting_tasks_on_queues(graph);
        });
        true
    }

    /// Schedules a source node unless it is currently throttled.
    pub fn schedule_node_if_not_throttled(&self, graph: &Arc<GraphCore>, node_id: usize) {
        if !graph.is_node_throttled(node_id) {
            let queue_index = graph.node(node_id).queue_index();
            self.queues[queue_index].add_source_node(graph, node_id);
        }
    }

    /// Schedules an `open` task for a node.
    pub fn schedule_node_for_open(&self, graph: &Arc<GraphCore>, node_id: usize) {
        trace!("scheduling open of node {node_id}");
        let queue_index = graph.node(node_id).queue_index();
        self.queues[queue_index].add_node_for_open(graph, node_id);
    }

    /// Re-schedules sources whose throttling just cleared.
    pub fn schedule_unthrottled_ready_nodes(&self, graph: &Arc<GraphCore>, node_ids: &[usize]) {
        for &node_id in node_ids {
            debug_assert!(graph.node(node_id).is_source());
            let queue_index = graph.node(node_id).queue_index();
            self.queues[queue_index].add_source_node(graph, node_id);
        }
    }

    /// Registers a source before the scheduler starts; it stays here until
    /// its `open` completes.
    pub fn add_unopened_source_node(&self, node_id: usize, layer: i32) {
        debug_assert_eq!(self.state(), SchedulerState::NotStarted);
        self.inner.lock().unopened_sources.insert((layer, node_id));
    }

    /// Moves a freshly opened source into the layer queue.
    pub fn add_node_to_sources_queue(&self, graph: &Arc<GraphCore>, node_id: usize) {
        let node = graph.node(node_id);
        let entry = SourceEntry {
            layer: node.source_layer(),
            source_process_order: node.source_process_order(),
            node_id,
        };
        let mut inner = self.inner.lock();
        inner.sources_queue.push(entry);
        inner.unopened_sources.remove(&(entry.layer, node_id));
    }

    /// Reported by a queue when it transitions between active and idle.
    pub fn queue_idle_state_changed(&self, graph: &Arc<GraphCore>, idle: bool) {
        let mut inner = self.inner.lock();
        inner.non_idle_queue_count += if idle { -1 } else { 1 };
        trace!("non-idle queues: {}", inner.non_idle_queue_count);
        if inner.non_idle_queue_count == 0 {
            self.cond.notify_all();
            // We are the last active queue; decide whether to activate
            // sources, unthrottle or quit, without dropping the lock in
            // between.
            self.handle_idle(graph, &mut inner);
        }
    }

    /// Queues a task for the application thread; it runs inside whichever
    /// wait call the application is blocked in.
    pub fn add_application_thread_task(&self, task: Task) {
        let mut inner = self.inner.lock();
        inner.app_thread_tasks.push_back(task);
        if inner.app_thread_tasks.len() == 1 {
            self.cond.notify_all();
        }
    }

    /// Waits for `stop_condition`, draining application thread tasks while
    /// blocked.
    fn application_thread_await(
        &self,
        mut stop_condition: impl FnMut(&mut SchedulerInner) -> bool,
    ) {
        let mut inner = self.inner.lock();
        while !stop_condition(&mut inner) {
            if let Some(task) = inner.app_thread_tasks.pop_front() {
                MutexGuard::unlocked(&mut inner, task);
            } else {
                self.cond.wait(&mut inner);
            }
        }
    }

    pub fn wait_until_done(&self) -> GraphResult {
        if self.state() == SchedulerState::NotStarted {
            return Err(GraphError::FailedPrecondition(
                "the graph was not started".into(),
            ));
        }
        self.application_thread_await(|_| self.is_terminated());
        Ok(())
    }

    pub fn wait_until_idle(&self) -> GraphResult {
        if self.state() == SchedulerState::NotStarted {
            return Err(GraphError::FailedPrecondition(
                "the graph was not started".into(),
            ));
        }
        self.application_thread_await(|inner| Self::is_idle(inner));
        Ok(())
    }

    pub fn is_idle_now(&self) -> bool {
        Self::is_idle(&self.inner.lock())
    }

    /// Waits until an observed output emitted a packet since the previous
    /// call, like a binary semaphore. `OutOfRange` once the graph is done.
    pub fn wait_for_observed_output(&self) -> GraphResult {
        let mut observed = false;
        self.application_thread_await(|inner| {
            observed = inner.observed_output_signal;
            inner.observed_output_signal = false;
            inner.waiting_for_observed_output = !observed && !self.is_terminated();
            !inner.waiting_for_observed_output
        });
        if observed {
            Ok(())
        } else {
            Err(GraphError::OutOfRange("the graph is done".into()))
        }
    }

    pub fn emitted_observed_output(&self) {
        let mut inner = self.inner.lock();
        inner.observed_output_signal = true;
        if inner.waiting_for_observed_output {
            self.cond.notify_all();
        }
    }

    /// The current unthrottle sequence number, captured by a caller that is
    /// about to wait for a graph input stream to unthrottle.
    pub fn current_unthrottle_seq(&self) -> u64 {
        self.inner.lock().unthrottle_seq_num
    }

    /// Waits until an unthrottle event happened after `seq` was captured, or
    /// the graph terminated. Runs application thread tasks meanwhile.
    pub fn wait_for_unthrottle(&self, seq: u64) {
        self.application_thread_await(|inner| {
            inner.unthrottle_seq_num != seq || self.is_terminated()
        });
    }

    pub fn throttled_graph_input_stream(&self) {
        self.inner.lock().throttled_graph_input_count += 1;
    }

    pub fn unthrottled_graph_input_stream(&self) {
        let mut inner = self.inner.lock();
        inner.throttled_graph_input_count -= 1;
        inner.unthrottle_seq_num += 1;
        self.cond.notify_all();
    }

    /// A packet entered a graph input stream: check whether the graph is
    /// still deadlocked and needs further unthrottling.
    pub fn added_packet_to_graph_input_stream(&self, graph: &Arc<GraphCore>) {
        if self.is_terminated() {
            return;
        }
        let mut inner = self.inner.lock();
        self.handle_idle(graph, &mut inner);
    }

    /// All graph input streams are closed; the run may be able to finish.
    /// May be called after termination.
    pub fn closed_all_graph_input_streams(&self, graph: &Arc<GraphCore>) {
        let mut inner = self.inner.lock();
        inner.graph_input_streams_closed = true;
        self.handle_idle(graph, &mut inner);
    }

    /// Pauses scheduling: queued tasks stop being submitted to executors;
    /// tasks already submitted still complete. No-op unless running.
    pub fn pause(&self) {
        let _inner = self.inner.lock();
        if self.state() != SchedulerState::Running {
            return;
        }
        self.set_state(SchedulerState::Paused);
        self.set_queues_running(false);
    }

    /// Resumes a paused scheduler and flushes tasks accumulated meanwhile.
    pub fn resume(&self, graph: &Arc<GraphCore>) {
        {
            let mut inner = self.inner.lock();
            if self.state() != SchedulerState::Paused {
                return;
            }
            self.set_state(SchedulerState::Running);
            self.set_queues_running(true);
            // handle_idle did nothing while paused; catch up now.
            self.handle_idle(graph, &mut inner);
        }
        self.submit_waiting_tasks_on_queues(graph);
    }

    /// Cancels the run. The cancellation error must already be recorded by
    /// the caller; queues keep running so in-flight work drains, and idle
    /// handling terminates the scheduler.
    pub fn cancel(&self, graph: &Arc<GraphCore>) {
        {
            let mut inner = self.inner.lock();
            if !matches!(
                self.state(),
                SchedulerState::Running | SchedulerState::Paused
            ) {
                return;
            }
            if self.state() == SchedulerState::Paused {
                self.set_queues_running(true);
            }
            self.set_state(SchedulerState::Cancelling);
            self.handle_idle(graph, &mut inner);
        }
        self.submit_waiting_tasks_on_queues(graph);
    }

    /// Clears leftover run state once the scheduler has terminated.
    pub fn cleanup_after_run(&self, graph: &Arc<GraphCore>) {
        {
            let mut inner = self.inner.lock();
            inner.sources_queue.clear();
            inner.unopened_sources.clear();
            inner.active_sources.clear();
            inner.app_thread_tasks.clear();
        }
        for queue in &self.queues {
            queue.cleanup_after_run(graph);
        }
        self.shared.set_has_error(false);
    }

    pub fn scheduler_times(&self) -> SchedulerTimes {
        self.shared.timer.scheduler_times()
    }
}
