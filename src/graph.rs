//! The user-visible graph: lifecycle, graph input streams, output observers
//! and pollers, error collection.
//!
//! [`Graph`] is a thin façade over [`GraphCore`], which owns the validated
//! config, the stream arenas, the nodes, the executors and the scheduler.
//! Worker tasks hold the core through an `Arc` only while they run, so no
//! reference cycle survives a finished run.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex, RwLock};

use crate::calculator::{
    CalculatorContext, Continuation, Contract, InputSet, LifecyclePhase,
};
use crate::config::GraphConfig;
use crate::error::{combine_errors, GraphError, GraphResult};
use crate::executor::{CurrentThreadExecutor, DelegatingExecutor, Executor, ThreadPoolExecutor};
use crate::node::CalculatorNode;
use crate::packet::Packet;
use crate::registry;
use crate::scheduler::queue::Item;
use crate::scheduler::shared::SchedulerTimes;
use crate::scheduler::{Scheduler, SchedulerState};
use crate::side_packet::{PacketGeneratorGraph, SidePacketSet};
use crate::stream::handler::NodeReadiness;
use crate::stream::input::{InputStreamManager, QueueEvents, StreamConsumer};
use crate::stream::output::{OutputStreamManager, ShardCommit, StreamObserver};
use crate::timestamp::Timestamp;
use crate::validated::{StreamProducer, ValidatedGraph};

const ERROR_PREFIX: &str = "the graph run failed";

/// How [`Graph::add_packet_to_input_stream`] behaves against full queues.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GraphInputStreamAddMode {
    /// Block until every queue the stream feeds drops below its maximum.
    #[default]
    WaitTillNotFull,
    /// Fail with [`GraphError::Unavailable`] instead of blocking.
    AddIfNotFull,
}

/// An externally fed entry point, modeled as a producer-less output stream.
struct GraphInputStream {
    stream_id: usize,
    virtual_id: usize,
}

/// One consumer-side queue in the arena, with the data needed to route its
/// fullness transitions.
pub(crate) struct InputStreamEntry {
    pub manager: InputStreamManager,
    /// The set of packet sources throttled when this queue fills up.
    pub upstream_sources: Vec<usize>,
}

struct FullStreamsState {
    add_mode: GraphInputStreamAddMode,
    /// For every source node / graph input (by throttle id), the input
    /// queues it filled up. The entity is throttled while non-empty.
    full: Vec<HashSet<usize>>,
}

struct PollerShared {
    input_stream_index: usize,
    version: Mutex<u64>,
    cond: Condvar,
}

struct RunLifecycle {
    started: bool,
    finished: bool,
}

type ErrorCallback = Box<dyn Fn(&GraphError) + Send + Sync>;

/// Everything a running graph owns. Referenced by worker tasks through an
/// `Arc`; addresses of nodes and stream managers are stable because the
/// arenas are never reallocated after `start_run`.
pub(crate) struct GraphCore {
    validated: ValidatedGraph,
    nodes: Vec<CalculatorNode>,
    output_streams: Vec<OutputStreamManager>,
    input_streams: RwLock<Vec<Arc<InputStreamEntry>>>,
    graph_inputs: IndexMap<String, GraphInputStream>,
    num_closed_graph_inputs: AtomicUsize,
    scheduler: Scheduler,
    generator_graph: PacketGeneratorGraph,
    full_state: Mutex<FullStreamsState>,
    /// Per graph-input-stream maximum queue size overrides.
    input_queue_overrides: Mutex<IndexMap<usize, i32>>,
    pollers: RwLock<Vec<Arc<PollerShared>>>,
    current_run_side_packets: RwLock<Arc<SidePacketSet>>,
    run_output_side_packets: Mutex<SidePacketSet>,
    errors: Mutex<Vec<GraphError>>,
    has_error: AtomicBool,
    error_callback: Option<ErrorCallback>,
    run_lifecycle: Mutex<RunLifecycle>,
}

impl GraphCore {
    pub fn node(&self, node_id: usize) -> &CalculatorNode {
        &self.nodes[node_id]
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    fn input_entry(&self, index: usize) -> Arc<InputStreamEntry> {
        self.input_streams.read()[index].clone()
    }

    fn graph_input_streams_closed(&self) -> bool {
        self.num_closed_graph_inputs.load(Ordering::SeqCst) == self.graph_inputs.len()
    }

    // ---- error handling -------------------------------------------------

    /// Records an error; the first one moves the graph into the error state
    /// and fires the error callback.
    pub fn record_error(&self, error: GraphError) {
        let first = {
            let mut errors = self.errors.lock();
            let first = errors.is_empty();
            // Keep the list bounded; a runaway graph can produce errors
            // faster than anyone reads them.
            if errors.len() < 20 {
                errors.push(error.clone());
            }
            first
        };
        error!("graph error: {error}");
        self.has_error.store(true, Ordering::SeqCst);
        self.scheduler.shared().set_has_error(true);
        if first {
            if let Some(callback) = &self.error_callback {
                callback(&error);
            }
        }
    }

    pub fn has_error(&self) -> bool {
        self.has_error.load(Ordering::SeqCst)
    }

    fn combined_error(&self) -> Option<GraphError> {
        combine_errors(ERROR_PREFIX, &self.errors.lock())
    }

    // ---- throttling -----------------------------------------------------

    /// True if this node or graph input filled up any downstream queue.
    pub fn is_node_throttled(&self, throttle_id: usize) -> bool {
        !self.full_state.lock().full[throttle_id].is_empty()
    }

    /// Routes a fullness transition of one input queue to the sources that
    /// feed it. Returns source nodes that just became unthrottled and must
    /// be rescheduled by the caller (with no locks held).
    fn update_throttled_streams(&self, ism_index: usize, became_full: bool) -> Vec<usize> {
        let entry = self.input_entry(ism_index);
        let mut to_schedule = Vec::new();
        let mut full = self.full_state.lock();
        for &source in &entry.upstream_sources {
            if became_full {
                let set = &mut full.full[source];
                let was_throttled = !set.is_empty();
                set.insert(ism_index);
                if !was_throttled && source >= self.nodes.len() {
                    self.scheduler.throttled_graph_input_stream();
                }
            } else {
                let set = &mut full.full[source];
                if set.remove(&ism_index) && set.is_empty() {
                    if source >= self.nodes.len() {
                        self.scheduler.unthrottled_graph_input_stream();
                    } else {
                        to_schedule.push(source);
                    }
                }
            }
        }
        to_schedule
    }

    fn handle_queue_events(self: &Arc<Self>, ism_index: usize, events: QueueEvents) {
        if events.became_full {
            let scheduled = self.update_throttled_streams(ism_index, true);
            debug_assert!(scheduled.is_empty());
        }
        if events.became_not_full {
            let to_schedule = self.update_throttled_streams(ism_index, false);
            self.scheduler
                .schedule_unthrottled_ready_nodes(self, &to_schedule);
        }
    }

    /// Grows the queue of every full stream that throttles a live source or
    /// graph input, one increment per stream per pass. Returns whether any
    /// queue was grown; the scheduler's idle loop repeats the pass while it
    /// makes progress.
    pub fn unthrottle_sources(self: &Arc<Self>) -> bool {
        let full_streams: Vec<usize> = {
            let full = self.full_state.lock();
            let mut streams = HashSet::new();
            for (entity, set) in full.full.iter().enumerate() {
                if set.is_empty() {
                    continue;
                }
                let closed = if entity < self.nodes.len() {
                    self.nodes[entity].is_closed()
                } else {
                    let input = &self.graph_inputs[entity - self.nodes.len()];
                    self.output_streams[input.stream_id].is_closed()
                };
                if !closed {
                    streams.extend(set.iter().copied());
                }
            }
            streams.into_iter().collect()
        };

        let mut grew_any = false;
        for ism_index in full_streams {
            let entry = self.input_entry(ism_index);
            let max = entry.manager.max_queue_size();
            if max < 1 {
                continue;
            }
            let grown = max + 1;
            warn!(
                "resolving deadlock by raising the max queue size of stream '{}' to {grown}",
                entry.manager.name()
            );
            let events = entry.manager.set_max_queue_size(grown);
            self.handle_queue_events(ism_index, events);
            grew_any = true;
        }
        grew_any
    }

    // ---- contexts -------------------------------------------------------

    fn build_context(
        &self,
        node_id: usize,
        phase: LifecyclePhase,
        input_timestamp: Timestamp,
        inputs: InputSet,
        final_status: Result<(), GraphError>,
    ) -> Box<CalculatorContext> {
        let node = &self.nodes[node_id];
        let outputs = node
            .output_stream_ids()
            .iter()
            .map(|&s| self.output_streams[s].make_shard())
            .collect();
        let input_headers = node
            .input_stream_ids()
            .iter()
            .map(|&i| self.input_entry(i).manager.header())
            .collect();
        let side_names = node.input_side_names();
        Box::new(CalculatorContext {
            node_id,
            node_name: node.name().clone(),
            options: node.options(),
            side_packet_names: side_names,
            side_packets: node.side_packets(),
            output_side_names: node.output_side_names(),
            input_headers,
            inputs,
            outputs,
            input_timestamp,
            phase,
            offset: None,
            staged_side_outputs: Vec::new(),
            final_status,
        })
    }

    /// The context of one `process` call of a source node. Sources are
    /// non-reentrant, so this is only ever alive once per node.
    pub fn make_source_context(&self, node_id: usize) -> Box<CalculatorContext> {
        self.build_context(
            node_id,
            LifecyclePhase::Process,
            Timestamp::UNSET,
            InputSet::empty(0),
            Ok(()),
        )
    }

    // ---- node lifecycle tasks ------------------------------------------

    /// Runs `open` for a node, committing its emissions (a calculator may
    /// legitimately output packets during `open`).
    pub fn open_node_task(self: &Arc<Self>, node_id: usize) -> GraphResult {
        let node = &self.nodes[node_id];
        let mut cc = self.build_context(
            node_id,
            LifecyclePhase::Open,
            Timestamp::UNSTARTED,
            InputSet::empty(node.input_stream_ids().len()),
            Ok(()),
        );
        node.open_node(&mut cc)?;
        // The declared offset drives automatic bound propagation from now on.
        for &stream_id in node.output_stream_ids() {
            self.output_streams[stream_id].set_offset(cc.offset);
        }
        self.commit_side_outputs(&mut cc);
        self.propagate_context_outputs(node_id, cc, None);
        Ok(())
    }

    /// Called by the queue once `open` succeeded.
    pub fn node_opened(self: &Arc<Self>, node_id: usize) {
        let node = &self.nodes[node_id];
        debug!("node '{}' opened", node.name());
        if node.is_source() {
            self.scheduler.add_node_to_sources_queue(self, node_id);
        } else {
            // Upstream opens may already have made this node ready.
            self.schedule_invocations(node_id);
        }
    }

    /// Runs `process` with a prepared context and propagates the outputs.
    /// `Stop` still propagates: a source may flush its last packets and stop
    /// in the same invocation.
    pub fn process_node_task(
        self: &Arc<Self>,
        node_id: usize,
        mut cc: Box<CalculatorContext>,
    ) -> GraphResult<Continuation> {
        let node = &self.nodes[node_id];
        let input_timestamp = cc.input_timestamp;
        let result = node.process_node(&mut cc);
        match result {
            Ok(continuation) => {
                self.commit_side_outputs(&mut cc);
                self.propagate_context_outputs(node_id, cc, Some(input_timestamp));
                Ok(continuation)
            }
            Err(e) => Err(e),
        }
    }

    /// Closes a node at most once: runs `close` (unless `open` failed),
    /// propagates its final emissions, closes its output streams and drops
    /// its input queues.
    pub fn close_node(
        self: &Arc<Self>,
        node_id: usize,
        final_status: Result<(), GraphError>,
        graph_run_ended: bool,
    ) {
        let node = &self.nodes[node_id];
        let Some(mode) = node.begin_close() else {
            return;
        };
        debug!(
            "closing node '{}' ({}{})",
            node.name(),
            if final_status.is_ok() { "graceful" } else { "aborted" },
            if graph_run_ended { ", run ended" } else { "" }
        );

        if mode.invoke_close {
            let mut cc = self.build_context(
                node_id,
                LifecyclePhase::Close,
                Timestamp::DONE,
                InputSet::empty(node.input_stream_ids().len()),
                final_status,
            );
            let result = node.close_node(&mut cc);
            match result {
                Ok(()) => {
                    self.commit_side_outputs(&mut cc);
                    self.propagate_context_outputs(node_id, cc, None);
                }
                Err(e) if mode.report_result => self.record_error(e),
                Err(_) => {}
            }
        }

        for &stream_id in node.output_stream_ids() {
            if self.output_streams[stream_id].close() {
                self.propagate_stream_closure(stream_id);
            }
        }
        for &ism_index in node.input_stream_ids() {
            let entry = self.input_entry(ism_index);
            let events = entry.manager.close();
            self.handle_queue_events(ism_index, events);
        }
    }

    /// Re-evaluates a node after one of its invocations finished.
    pub fn schedule_if_ready(self: &Arc<Self>, node_id: usize) {
        if self.nodes[node_id].is_source() {
            self.scheduler.schedule_node_if_not_throttled(self, node_id);
        } else {
            self.schedule_invocations(node_id);
        }
    }

    /// The readiness glue for non-source nodes: claims the node, asks its
    /// handler, and either enqueues a prepared invocation, closes the node,
    /// or backs off.
    pub fn schedule_invocations(self: &Arc<Self>, node_id: usize) {
        let node = &self.nodes[node_id];
        if node.is_source() {
            return;
        }
        loop {
            if !node.try_to_begin_scheduling() {
                // Closed, not yet opened, or another invocation is in
                // flight; the next end-of-invocation re-checks readiness.
                return;
            }
            let entries: Vec<Arc<InputStreamEntry>> = node
                .input_stream_ids()
                .iter()
                .map(|&i| self.input_entry(i))
                .collect();
            let streams: Vec<&InputStreamManager> =
                entries.iter().map(|e| &e.manager).collect();

            let dropped = node.handler().prepare_readiness(&streams);
            self.route_local_events(node, &dropped);

            let readiness = match node.handler().readiness(&streams) {
                Ok(readiness) => readiness,
                Err(e) => {
                    node.end_scheduling();
                    self.record_error(e);
                    return;
                }
            };
            match readiness {
                NodeReadiness::NotReady => {
                    // A declared offset lets bounds flow through the node
                    // even though nothing is ready to process.
                    self.propagate_offset_bounds(node, &streams);
                    node.end_scheduling();
                    // Re-check: a packet may have arrived while we held the
                    // claim, and its notifier saw the claim and moved on.
                    match node.handler().readiness(&streams) {
                        Ok(NodeReadiness::NotReady) | Err(_) => return,
                        _ => continue,
                    }
                }
                NodeReadiness::ReadyForClose => {
                    node.end_scheduling();
                    self.close_node(node_id, Ok(()), false);
                    return;
                }
                NodeReadiness::ReadyForProcess(timestamp) => {
                    if let Err(e) = node.check_process_timestamp(timestamp) {
                        node.end_scheduling();
                        self.record_error(e);
                        return;
                    }
                    let mut set = InputSet::empty(streams.len());
                    match node.handler().fill_input_set(timestamp, &streams, &mut set) {
                        Ok(not_full) => self.route_local_events(node, &not_full),
                        Err(e) => {
                            node.end_scheduling();
                            self.record_error(e);
                            return;
                        }
                    }
                    let cc = self.build_context(
                        node_id,
                        LifecyclePhase::Process,
                        timestamp,
                        set,
                        Ok(()),
                    );
                    let item = Item::process(node_id, false, 0, 0, cc);
                    self.scheduler
                        .queue(node.queue_index())
                        .add_prepared(self, item);
                    return;
                }
            }
        }
    }

    /// With a declared offset, a node promises every output timestamp to be
    /// the input timestamp plus the offset, so its output bounds can follow
    /// the input bounds without running `process`. Called with the node's
    /// scheduling claim held, which keeps the producer side exclusive.
    fn propagate_offset_bounds(
        self: &Arc<Self>,
        node: &CalculatorNode,
        streams: &[&InputStreamManager],
    ) {
        let Some(offset) = node.offset() else { return };
        let min_input = streams
            .iter()
            .map(|s| {
                s.head_timestamp()
                    .unwrap_or_else(|| s.next_timestamp_bound())
            })
            .min();
        let Some(min_input) = min_input else { return };
        let candidate = min_input.saturating_add(offset);
        for &stream_id in node.output_stream_ids() {
            if let Some(commit) = self.output_streams[stream_id].advance_bound(candidate) {
                self.propagate_commit(stream_id, commit);
            }
        }
    }

    /// Maps handler-local stream indices to arena indices and routes their
    /// became-not-full transitions.
    fn route_local_events(self: &Arc<Self>, node: &CalculatorNode, local_indices: &[usize]) {
        for &local in local_indices {
            let ism_index = node.input_stream_ids()[local];
            self.handle_queue_events(
                ism_index,
                QueueEvents {
                    became_full: false,
                    became_not_full: true,
                },
            );
        }
    }

    // ---- propagation ----------------------------------------------------

    fn commit_side_outputs(&self, cc: &mut CalculatorContext) {
        for (name, packet) in cc.staged_side_outputs.drain(..) {
            let mut side = self.run_output_side_packets.lock();
            if side.contains_key(&name) {
                drop(side);
                self.record_error(GraphError::AlreadyExists(format!(
                    "output side packet '{name}' was produced twice"
                )));
            } else {
                side.insert(name, packet);
            }
        }
    }

    /// Commits every output shard of a finished invocation and pushes the
    /// results to the downstream queues, observers and pollers. The whole
    /// shard becomes visible atomically per stream.
    fn propagate_context_outputs(
        self: &Arc<Self>,
        node_id: usize,
        cc: Box<CalculatorContext>,
        input_timestamp: Option<Timestamp>,
    ) {
        let node = &self.nodes[node_id];
        let stream_ids: Vec<usize> = node.output_stream_ids().to_vec();
        let cc = *cc;
        for (shard, stream_id) in cc.outputs.into_iter().zip(stream_ids) {
            if shard.is_unchanged() && input_timestamp.is_none() {
                continue;
            }
            match self.output_streams[stream_id].commit_shard(shard, input_timestamp) {
                Ok(commit) => {
                    if commit.bound_advanced || !commit.packets.is_empty() || commit.header.is_some()
                    {
                        self.propagate_commit(stream_id, commit);
                    }
                }
                Err(e) => self.record_error(e),
            }
        }
    }

    /// Sends the terminal bound of a closed stream downstream.
    fn propagate_stream_closure(self: &Arc<Self>, stream_id: usize) {
        self.propagate_commit(
            stream_id,
            ShardCommit {
                packets: Vec::new(),
                bound: Timestamp::DONE,
                bound_advanced: true,
                closed_now: true,
                header: None,
            },
        );
    }

    fn propagate_commit(self: &Arc<Self>, stream_id: usize, commit: ShardCommit) {
        let osm = &self.output_streams[stream_id];

        let (observed_packets, observer_errors) = osm.notify_observers(&commit);
        for e in observer_errors {
            self.record_error(e);
        }
        if observed_packets {
            self.scheduler.emitted_observed_output();
        }

        for ism_index in osm.mirrors() {
            let entry = self.input_entry(ism_index);
            if let Some(header) = &commit.header {
                entry.manager.set_header(header.clone());
            }
            let events = match entry.manager.add_packets(commit.packets.iter().cloned()) {
                Ok(events) => events,
                Err(e) => {
                    self.record_error(e);
                    continue;
                }
            };
            let bound_moved = entry.manager.set_next_timestamp_bound(commit.bound);
            self.handle_queue_events(ism_index, events);
            if !commit.packets.is_empty() || bound_moved {
                match entry.manager.consumer() {
                    StreamConsumer::Node { node_id, .. } => self.schedule_invocations(node_id),
                    StreamConsumer::Poller(index) => self.notify_poller(index),
                }
            }
        }
    }

    fn notify_poller(&self, poller_index: usize) {
        let poller = self.pollers.read()[poller_index].clone();
        let mut version = poller.version.lock();
        *version += 1;
        poller.cond.notify_all();
    }

    fn notify_all_pollers(&self) {
        let count = self.pollers.read().len();
        for i in 0..count {
            self.notify_poller(i);
        }
    }

    // ---- run lifecycle --------------------------------------------------

    fn prepare_for_run(
        self: &Arc<Self>,
        extra_side_packets: &SidePacketSet,
        stream_headers: &SidePacketSet,
    ) -> GraphResult {
        {
            let lifecycle = self.run_lifecycle.lock();
            if lifecycle.started && !lifecycle.finished {
                return Err(GraphError::FailedPrecondition(
                    "the graph is already running".into(),
                ));
            }
        }

        let run_side_packets = self.generator_graph.run_graph_setup(extra_side_packets)?;

        self.errors.lock().clear();
        self.has_error.store(false, Ordering::SeqCst);
        self.run_output_side_packets.lock().clear();
        *self.current_run_side_packets.write() = Arc::new(run_side_packets);
        self.num_closed_graph_inputs.store(0, Ordering::SeqCst);

        for osm in &self.output_streams {
            osm.prepare_for_run();
        }
        {
            let input_streams = self.input_streams.read();
            for entry in input_streams.iter() {
                entry.manager.prepare_for_run(self.validated.max_queue_size);
            }
            for (&stream_id, &max) in self.input_queue_overrides.lock().iter() {
                for ism_index in self.output_streams[stream_id].mirrors() {
                    input_streams[ism_index].manager.set_max_queue_size(max);
                }
            }
        }
        {
            let mut full = self.full_state.lock();
            for set in full.full.iter_mut() {
                set.clear();
            }
        }

        for (name, header) in stream_headers {
            let input = self.graph_inputs.get(name).ok_or_else(|| {
                GraphError::InvalidArgument(format!(
                    "stream header given for unknown graph input stream '{name}'"
                ))
            })?;
            self.output_streams[input.stream_id].set_header(header.clone());
            for ism_index in self.output_streams[input.stream_id].mirrors() {
                self.input_entry(ism_index).manager.set_header(header.clone());
            }
        }

        let side_packets = self.current_run_side_packets.read().clone();
        for node in &self.nodes {
            let mut resolved = Vec::new();
            for name in node.input_side_names().iter() {
                let packet = side_packets.get(name).ok_or_else(|| {
                    GraphError::InvalidArgument(format!(
                        "node '{}' needs side packet '{name}', which was not provided or \
                         generated",
                        node.name()
                    ))
                })?;
                resolved.push(packet.clone());
            }
            node.prepare_for_run(resolved)?;
        }

        self.scheduler.reset(self.graph_input_streams_closed());
        for node in &self.nodes {
            if node.is_source() {
                self.scheduler
                    .add_unopened_source_node(node.id(), node.source_layer());
            }
        }
        for node in &self.nodes {
            self.scheduler.schedule_node_for_open(self, node.id());
        }

        let mut lifecycle = self.run_lifecycle.lock();
        lifecycle.started = true;
        lifecycle.finished = false;
        Ok(())
    }

    /// Closes whatever is still open once the scheduler terminated and
    /// returns the combined run status. Idempotent.
    fn finish_run(self: &Arc<Self>) -> GraphResult {
        let mut lifecycle = self.run_lifecycle.lock();
        if lifecycle.started && !lifecycle.finished {
            let final_status = match self.combined_error() {
                Some(e) => Err(e),
                None => Ok(()),
            };
            for node_id in 0..self.nodes.len() {
                self.close_node(node_id, final_status.clone(), true);
            }
            for stream_id in 0..self.output_streams.len() {
                if self.output_streams[stream_id].close() {
                    self.propagate_stream_closure(stream_id);
                }
            }
            self.notify_all_pollers();
            self.scheduler.cleanup_after_run(self);
            lifecycle.finished = true;
        }
        match self.combined_error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // ---- graph input streams -------------------------------------------

    fn graph_input(&self, name: &str) -> GraphResult<&GraphInputStream> {
        self.graph_inputs
            .get(name)
            .ok_or_else(|| GraphError::NotFound(format!("no graph input stream named '{name}'")))
    }

    fn ensure_running(&self) -> GraphResult {
        if self.scheduler.state() == SchedulerState::NotStarted {
            return Err(GraphError::FailedPrecondition(
                "the graph was not started".into(),
            ));
        }
        Ok(())
    }

    fn add_packet_to_input_stream(self: &Arc<Self>, name: &str, packet: Packet) -> GraphResult {
        let input = self.graph_input(name)?;
        self.ensure_running()?;
        if packet.is_empty() {
            return Err(GraphError::InvalidArgument(format!(
                "cannot add an empty packet to graph input stream '{name}'"
            )));
        }
        if !packet.timestamp().is_allowed_in_stream() {
            return Err(GraphError::InvalidArgument(format!(
                "timestamp {} is not valid for graph input stream '{name}'",
                packet.timestamp()
            )));
        }

        // Throttle gate: either wait for the downstream queues to drain or
        // bail out, depending on the add mode.
        loop {
            if self.scheduler.is_terminated() {
                return Err(self.combined_error().unwrap_or_else(|| {
                    GraphError::FailedPrecondition("the graph is terminated".into())
                }));
            }
            let wait_seq = {
                let full = self.full_state.lock();
                if full.full[input.virtual_id].is_empty() {
                    None
                } else {
                    match full.add_mode {
                        GraphInputStreamAddMode::AddIfNotFull => {
                            return Err(GraphError::Unavailable(format!(
                                "graph input stream '{name}' is throttled"
                            )));
                        }
                        GraphInputStreamAddMode::WaitTillNotFull => {
                            // Capture the sequence number while the throttle
                            // state is still locked, so no unthrottle event
                            // can slip in between.
                            Some(self.scheduler.current_unthrottle_seq())
                        }
                    }
                }
            };
            match wait_seq {
                None => break,
                Some(seq) => self.scheduler.wait_for_unthrottle(seq),
            }
        }

        if self.has_error() {
            return Err(self
                .combined_error()
                .expect("error flag set without recorded errors"));
        }

        let osm = &self.output_streams[input.stream_id];
        let mut shard = osm.make_shard();
        shard.add_packet(packet)?;
        let commit = osm.commit_shard(shard, None)?;
        self.propagate_commit(input.stream_id, commit);
        self.scheduler.added_packet_to_graph_input_stream(self);
        Ok(())
    }

    fn set_input_stream_timestamp_bound(
        self: &Arc<Self>,
        name: &str,
        bound: Timestamp,
    ) -> GraphResult {
        let input = self.graph_input(name)?;
        self.ensure_running()?;
        let osm = &self.output_streams[input.stream_id];
        let mut shard = osm.make_shard();
        shard.set_next_timestamp_bound(bound)?;
        let commit = osm.commit_shard(shard, None)?;
        if commit.bound_advanced {
            self.propagate_commit(input.stream_id, commit);
        }
        self.scheduler.added_packet_to_graph_input_stream(self);
        Ok(())
    }

    fn close_input_stream(self: &Arc<Self>, name: &str) -> GraphResult {
        let input = self.graph_input(name)?;
        if self.output_streams[input.stream_id].close() {
            self.propagate_stream_closure(input.stream_id);
            let closed = self.num_closed_graph_inputs.fetch_add(1, Ordering::SeqCst) + 1;
            if closed == self.graph_inputs.len() {
                self.scheduler.closed_all_graph_input_streams(self);
            }
        }
        Ok(())
    }
}

/// The primary user-facing type: build it, initialize it with a config,
/// start a run, feed packets, observe outputs, wait.
///
/// ```no_run
/// # use flowgraph::prelude::*;
/// # fn main() -> Result<(), GraphError> {
/// let config = GraphConfig::default()
///     .input_stream("in")
///     .node(NodeConfig::new("PassThroughCalculator").input("in").output("out"));
/// let mut graph = Graph::new();
/// graph.initialize(config, SidePacketSet::new())?;
/// graph.observe_output_stream("out", |packet| {
///     println!("got {packet:?}");
///     Ok(())
/// }, false)?;
/// graph.start_run(SidePacketSet::new())?;
/// graph.add_packet_to_input_stream("in", Packet::new(1i32).at(Timestamp::new(0)))?;
/// graph.close_all_input_streams()?;
/// graph.wait_until_done()?;
/// # Ok(())
/// # }
/// ```
pub struct Graph {
    core: Option<Arc<GraphCore>>,
    staged_executors: Vec<(String, Arc<dyn Executor>)>,
    staged_error_callback: Option<ErrorCallback>,
}

impl Default for Graph {
    fn default() -> Self {
        Graph::new()
    }
}

impl Graph {
    pub fn new() -> Graph {
        Graph {
            core: None,
            staged_executors: Vec::new(),
            staged_error_callback: None,
        }
    }

    fn core(&self) -> GraphResult<&Arc<GraphCore>> {
        self.core.as_ref().ok_or_else(|| {
            GraphError::FailedPrecondition("the graph was not initialized".into())
        })
    }

    /// Provides the executor running the nodes assigned to `name`; the
    /// empty name replaces the default executor. Must be called before
    /// [`Graph::initialize`].
    pub fn set_executor(&mut self, name: &str, executor: Arc<dyn Executor>) -> GraphResult {
        if self.core.is_some() {
            return Err(GraphError::FailedPrecondition(
                "set_executor must be called before initialize".into(),
            ));
        }
        if name.starts_with("__") {
            return Err(GraphError::InvalidArgument(format!(
                "executor name '{name}' is reserved"
            )));
        }
        if self.staged_executors.iter().any(|(n, _)| n == name) {
            return Err(GraphError::AlreadyExists(format!(
                "an executor named '{name}' was already provided"
            )));
        }
        self.staged_executors.push((name.to_string(), executor));
        Ok(())
    }

    /// Registers a callback fired (once) when the graph records its first
    /// error. Useful when no thread is blocked in a wait call. Must be
    /// called before [`Graph::initialize`].
    pub fn set_error_callback(
        &mut self,
        callback: impl Fn(&GraphError) + Send + Sync + 'static,
    ) -> GraphResult {
        if self.core.is_some() {
            return Err(GraphError::FailedPrecondition(
                "set_error_callback must be called before initialize".into(),
            ));
        }
        self.staged_error_callback = Some(Box::new(callback));
        Ok(())
    }

    /// Validates `config`, allocates every stream and node, builds the
    /// executors and runs the base phase of the packet generators.
    /// Must be called exactly once.
    pub fn initialize(&mut self, config: GraphConfig, side_packets: SidePacketSet) -> GraphResult {
        if self.core.is_some() {
            return Err(GraphError::FailedPrecondition(
                "the graph is already initialized".into(),
            ));
        }
        let validated = ValidatedGraph::validate(config.clone())?;

        // Build the executors first: nodes and the generator graph need
        // them. The application-thread executor forwards into the scheduler
        // once the core exists.
        let core_cell: Arc<OnceCell<Weak<GraphCore>>> = Arc::new(OnceCell::new());
        let mut executors: IndexMap<String, Arc<dyn Executor>> = IndexMap::new();
        let mut provided = std::mem::take(&mut self.staged_executors);
        let take_provided = |provided: &mut Vec<(String, Arc<dyn Executor>)>, name: &str| {
            provided
                .iter()
                .position(|(n, _)| n == name)
                .map(|i| provided.remove(i).1)
        };

        let default_executor: Arc<dyn Executor> =
            if let Some(executor) = take_provided(&mut provided, "") {
                executor
            } else if config.num_threads == 0 {
                let cell = core_cell.clone();
                Arc::new(DelegatingExecutor::new(move |task| {
                    if let Some(core) = cell.get().and_then(Weak::upgrade) {
                        core.scheduler().add_application_thread_task(task);
                    }
                }))
            } else {
                Arc::new(ThreadPoolExecutor::with_name_prefix(
                    config.num_threads,
                    "flowgraph-worker",
                ))
            };
        executors.insert(String::new(), default_executor.clone());

        for declaration in &config.executors {
            let executor: Arc<dyn Executor> = match declaration.executor_type.as_deref() {
                Some("threadpool") => Arc::new(ThreadPoolExecutor::with_name_prefix(
                    declaration.num_threads.max(1),
                    &declaration.name,
                )),
                Some("current_thread") => Arc::new(CurrentThreadExecutor),
                Some(other) => {
                    return Err(GraphError::InvalidArgument(format!(
                        "unknown executor type '{other}'"
                    )));
                }
                None => take_provided(&mut provided, &declaration.name).ok_or_else(|| {
                    GraphError::InvalidArgument(format!(
                        "executor '{}' is declared without a type and was not provided",
                        declaration.name
                    ))
                })?,
            };
            executors.insert(declaration.name.clone(), executor);
        }
        if let Some((name, _)) = provided.first() {
            return Err(GraphError::InvalidArgument(format!(
                "executor '{name}' was provided but never declared"
            )));
        }

        // The generator graph runs on the default executor, unless that is
        // the application thread (nobody would drain it during initialize).
        let generator_executor: Arc<dyn Executor> = if config.num_threads == 0 {
            Arc::new(CurrentThreadExecutor)
        } else {
            default_executor.clone()
        };
        let mut generator_graph =
            PacketGeneratorGraph::new(config.generators.clone(), generator_executor);
        generator_graph.initialize(&side_packets)?;

        // Scheduler: default queue plus one per named executor.
        let executor_names: Vec<String> = executors
            .keys()
            .filter(|n| !n.is_empty())
            .cloned()
            .collect();
        let scheduler = Scheduler::new(&executor_names);

        // Output stream managers, with types taken from the producers'
        // contracts.
        let mut contracts = Vec::with_capacity(validated.nodes.len());
        for node in &validated.nodes {
            let factory = registry::calculator_factory(&node.config.calculator)?;
            let probe = factory();
            let mut contract = Contract::new(
                node.config.input_streams.len(),
                node.config.output_streams.len(),
            );
            probe.contract(&mut contract)?;
            contracts.push((factory, contract));
        }

        let mut stream_types = Vec::with_capacity(validated.streams.len());
        let mut output_streams = Vec::with_capacity(validated.streams.len());
        for stream in &validated.streams {
            let type_spec = match stream.producer {
                StreamProducer::Node {
                    node_id,
                    output_index,
                } => contracts[node_id].1.outputs[output_index],
                StreamProducer::GraphInput(_) => None,
            };
            stream_types.push(type_spec);
            output_streams.push(OutputStreamManager::new(&stream.name, type_spec));
        }

        // Where both ends declared a type, they must agree.
        for edge in &validated.input_edges {
            let consumed = contracts[edge.node_id].1.inputs[edge.input_index];
            if let (Some(expected), Some(produced)) = (consumed, stream_types[edge.stream_id]) {
                if expected.type_id != produced.type_id {
                    return Err(GraphError::InvalidArgument(format!(
                        "stream '{}' carries {} but node '{}' expects {}",
                        validated.streams[edge.stream_id].name,
                        produced.type_name,
                        validated.nodes[edge.node_id].name,
                        expected.type_name
                    )));
                }
            }
        }

        // Input stream managers: one per consuming edge, wired as mirrors of
        // their producing stream.
        let mut input_streams = Vec::with_capacity(validated.input_edges.len());
        for (edge_id, edge) in validated.input_edges.iter().enumerate() {
            let stream = &validated.streams[edge.stream_id];
            let manager = InputStreamManager::new(
                &stream.name,
                StreamConsumer::Node {
                    node_id: edge.node_id,
                    input_index: edge.input_index,
                },
                edge.back_edge,
            );
            output_streams[edge.stream_id].add_mirror(edge_id);
            input_streams.push(Arc::new(InputStreamEntry {
                manager,
                upstream_sources: stream.upstream_sources.clone(),
            }));
        }

        // Nodes.
        let default_handler = config
            .input_stream_handler
            .clone()
            .unwrap_or_else(|| crate::config::HandlerConfig::new("DefaultInputStreamHandler"));
        let mut nodes = Vec::with_capacity(validated.nodes.len());
        for (node_id, node) in validated.nodes.iter().enumerate() {
            let handler_config = node
                .config
                .input_stream_handler
                .clone()
                .unwrap_or_else(|| default_handler.clone());
            let handler = registry::create_input_stream_handler(
                &handler_config.handler,
                &handler_config.options,
            )?;
            let queue_index = scheduler
                .queue_index(&node.config.executor)
                .expect("validated executor name");
            let (factory, _) = &contracts[node_id];
            nodes.push(CalculatorNode::new(
                node_id,
                &node.name,
                factory.clone(),
                node.config.options.clone(),
                node.config.source_layer,
                queue_index,
                node.input_edge_ids.clone(),
                node.output_stream_ids.clone(),
                handler,
                node.config.input_side_packets.clone(),
                node.config.output_side_packets.clone(),
            ));
        }

        let graph_inputs: IndexMap<String, GraphInputStream> = validated
            .graph_input_names
            .iter()
            .enumerate()
            .map(|(k, name)| {
                let stream_id = validated.stream_id_by_name(name).expect("wired above");
                (
                    name.clone(),
                    GraphInputStream {
                        stream_id,
                        virtual_id: validated.virtual_id(k),
                    },
                )
            })
            .collect();

        let num_throttle_entities = validated.num_throttle_entities();
        let core = Arc::new(GraphCore {
            validated,
            nodes,
            output_streams,
            input_streams: RwLock::new(input_streams),
            graph_inputs,
            num_closed_graph_inputs: AtomicUsize::new(0),
            scheduler,
            generator_graph,
            full_state: Mutex::new(FullStreamsState {
                add_mode: GraphInputStreamAddMode::default(),
                full: vec![HashSet::new(); num_throttle_entities],
            }),
            input_queue_overrides: Mutex::new(IndexMap::new()),
            pollers: RwLock::new(Vec::new()),
            current_run_side_packets: RwLock::new(Arc::new(SidePacketSet::new())),
            run_output_side_packets: Mutex::new(SidePacketSet::new()),
            errors: Mutex::new(Vec::new()),
            has_error: AtomicBool::new(false),
            error_callback: self.staged_error_callback.take(),
            run_lifecycle: Mutex::new(RunLifecycle {
                started: false,
                finished: false,
            }),
        });
        core_cell.set(Arc::downgrade(&core)).ok();

        // Bind every queue to its executor.
        core.scheduler.queue(0).set_executor(default_executor);
        for (name, executor) in &executors {
            if name.is_empty() {
                continue;
            }
            let index = core.scheduler.queue_index(name).expect("registered above");
            core.scheduler.queue(index).set_executor(executor.clone());
        }

        info!(
            "graph initialized: {} nodes, {} streams, {} graph inputs",
            core.nodes.len(),
            core.output_streams.len(),
            core.graph_inputs.len()
        );
        self.core = Some(core);
        Ok(())
    }

    /// Starts a run: runs the per-run generator phase, prepares every node
    /// and stream, and starts the scheduler. Returns as soon as scheduling
    /// is under way.
    pub fn start_run(&self, extra_side_packets: SidePacketSet) -> GraphResult {
        self.start_run_with_headers(extra_side_packets, SidePacketSet::new())
    }

    /// Like [`Graph::start_run`], also setting graph input stream headers.
    /// Headers exist for compatibility with calculators that read them in
    /// `open`; new code should put per-run constants in side packets
    /// instead.
    pub fn start_run_with_headers(
        &self,
        extra_side_packets: SidePacketSet,
        stream_headers: SidePacketSet,
    ) -> GraphResult {
        let core = self.core()?;
        core.prepare_for_run(&extra_side_packets, &stream_headers)?;
        core.scheduler.start(core);
        Ok(())
    }

    /// Convenience blocking run: start, close the graph input streams, and
    /// wait until every packet source is exhausted. Source nodes run to
    /// completion; use [`Graph::close_all_packet_sources`] to stop them
    /// early.
    pub fn run(&self, extra_side_packets: SidePacketSet) -> GraphResult {
        self.start_run(extra_side_packets)?;
        self.close_all_input_streams()?;
        self.wait_until_done()
    }

    pub fn has_input_stream(&self, name: &str) -> bool {
        self.core
            .as_ref()
            .map(|core| core.graph_inputs.contains_key(name))
            .unwrap_or(false)
    }

    /// Adds a packet to a graph input stream, honoring the add mode against
    /// full downstream queues. Timestamps must strictly increase per stream.
    pub fn add_packet_to_input_stream(&self, name: &str, packet: Packet) -> GraphResult {
        let core = self.core()?;
        core.add_packet_to_input_stream(name, packet)
    }

    /// Promises that no packet with a timestamp below `bound` will be added
    /// to the stream anymore.
    pub fn set_input_stream_timestamp_bound(&self, name: &str, bound: Timestamp) -> GraphResult {
        let core = self.core()?;
        core.set_input_stream_timestamp_bound(name, bound)
    }

    /// Overrides the maximum queue size of the queues fed by a graph input
    /// stream.
    pub fn set_input_stream_max_queue_size(
        &self,
        name: &str,
        max_queue_size: i32,
    ) -> GraphResult {
        let core = self.core()?;
        let input = core.graph_input(name)?;
        core.input_queue_overrides
            .lock()
            .insert(input.stream_id, max_queue_size);
        // Apply immediately too, in case the run is under way.
        for ism_index in core.output_streams[input.stream_id].mirrors() {
            let entry = core.input_entry(ism_index);
            let events = entry.manager.set_max_queue_size(max_queue_size);
            core.handle_queue_events(ism_index, events);
        }
        Ok(())
    }

    /// Closes a graph input stream. Idempotent.
    pub fn close_input_stream(&self, name: &str) -> GraphResult {
        let core = self.core()?;
        core.close_input_stream(name)
    }

    pub fn close_all_input_streams(&self) -> GraphResult {
        let core = self.core()?;
        let names: Vec<String> = core.graph_inputs.keys().cloned().collect();
        for name in names {
            core.close_input_stream(&name)?;
        }
        if core.graph_inputs.is_empty() {
            core.scheduler.closed_all_graph_input_streams(core);
        }
        Ok(())
    }

    /// Closes all graph input streams and asks every source node to stop at
    /// its next scheduling opportunity.
    pub fn close_all_packet_sources(&self) -> GraphResult {
        let core = self.core()?;
        core.scheduler.shared().set_stopping();
        self.close_all_input_streams()
    }

    pub fn get_graph_input_stream_add_mode(&self) -> GraphInputStreamAddMode {
        self.core
            .as_ref()
            .map(|core| core.full_state.lock().add_mode)
            .unwrap_or_default()
    }

    pub fn set_graph_input_stream_add_mode(&self, mode: GraphInputStreamAddMode) {
        if let Some(core) = &self.core {
            core.full_state.lock().add_mode = mode;
        }
    }

    /// Registers a callback invoked synchronously, on the emitting thread,
    /// for every packet of the named stream. With `observe_timestamp_bounds`
    /// the callback also receives empty packets carrying pure bound
    /// advancement (including the terminal bound when the stream closes).
    /// Must be called before the run starts.
    pub fn observe_output_stream(
        &self,
        name: &str,
        callback: impl FnMut(&Packet) -> GraphResult + Send + 'static,
        observe_timestamp_bounds: bool,
    ) -> GraphResult {
        let core = self.core()?;
        let stream_id = core
            .validated
            .stream_id_by_name(name)
            .ok_or_else(|| GraphError::NotFound(format!("no stream named '{name}'")))?;
        core.output_streams[stream_id].add_observer(StreamObserver {
            callback: Mutex::new(Box::new(callback)),
            observe_timestamp_bounds,
        });
        Ok(())
    }

    /// Registers a polling consumer with its own bounded queue, wired into
    /// the throttling bookkeeping like any node input. Must be called before
    /// the run starts.
    pub fn add_output_stream_poller(&self, name: &str) -> GraphResult<OutputStreamPoller> {
        let core = self.core()?;
        let stream_id = core
            .validated
            .stream_id_by_name(name)
            .ok_or_else(|| GraphError::NotFound(format!("no stream named '{name}'")))?;

        let mut input_streams = core.input_streams.write();
        let mut pollers = core.pollers.write();
        let ism_index = input_streams.len();
        let poller_index = pollers.len();
        let manager = InputStreamManager::new(name, StreamConsumer::Poller(poller_index), false);
        manager.prepare_for_run(core.validated.max_queue_size);
        input_streams.push(Arc::new(InputStreamEntry {
            manager,
            upstream_sources: core.validated.streams[stream_id].upstream_sources.clone(),
        }));
        core.output_streams[stream_id].add_mirror(ism_index);
        let shared = Arc::new(PollerShared {
            input_stream_index: ism_index,
            version: Mutex::new(0),
            cond: Condvar::new(),
        });
        pollers.push(shared.clone());

        Ok(OutputStreamPoller {
            core: core.clone(),
            shared,
        })
    }

    /// Blocks until every scheduler queue is idle. Only valid on graphs
    /// without source nodes; runs application thread tasks while waiting.
    pub fn wait_until_idle(&self) -> GraphResult {
        let core = self.core()?;
        if core.validated.has_sources {
            return Err(GraphError::FailedPrecondition(
                "wait_until_idle is not reliable on graphs with source nodes".into(),
            ));
        }
        core.scheduler.wait_until_idle()
    }

    /// Blocks until the run terminates and returns its combined status.
    pub fn wait_until_done(&self) -> GraphResult {
        let core = self.core()?;
        core.scheduler.wait_until_done()?;
        core.finish_run()
    }

    /// Blocks until an observed output stream emitted a packet since the
    /// previous call; `OutOfRange` once the graph has terminated.
    pub fn wait_for_observed_output(&self) -> GraphResult {
        let core = self.core()?;
        core.scheduler.wait_for_observed_output()
    }

    /// True as soon as any error has been recorded.
    pub fn has_error(&self) -> bool {
        self.core.as_ref().map(|c| c.has_error()).unwrap_or(false)
    }

    /// The single stable representation of everything recorded so far.
    pub fn get_combined_errors(&self) -> Option<GraphError> {
        self.core.as_ref().and_then(|c| c.combined_error())
    }

    /// Returns a generated or calculator-produced side packet. Available
    /// once the graph is done, or while it is idle and the packet exists.
    pub fn get_output_side_packet(&self, name: &str) -> GraphResult<Packet> {
        let core = self.core()?;
        if !core.scheduler.is_terminated() && !core.scheduler.is_idle_now() {
            return Err(GraphError::FailedPrecondition(
                "output side packets are only available when the graph is done or idle".into(),
            ));
        }
        if let Some(packet) = core.run_output_side_packets.lock().get(name) {
            return Ok(packet.clone());
        }
        if let Some(packet) = core.current_run_side_packets.read().get(name) {
            return Ok(packet.clone());
        }
        // Base generator outputs are available even before the first run.
        if let Some(packet) = core.generator_graph.base_packets().get(name) {
            return Ok(packet.clone());
        }
        Err(GraphError::NotFound(format!(
            "no output side packet named '{name}'"
        )))
    }

    /// Aborts the run without waiting for in-flight work: a `Cancelled`
    /// error is recorded, queues drain, and `wait_until_done` returns
    /// `Cancelled`.
    pub fn cancel(&self) {
        let Some(core) = &self.core else { return };
        if matches!(
            core.scheduler.state(),
            SchedulerState::Running | SchedulerState::Paused
        ) {
            core.record_error(GraphError::Cancelled);
            core.scheduler.cancel(core);
        }
    }

    /// Pauses scheduling; in-flight tasks still complete.
    pub fn pause(&self) {
        if let Some(core) = &self.core {
            core.scheduler.pause();
        }
    }

    /// Resumes a paused graph.
    pub fn resume(&self) {
        if let Some(core) = &self.core {
            core.scheduler.resume(core);
        }
    }

    /// Closes every input stream and waits for the run to finish.
    pub fn close(&self) -> GraphResult {
        self.close_all_input_streams()?;
        self.wait_until_done()
    }

    /// Scheduler overhead measures of the last finished run. Meant for
    /// diagnostics and tests.
    pub fn get_scheduler_times(&self) -> GraphResult<SchedulerTimes> {
        Ok(self.core()?.scheduler.scheduler_times())
    }
}

impl Drop for Graph {
    fn drop(&mut self) {
        // Mirror wait_until_done if the application forgot: queues must be
        // drained before the core can go away.
        if let Some(core) = &self.core {
            let started = {
                let lifecycle = core.run_lifecycle.lock();
                lifecycle.started && !lifecycle.finished
            };
            if started {
                self.cancel();
                let _ = self.wait_until_done();
            }
        }
    }
}

/// Synchronous polling access to one output stream.
///
/// The poller owns a bounded queue: if it is not drained fast enough the
/// sources feeding it are throttled, exactly as for a slow calculator.
pub struct OutputStreamPoller {
    core: Arc<GraphCore>,
    shared: Arc<PollerShared>,
}

impl OutputStreamPoller {
    /// Blocks for the next packet; `None` once the stream is closed and
    /// drained.
    pub fn next(&mut self) -> Option<Packet> {
        let entry = self.core.input_entry(self.shared.input_stream_index);
        loop {
            let version = *self.shared.version.lock();
            let (packet, events) = entry.manager.pop_front();
            if let Some(packet) = packet {
                self.core
                    .handle_queue_events(self.shared.input_stream_index, events);
                return Some(packet);
            }
            if entry.manager.is_done() {
                return None;
            }
            let mut guard = self.shared.version.lock();
            while *guard == version {
                self.shared.cond.wait(&mut guard);
            }
        }
    }

    /// Overrides the maximum queue size of the poller's own queue.
    pub fn set_max_queue_size(&mut self, max_queue_size: i32) {
        let events = self
            .core
            .input_entry(self.shared.input_stream_index)
            .manager
            .set_max_queue_size(max_queue_size);
        self.core
            .handle_queue_events(self.shared.input_stream_index, events);
    }

    pub fn queue_size(&self) -> usize {
        self.core
            .input_entry(self.shared.input_stream_index)
            .manager
            .queue_size()
    }
}
