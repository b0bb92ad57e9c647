//! Side packets and the one-shot DAG of packet generators.
//!
//! Side packets are values distributed to the whole graph, produced before
//! or at the start of a run and never mutated afterwards. Generators form a
//! dependency graph by name: a generator may run once every input side
//! packet it declares has been produced.

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::{Condvar, Mutex};

use crate::config::GeneratorConfig;
use crate::error::{GraphError, GraphResult};
use crate::executor::Executor;
use crate::packet::Packet;
use crate::registry;

/// An ordered name → packet map.
pub type SidePacketSet = IndexMap<String, Packet>;

/// A side packet producer, registered by name.
///
/// `inputs` holds the resolved input side packets in declaration order; the
/// returned vector must contain one packet per declared output side packet,
/// in declaration order.
pub trait PacketGenerator: Send + Sync + 'static {
    fn generate(&self, options: &serde_json::Value, inputs: &[Packet]) -> GraphResult<Vec<Packet>>;
}

/// Collects the results of one round of generator executions.
struct TaskCollector {
    state: Mutex<CollectorState>,
    cond: Condvar,
}

struct CollectorState {
    pending: usize,
    results: Vec<(usize, GraphResult<Vec<Packet>>)>,
}

impl TaskCollector {
    fn new(pending: usize) -> Arc<TaskCollector> {
        Arc::new(TaskCollector {
            state: Mutex::new(CollectorState {
                pending,
                results: Vec::new(),
            }),
            cond: Condvar::new(),
        })
    }

    fn push(&self, index: usize, result: GraphResult<Vec<Packet>>) {
        let mut state = self.state.lock();
        state.results.push((index, result));
        state.pending -= 1;
        if state.pending == 0 {
            self.cond.notify_all();
        }
    }

    /// Waits for every scheduled task, even after failures: a generator
    /// error must not leave tasks running behind our back.
    fn wait(&self) -> Vec<(usize, GraphResult<Vec<Packet>>)> {
        let mut state = self.state.lock();
        while state.pending > 0 {
            self.cond.wait(&mut state);
        }
        std::mem::take(&mut state.results)
    }
}

/// The two-phase graph of packet generators.
///
/// `initialize` runs every generator whose inputs are satisfied by the base
/// side packets and remembers the rest. Each `run_graph_setup` then runs the
/// remembered generators against the per-run side packets; at that point all
/// of them must be runnable.
pub(crate) struct PacketGeneratorGraph {
    generators: Vec<GeneratorConfig>,
    executor: Arc<dyn Executor>,
    base_packets: SidePacketSet,
    non_base_generators: Vec<usize>,
}

impl PacketGeneratorGraph {
    pub fn new(generators: Vec<GeneratorConfig>, executor: Arc<dyn Executor>) -> Self {
        PacketGeneratorGraph {
            generators,
            executor,
            base_packets: SidePacketSet::new(),
            non_base_generators: Vec::new(),
        }
    }

    /// Runs the base phase against `input_side_packets`. Generators that
    /// cannot run yet are remembered for the per-run phase.
    pub fn initialize(&mut self, input_side_packets: &SidePacketSet) -> GraphResult {
        let mut packets = input_side_packets.clone();
        let all: Vec<usize> = (0..self.generators.len()).collect();
        let leftover = self.execute_generators(&mut packets, all)?;
        debug!(
            "generator base phase produced {} side packets, {} generators deferred",
            packets.len(),
            leftover.len()
        );
        self.base_packets = packets;
        self.non_base_generators = leftover;
        Ok(())
    }

    /// The side packets produced during `initialize`, including the inputs.
    pub fn base_packets(&self) -> &SidePacketSet {
        &self.base_packets
    }

    /// Runs the remaining generators with the per-run side packets merged in
    /// and returns the complete side packet set for the run.
    pub fn run_graph_setup(&self, extra_side_packets: &SidePacketSet) -> GraphResult<SidePacketSet> {
        let mut packets = self.base_packets.clone();
        for (name, packet) in extra_side_packets {
            if packets.contains_key(name) {
                return Err(GraphError::AlreadyExists(format!(
                    "side packet '{name}' is supplied twice"
                )));
            }
            packets.insert(name.clone(), packet.clone());
        }
        let leftover = self.execute_generators(&mut packets, self.non_base_generators.clone())?;
        if !leftover.is_empty() {
            let missing: Vec<String> = leftover
                .iter()
                .map(|&i| {
                    let config = &self.generators[i];
                    let unmet: Vec<&str> = config
                        .input_side_packets
                        .iter()
                        .filter(|name| !packets.contains_key(*name))
                        .map(|s| s.as_str())
                        .collect();
                    format!("'{}' (missing {})", config.generator, unmet.join(", "))
                })
                .collect();
            return Err(GraphError::InvalidArgument(format!(
                "packet generators could not run: {}",
                missing.join("; ")
            )));
        }
        Ok(packets)
    }

    /// Repeatedly schedules every runnable generator in `candidates` until
    /// no more can run, merging their outputs into `packets`. Returns the
    /// generators that never became runnable.
    fn execute_generators(
        &self,
        packets: &mut SidePacketSet,
        mut candidates: Vec<usize>,
    ) -> GraphResult<Vec<usize>> {
        loop {
            let runnable: Vec<usize> = candidates
                .iter()
                .copied()
                .filter(|&i| {
                    self.generators[i]
                        .input_side_packets
                        .iter()
                        .all(|name| packets.contains_key(name))
                })
                .collect();
            if runnable.is_empty() {
                return Ok(candidates);
            }
            candidates.retain(|i| !runnable.contains(i));

            let collector = TaskCollector::new(runnable.len());
            for &index in &runnable {
                let config = self.generators[index].clone();
                let inputs: Vec<Packet> = config
                    .input_side_packets
                    .iter()
                    .map(|name| packets[name].clone())
                    .collect();
                let collector = collector.clone();
                self.executor.schedule(Box::new(move || {
                    let result = registry::generator(&config.generator)
                        .and_then(|generator| generator.generate(&config.options, &inputs));
                    collector.push(index, result);
                }));
            }

            let mut first_error = None;
            for (index, result) in collector.wait() {
                let config = &self.generators[index];
                match result {
                    Ok(outputs) => {
                        if outputs.len() != config.output_side_packets.len() {
                            first_error.get_or_insert(GraphError::InvalidArgument(format!(
                                "generator '{}' produced {} packets, {} declared",
                                config.generator,
                                outputs.len(),
                                config.output_side_packets.len()
                            )));
                            continue;
                        }
                        for (name, packet) in config.output_side_packets.iter().zip(outputs) {
                            if packets.insert(name.clone(), packet).is_some() {
                                first_error.get_or_insert(GraphError::AlreadyExists(format!(
                                    "side packet '{name}' was produced twice"
                                )));
                            }
                        }
                    }
                    Err(e) => {
                        warn!("generator '{}' failed: {e}", config.generator);
                        first_error.get_or_insert(e);
                    }
                }
            }
            if let Some(error) = first_error {
                return Err(error);
            }
        }
    }
}
