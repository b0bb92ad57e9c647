//! Validation of a [`GraphConfig`] into the read-only artifact the runtime
//! consumes: topologically sorted nodes with dense ids, a wired stream
//! table, and the per-stream set of upstream packet sources used by the
//! throttling bookkeeping.

use std::collections::{HashMap, VecDeque};

use crate::config::{GraphConfig, NodeConfig};
use crate::error::{GraphError, GraphResult};

/// Who produces a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StreamProducer {
    /// Output `output_index` of node `node_id`.
    Node { node_id: usize, output_index: usize },
    /// The graph input stream at this index.
    GraphInput(usize),
}

/// One logical stream: a producer plus the throttling data derived from it.
#[derive(Debug)]
pub(crate) struct StreamInfo {
    pub name: String,
    pub producer: StreamProducer,
    /// Ids (node ids or virtual graph-input ids) of every packet source
    /// that can affect this stream, computed ignoring back edges. Filling
    /// a queue on this stream throttles exactly these sources.
    pub upstream_sources: Vec<usize>,
}

/// One (stream, consuming node input) edge.
#[derive(Clone, Copy, Debug)]
pub(crate) struct InputEdge {
    pub stream_id: usize,
    pub node_id: usize,
    pub input_index: usize,
    pub back_edge: bool,
}

/// A node after validation, with its final id.
#[derive(Debug)]
pub(crate) struct ValidatedNode {
    pub config: NodeConfig,
    pub name: String,
    pub is_source: bool,
    /// Indices into [`ValidatedGraph::input_edges`], aligned with
    /// `config.input_streams`.
    pub input_edge_ids: Vec<usize>,
    /// Indices into [`ValidatedGraph::streams`], aligned with
    /// `config.output_streams`.
    pub output_stream_ids: Vec<usize>,
}

/// The canonicalized, topologically sorted description of a graph.
///
/// Node ids are positions in [`ValidatedGraph::nodes`]; graph input streams
/// get virtual ids right after the real ones so that the throttling map can
/// treat them uniformly.
#[derive(Debug)]
pub(crate) struct ValidatedGraph {
    pub nodes: Vec<ValidatedNode>,
    pub streams: Vec<StreamInfo>,
    pub input_edges: Vec<InputEdge>,
    pub graph_input_names: Vec<String>,
    pub has_sources: bool,
    pub max_queue_size: i32,
}

impl ValidatedGraph {
    /// The throttling id of a graph input stream.
    pub fn virtual_id(&self, graph_input_index: usize) -> usize {
        self.nodes.len() + graph_input_index
    }

    /// Number of entities tracked by the throttling map: nodes plus graph
    /// input streams.
    pub fn num_throttle_entities(&self) -> usize {
        self.nodes.len() + self.graph_input_names.len()
    }

    pub fn stream_id_by_name(&self, name: &str) -> Option<usize> {
        self.streams.iter().position(|s| s.name == name)
    }

    pub fn validate(config: GraphConfig) -> GraphResult<ValidatedGraph> {
        validate_executor_declarations(&config)?;

        // Map every stream name to its producer.
        let mut producer_by_name: HashMap<String, StreamProducer> = HashMap::new();
        for (k, name) in config.input_streams.iter().enumerate() {
            if producer_by_name
                .insert(name.clone(), StreamProducer::GraphInput(k))
                .is_some()
            {
                return Err(GraphError::InvalidArgument(format!(
                    "graph input stream '{name}' is declared twice"
                )));
            }
        }
        for (n, node) in config.nodes.iter().enumerate() {
            if node.calculator.is_empty() {
                return Err(GraphError::InvalidArgument(format!(
                    "node {n} does not name a calculator"
                )));
            }
            for (o, name) in node.output_streams.iter().enumerate() {
                let producer = StreamProducer::Node {
                    node_id: n,
                    output_index: o,
                };
                if producer_by_name.insert(name.clone(), producer).is_some() {
                    return Err(GraphError::InvalidArgument(format!(
                        "stream '{name}' has more than one producer"
                    )));
                }
            }
            for back_edge in &node.back_edge_inputs {
                if !node.input_streams.contains(back_edge) {
                    return Err(GraphError::InvalidArgument(format!(
                        "back edge '{back_edge}' is not an input of node {n}"
                    )));
                }
            }
        }
        for node in &config.nodes {
            for name in &node.input_streams {
                if !producer_by_name.contains_key(name) {
                    return Err(GraphError::InvalidArgument(format!(
                        "stream '{name}' is consumed but never produced"
                    )));
                }
            }
        }

        let order = topological_order(&config, &producer_by_name)?;

        // Build streams and edges against the final ids.
        let mut streams: Vec<StreamInfo> = Vec::new();
        let mut stream_id_by_name: HashMap<String, usize> = HashMap::new();
        for (k, name) in config.input_streams.iter().enumerate() {
            stream_id_by_name.insert(name.clone(), streams.len());
            streams.push(StreamInfo {
                name: name.clone(),
                producer: StreamProducer::GraphInput(k),
                upstream_sources: Vec::new(),
            });
        }

        let mut nodes: Vec<ValidatedNode> = Vec::with_capacity(order.len());
        for &old in &order {
            let node_config = config.nodes[old].clone();
            let node_id = nodes.len();
            let mut output_stream_ids = Vec::with_capacity(node_config.output_streams.len());
            for (o, name) in node_config.output_streams.iter().enumerate() {
                stream_id_by_name.insert(name.clone(), streams.len());
                output_stream_ids.push(streams.len());
                streams.push(StreamInfo {
                    name: name.clone(),
                    producer: StreamProducer::Node {
                        node_id,
                        output_index: o,
                    },
                    upstream_sources: Vec::new(),
                });
            }
            let name = if node_config.name.is_empty() {
                format!("{}#{node_id}", node_config.calculator)
            } else {
                node_config.name.clone()
            };
            nodes.push(ValidatedNode {
                is_source: node_config.input_streams.is_empty(),
                name,
                input_edge_ids: Vec::new(),
                output_stream_ids,
                config: node_config,
            });
        }

        // Consumer edges, in node id order.
        let mut input_edges: Vec<InputEdge> = Vec::new();
        for node_id in 0..nodes.len() {
            let node_config = nodes[node_id].config.clone();
            for (input_index, name) in node_config.input_streams.iter().enumerate() {
                let stream_id = stream_id_by_name[name];
                let edge_id = input_edges.len();
                input_edges.push(InputEdge {
                    stream_id,
                    node_id,
                    input_index,
                    back_edge: node_config.back_edge_inputs.contains(name),
                });
                nodes[node_id].input_edge_ids.push(edge_id);
            }
        }

        let has_sources = nodes.iter().any(|n| n.is_source);
        let mut validated = ValidatedGraph {
            nodes,
            streams,
            input_edges,
            graph_input_names: config.input_streams.clone(),
            has_sources,
            max_queue_size: config.max_queue_size,
        };
        validated.compute_upstream_sources();
        Ok(validated)
    }

    /// Fills `upstream_sources` for every stream, walking producers in
    /// topological order (back edges excluded, so the walk terminates).
    fn compute_upstream_sources(&mut self) {
        for stream_id in 0..self.streams.len() {
            let sources = match self.streams[stream_id].producer {
                StreamProducer::GraphInput(k) => vec![self.virtual_id(k)],
                StreamProducer::Node { node_id, .. } => {
                    if self.nodes[node_id].is_source {
                        vec![node_id]
                    } else {
                        let mut set = Vec::new();
                        for &edge_id in &self.nodes[node_id].input_edge_ids {
                            let edge = self.input_edges[edge_id];
                            if edge.back_edge {
                                continue;
                            }
                            // Streams are laid out so that a non-back-edge
                            // producer always precedes its consumers.
                            for &s in &self.streams[edge.stream_id].upstream_sources {
                                if !set.contains(&s) {
                                    set.push(s);
                                }
                            }
                        }
                        set
                    }
                }
            };
            self.streams[stream_id].upstream_sources = sources;
        }
    }
}

fn validate_executor_declarations(config: &GraphConfig) -> GraphResult {
    let mut seen = Vec::new();
    for executor in &config.executors {
        if executor.name.is_empty() {
            return Err(GraphError::InvalidArgument(
                "executor declarations must be named".into(),
            ));
        }
        if executor.name.starts_with("__") {
            return Err(GraphError::InvalidArgument(format!(
                "executor name '{}' is reserved",
                executor.name
            )));
        }
        if seen.contains(&executor.name.as_str()) {
            return Err(GraphError::AlreadyExists(format!(
                "executor '{}' is declared twice",
                executor.name
            )));
        }
        seen.push(executor.name.as_str());
    }
    for node in &config.nodes {
        if !node.executor.is_empty() && !seen.contains(&node.executor.as_str()) {
            return Err(GraphError::InvalidArgument(format!(
                "node '{}' uses undeclared executor '{}'",
                node.calculator, node.executor
            )));
        }
    }
    Ok(())
}

/// Kahn's algorithm over the non-back-edge dependencies, stable with respect
/// to the declaration order.
fn topological_order(
    config: &GraphConfig,
    producer_by_name: &HashMap<String, StreamProducer>,
) -> GraphResult<Vec<usize>> {
    let n = config.nodes.len();
    let mut in_degree = vec![0usize; n];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, node) in config.nodes.iter().enumerate() {
        for name in &node.input_streams {
            if node.back_edge_inputs.contains(name) {
                continue;
            }
            if let StreamProducer::Node { node_id, .. } = producer_by_name[name] {
                in_degree[i] += 1;
                dependents[node_id].push(i);
            }
        }
    }

    let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(i) = queue.pop_front() {
        order.push(i);
        for &d in &dependents[i] {
            in_degree[d] -= 1;
            if in_degree[d] == 0 {
                queue.push_back(d);
            }
        }
    }
    if order.len() != n {
        let stuck = (0..n)
            .find(|&i| in_degree[i] > 0)
            .map(|i| config.nodes[i].calculator.clone())
            .unwrap_or_default();
        return Err(GraphError::InvalidArgument(format!(
            "the graph contains a cycle without a declared back edge (near '{stuck}')"
        )));
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExecutorConfig, NodeConfig};

    #[test]
    fn nodes_are_sorted_topologically() {
        // Declared sink-first; validation must re-order.
        let config = GraphConfig::default()
            .input_stream("in")
            .node(NodeConfig::new("Sink").input("mid"))
            .node(NodeConfig::new("Transform").input("in").output("mid"));
        let v = ValidatedGraph::validate(config).unwrap();
        assert_eq!(v.nodes[0].config.calculator, "Transform");
        assert_eq!(v.nodes[1].config.calculator, "Sink");
        assert!(!v.has_sources);
    }

    #[test]
    fn cycle_without_back_edge_is_rejected() {
        let config = GraphConfig::default()
            .node(NodeConfig::new("A").input("b_out").output("a_out"))
            .node(NodeConfig::new("B").input("a_out").output("b_out"));
        let err = ValidatedGraph::validate(config).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn declared_back_edge_breaks_the_cycle() {
        let config = GraphConfig::default()
            .input_stream("in")
            .node(
                NodeConfig::new("Adder")
                    .input("in")
                    .back_edge_input("old_sum")
                    .output("sum"),
            )
            .node(NodeConfig::new("Delay").input("sum").output("old_sum"));
        let v = ValidatedGraph::validate(config).unwrap();
        assert_eq!(v.nodes[0].config.calculator, "Adder");
        let edge = v.input_edges[v.nodes[0].input_edge_ids[1]];
        assert!(edge.back_edge);
    }

    #[test]
    fn duplicate_producer_is_rejected() {
        let config = GraphConfig::default()
            .node(NodeConfig::new("A").output("out"))
            .node(NodeConfig::new("B").output("out"));
        assert!(ValidatedGraph::validate(config).is_err());
    }

    #[test]
    fn unproduced_stream_is_rejected() {
        let config = GraphConfig::default().node(NodeConfig::new("Sink").input("ghost"));
        let err = ValidatedGraph::validate(config).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn reserved_and_duplicate_executor_names() {
        let config = GraphConfig::default().executor(ExecutorConfig::new("__gpu"));
        assert!(ValidatedGraph::validate(config).is_err());

        let config = GraphConfig::default()
            .executor(ExecutorConfig::new("io").thread_pool(1))
            .executor(ExecutorConfig::new("io").thread_pool(2));
        assert!(matches!(
            ValidatedGraph::validate(config),
            Err(GraphError::AlreadyExists(_))
        ));
    }

    #[test]
    fn upstream_sources_follow_the_dataflow() {
        let config = GraphConfig::default()
            .input_stream("in")
            .node(NodeConfig::new("Source").output("src_out"))
            .node(
                NodeConfig::new("Merge")
                    .input("in")
                    .input("src_out")
                    .output("merged"),
            );
        let v = ValidatedGraph::validate(config).unwrap();
        let source_id = 0; // topologically first
        let merged = v.stream_id_by_name("merged").unwrap();
        let mut expected = vec![v.virtual_id(0), source_id];
        expected.sort_unstable();
        let mut actual = v.streams[merged].upstream_sources.clone();
        actual.sort_unstable();
        assert_eq!(actual, expected);
        assert!(v.has_sources);
    }
}
