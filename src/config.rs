//! Configuration types used to describe a graph before it is validated.
//!
//! A [`GraphConfig`] is a plain data description of the nodes, streams, side
//! packet generators and executors of a graph. It is validated into a
//! read-only artifact by [`Graph::initialize`](crate::Graph::initialize);
//! nothing in this module performs any wiring by itself.

use serde::{Deserialize, Serialize};

/// The description of a whole graph.
///
/// ```
/// # use flowgraph::config::{GraphConfig, NodeConfig};
/// let config = GraphConfig::default()
///     .input_stream("in")
///     .node(
///         NodeConfig::new("PassThroughCalculator")
///             .input("in")
///             .output("out"),
///     );
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Streams fed from outside the graph.
    pub input_streams: Vec<String>,
    /// The calculator nodes, in declaration order. Validation re-orders them
    /// topologically and assigns the final node ids.
    pub nodes: Vec<NodeConfig>,
    /// Side packet generators run before the calculators.
    pub generators: Vec<GeneratorConfig>,
    /// Additional executors beyond the default one.
    pub executors: Vec<ExecutorConfig>,
    /// Number of worker threads of the default executor. `0` runs every node
    /// on the application thread that drives the graph.
    pub num_threads: usize,
    /// Default maximum queue size for input streams, used for throttling.
    /// `-1` means unbounded.
    pub max_queue_size: i32,
    /// Graph-wide default input stream handler, applied to every node that
    /// does not choose its own.
    pub input_stream_handler: Option<HandlerConfig>,
}

impl Default for GraphConfig {
    fn default() -> Self {
        let num_threads = std::thread::available_parallelism()
            .map(|q| q.get())
            .unwrap_or(4);
        GraphConfig {
            input_streams: Default::default(),
            nodes: Default::default(),
            generators: Default::default(),
            executors: Default::default(),
            num_threads,
            max_queue_size: 100,
            input_stream_handler: None,
        }
    }
}

impl GraphConfig {
    pub fn input_stream(mut self, name: impl Into<String>) -> Self {
        self.input_streams.push(name.into());
        self
    }

    pub fn node(mut self, node: NodeConfig) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn generator(mut self, generator: GeneratorConfig) -> Self {
        self.generators.push(generator);
        self
    }

    pub fn executor(mut self, executor: ExecutorConfig) -> Self {
        self.executors.push(executor);
        self
    }

    pub fn num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    pub fn max_queue_size(mut self, max_queue_size: i32) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    pub fn default_handler(mut self, handler: HandlerConfig) -> Self {
        self.input_stream_handler = Some(handler);
        self
    }
}

/// The description of a single calculator node.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Registry name of the calculator to instantiate.
    pub calculator: String,
    /// Optional display name; defaults to the calculator name.
    pub name: String,
    /// Input stream names, in the order seen by the calculator.
    pub input_streams: Vec<String>,
    /// Names (among `input_streams`) that close a cycle. Back edges are
    /// ignored by the topological sort and by the throttling bookkeeping.
    pub back_edge_inputs: Vec<String>,
    /// Output stream names, in the order seen by the calculator.
    pub output_streams: Vec<String>,
    /// Side packets read by the calculator, resolved by name at run start.
    pub input_side_packets: Vec<String>,
    /// Side packets the calculator may produce during the run.
    pub output_side_packets: Vec<String>,
    /// Input stream handler choice; `None` uses the graph default.
    pub input_stream_handler: Option<HandlerConfig>,
    /// Executor name; empty selects the default executor.
    pub executor: String,
    /// Activation layer for source nodes. Sources of a higher layer are not
    /// started until every source of a lower layer has closed.
    pub source_layer: i32,
    /// Free-form calculator options.
    pub options: serde_json::Value,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            calculator: String::new(),
            name: String::new(),
            input_streams: Default::default(),
            back_edge_inputs: Default::default(),
            output_streams: Default::default(),
            input_side_packets: Default::default(),
            output_side_packets: Default::default(),
            input_stream_handler: None,
            executor: String::new(),
            source_layer: 0,
            options: serde_json::Value::Null,
        }
    }
}

impl NodeConfig {
    pub fn new(calculator: impl Into<String>) -> Self {
        NodeConfig {
            calculator: calculator.into(),
            ..Default::default()
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn input(mut self, name: impl Into<String>) -> Self {
        self.input_streams.push(name.into());
        self
    }

    /// Declares an input stream that closes a cycle.
    pub fn back_edge_input(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.input_streams.push(name.clone());
        self.back_edge_inputs.push(name);
        self
    }

    pub fn output(mut self, name: impl Into<String>) -> Self {
        self.output_streams.push(name.into());
        self
    }

    pub fn side_input(mut self, name: impl Into<String>) -> Self {
        self.input_side_packets.push(name.into());
        self
    }

    pub fn side_output(mut self, name: impl Into<String>) -> Self {
        self.output_side_packets.push(name.into());
        self
    }

    pub fn handler(mut self, handler: HandlerConfig) -> Self {
        self.input_stream_handler = Some(handler);
        self
    }

    pub fn executor(mut self, name: impl Into<String>) -> Self {
        self.executor = name.into();
        self
    }

    pub fn source_layer(mut self, layer: i32) -> Self {
        self.source_layer = layer;
        self
    }

    pub fn options(mut self, options: serde_json::Value) -> Self {
        self.options = options;
        self
    }
}

/// Selection of an input stream handler together with its options.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HandlerConfig {
    /// Registry name, e.g. `"ImmediateInputStreamHandler"`.
    pub handler: String,
    /// Handler specific options, e.g. `{"target_queue_size": 2}`.
    #[serde(default)]
    pub options: serde_json::Value,
}

impl HandlerConfig {
    pub fn new(handler: impl Into<String>) -> Self {
        HandlerConfig {
            handler: handler.into(),
            options: serde_json::Value::Null,
        }
    }

    pub fn options(mut self, options: serde_json::Value) -> Self {
        self.options = options;
        self
    }
}

/// Declaration of a named executor.
///
/// With an `executor_type` the graph constructs the executor itself;
/// without one the caller must provide an implementation through
/// [`Graph::set_executor`](crate::Graph::set_executor) before initializing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub name: String,
    pub executor_type: Option<String>,
    pub num_threads: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            name: String::new(),
            executor_type: None,
            num_threads: 1,
        }
    }
}

impl ExecutorConfig {
    pub fn new(name: impl Into<String>) -> Self {
        ExecutorConfig {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn thread_pool(mut self, num_threads: usize) -> Self {
        self.executor_type = Some("threadpool".into());
        self.num_threads = num_threads;
        self
    }
}

/// Declaration of a packet generator.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Registry name of the generator.
    pub generator: String,
    /// Side packets consumed, resolved before the generator may run.
    pub input_side_packets: Vec<String>,
    /// Side packets produced, one per returned packet, in order.
    pub output_side_packets: Vec<String>,
    /// Free-form generator options.
    pub options: serde_json::Value,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        GeneratorConfig {
            generator: String::new(),
            input_side_packets: Default::default(),
            output_side_packets: Default::default(),
            options: serde_json::Value::Null,
        }
    }
}

impl GeneratorConfig {
    pub fn new(generator: impl Into<String>) -> Self {
        GeneratorConfig {
            generator: generator.into(),
            ..Default::default()
        }
    }

    pub fn side_input(mut self, name: impl Into<String>) -> Self {
        self.input_side_packets.push(name.into());
        self
    }

    pub fn side_output(mut self, name: impl Into<String>) -> Self {
        self.output_side_packets.push(name.into());
        self
    }

    pub fn options(mut self, options: serde_json::Value) -> Self {
        self.options = options;
        self
    }
}
