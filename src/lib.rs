//! Flowgraph is a dataflow graph execution framework: a directed graph of
//! calculator nodes connected by typed streams of timestamped packets,
//! driven by a multi-threaded scheduler.
//!
//! A graph is described by a [`GraphConfig`](config::GraphConfig) naming the
//! calculators and wiring their streams, validated once, and then run any
//! number of times. During a run, packets pushed into the graph input
//! streams flow through the nodes in timestamp order; queue back-pressure
//! throttles the packet sources, and the scheduler resolves the resulting
//! deadlocks, detects idleness and coordinates shutdown.
//!
//! ```no_run
//! use flowgraph::prelude::*;
//!
//! # struct Doubler;
//! # impl Calculator for Doubler {
//! #     fn process(&mut self, cc: &mut CalculatorContext) -> GraphResult<Continuation> {
//! #         let v = *cc.input(0).get::<i32>()?;
//! #         let ts = cc.input_timestamp();
//! #         cc.output(0).add(v * 2, ts)?;
//! #         Ok(Continuation::Continue)
//! #     }
//! # }
//! # fn main() -> GraphResult {
//! register_calculator("Doubler", || Box::new(Doubler));
//!
//! let config = GraphConfig::default()
//!     .input_stream("in")
//!     .node(NodeConfig::new("Doubler").input("in").output("out"));
//!
//! let mut graph = Graph::new();
//! graph.initialize(config, SidePacketSet::new())?;
//! let mut poller = graph.add_output_stream_poller("out")?;
//! graph.start_run(SidePacketSet::new())?;
//! for i in 0..10 {
//!     graph.add_packet_to_input_stream("in", Packet::new(i).at(Timestamp::new(i as i64)))?;
//! }
//! graph.close_all_input_streams()?;
//! while let Some(packet) = poller.next() {
//!     println!("{} -> {}", packet.timestamp(), packet.get::<i32>()?);
//! }
//! graph.wait_until_done()
//! # }
//! ```

#[macro_use]
extern crate log;

pub mod calculator;
pub mod config;
pub mod error;
pub mod executor;
pub mod graph;
pub mod packet;
pub mod registry;
pub mod side_packet;
pub mod stream;
pub mod timestamp;

mod node;
mod scheduler;
mod validated;

pub use calculator::{Calculator, CalculatorContext, Continuation, Contract, InputSet};
pub use error::{GraphError, GraphResult};
pub use graph::{Graph, GraphInputStreamAddMode, OutputStreamPoller};
pub use packet::Packet;
pub use registry::{register_calculator, register_generator, register_input_stream_handler};
pub use scheduler::SchedulerTimes;
pub use side_packet::{PacketGenerator, SidePacketSet};
pub use timestamp::Timestamp;

/// The most commonly used types, in one import.
pub mod prelude {
    pub use crate::calculator::{Calculator, CalculatorContext, Continuation, Contract};
    pub use crate::config::{
        ExecutorConfig, GeneratorConfig, GraphConfig, HandlerConfig, NodeConfig,
    };
    pub use crate::error::{GraphError, GraphResult};
    pub use crate::executor::{Executor, ThreadPoolExecutor};
    pub use crate::graph::{Graph, GraphInputStreamAddMode, OutputStreamPoller};
    pub use crate::packet::Packet;
    pub use crate::registry::{register_calculator, register_generator};
    pub use crate::side_packet::{PacketGenerator, SidePacketSet};
    pub use crate::timestamp::Timestamp;
}
