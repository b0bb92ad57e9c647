//! The calculator trait and the per-invocation context handed to it.

use std::any::{Any, TypeId};
use std::sync::Arc;

use crate::error::{GraphError, GraphResult};
use crate::packet::Packet;
use crate::stream::output::OutputStreamShard;
use crate::timestamp::Timestamp;

/// Tells the framework whether a calculator wants to keep running.
///
/// `Stop` is deliberately not an error: a source returning `Stop` closes
/// itself, a regular node returning `Stop` asks the whole graph to shut its
/// packet sources down. Neither is ever surfaced to the caller of the graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Continuation {
    Continue,
    Stop,
}

/// A user-provided computation node.
///
/// The framework drives a calculator through at most one `open`, any number
/// of `process` invocations with strictly increasing input timestamps, and at
/// most one `close`. A node with no input streams is a source and is invoked
/// repeatedly until it returns [`Continuation::Stop`].
pub trait Calculator: Send + 'static {
    /// Declares the payload types of the inputs and outputs. Undeclared
    /// entries accept any type.
    fn contract(&self, _contract: &mut Contract) -> GraphResult {
        Ok(())
    }

    /// Called once before any `process`, with input headers and side packets
    /// available. Output headers and the timestamp offset may only be set
    /// here.
    fn open(&mut self, _cc: &mut CalculatorContext) -> GraphResult {
        Ok(())
    }

    /// Called with one input set per readiness event.
    fn process(&mut self, cc: &mut CalculatorContext) -> GraphResult<Continuation>;

    /// Called once when the node shuts down, gracefully or not. The reason is
    /// available through [`CalculatorContext::final_status`]. Not called if
    /// `open` failed.
    fn close(&mut self, _cc: &mut CalculatorContext) -> GraphResult {
        Ok(())
    }

    /// Relative ordering among source nodes of the same layer; lower values
    /// run first.
    fn source_process_order(&self) -> i64 {
        0
    }
}

/// A payload type expectation declared by a contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct TypeSpec {
    pub type_id: TypeId,
    pub type_name: &'static str,
}

impl TypeSpec {
    pub(crate) fn of<T: Any>() -> TypeSpec {
        TypeSpec {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
        }
    }
}

/// The declared shape of a calculator: one optional type per input and
/// output stream. Filled by [`Calculator::contract`] during initialization.
#[derive(Debug)]
pub struct Contract {
    pub(crate) inputs: Vec<Option<TypeSpec>>,
    pub(crate) outputs: Vec<Option<TypeSpec>>,
}

impl Contract {
    pub(crate) fn new(num_inputs: usize, num_outputs: usize) -> Contract {
        Contract {
            inputs: vec![None; num_inputs],
            outputs: vec![None; num_outputs],
        }
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    pub fn set_input_type<T: Any>(&mut self, index: usize) -> GraphResult {
        let slot = self.inputs.get_mut(index).ok_or_else(|| {
            GraphError::InvalidArgument(format!("contract has no input stream {index}"))
        })?;
        *slot = Some(TypeSpec::of::<T>());
        Ok(())
    }

    pub fn set_output_type<T: Any>(&mut self, index: usize) -> GraphResult {
        let slot = self.outputs.get_mut(index).ok_or_else(|| {
            GraphError::InvalidArgument(format!("contract has no output stream {index}"))
        })?;
        *slot = Some(TypeSpec::of::<T>());
        Ok(())
    }
}

/// The packets delivered to one `process` invocation, one slot per input
/// stream. Absent inputs hold an empty packet.
#[derive(Debug, Default)]
pub struct InputSet {
    pub(crate) packets: Vec<Packet>,
}

impl InputSet {
    pub(crate) fn empty(num_inputs: usize) -> InputSet {
        InputSet {
            packets: vec![Packet::empty(); num_inputs],
        }
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn get(&self, index: usize) -> &Packet {
        &self.packets[index]
    }
}

/// The lifecycle method a context is currently serving.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LifecyclePhase {
    Open,
    Process,
    Close,
}

/// Everything a calculator can see and touch during one lifecycle call.
///
/// A context is prepared by the framework: the input set is filled when the
/// node becomes ready, output shards collect emissions until the call
/// returns, and the whole batch is then propagated downstream atomically.
pub struct CalculatorContext {
    pub(crate) node_id: usize,
    pub(crate) node_name: Arc<str>,
    pub(crate) options: Arc<serde_json::Value>,
    pub(crate) side_packet_names: Arc<Vec<String>>,
    pub(crate) side_packets: Arc<Vec<Packet>>,
    pub(crate) output_side_names: Arc<Vec<String>>,
    pub(crate) input_headers: Vec<Option<Packet>>,
    pub(crate) inputs: InputSet,
    pub(crate) outputs: Vec<OutputStreamShard>,
    pub(crate) input_timestamp: Timestamp,
    pub(crate) phase: LifecyclePhase,
    pub(crate) offset: Option<i64>,
    pub(crate) staged_side_outputs: Vec<(String, Packet)>,
    pub(crate) final_status: Result<(), GraphError>,
}

impl CalculatorContext {
    /// The timestamp attributed to the current `process` invocation.
    pub fn input_timestamp(&self) -> Timestamp {
        self.input_timestamp
    }

    /// The id the validated graph assigned to this node.
    pub fn node_id(&self) -> usize {
        self.node_id
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn options(&self) -> &serde_json::Value {
        &self.options
    }

    pub fn inputs(&self) -> &InputSet {
        &self.inputs
    }

    /// The packet delivered on input stream `index`, empty if none.
    pub fn input(&self, index: usize) -> &Packet {
        self.inputs.get(index)
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    /// The shard collecting emissions for output stream `index`.
    pub fn output(&mut self, index: usize) -> &mut OutputStreamShard {
        &mut self.outputs[index]
    }

    /// The header of input stream `index`, if the producer set one.
    pub fn input_header(&self, index: usize) -> Option<&Packet> {
        self.input_headers.get(index).and_then(|h| h.as_ref())
    }

    /// The input side packet declared at position `index`.
    pub fn side_packet_index(&self, index: usize) -> &Packet {
        &self.side_packets[index]
    }

    /// Looks up an input side packet by name.
    pub fn side_packet(&self, name: &str) -> Option<&Packet> {
        self.side_packet_names
            .iter()
            .position(|n| n == name)
            .map(|i| &self.side_packets[i])
    }

    /// Declares a constant timestamp offset between inputs and outputs,
    /// letting the framework propagate timestamp bounds automatically.
    ///
    /// Only legal during `open`.
    pub fn set_offset(&mut self, offset: i64) -> GraphResult {
        if self.phase != LifecyclePhase::Open {
            return Err(GraphError::FailedPrecondition(format!(
                "node '{}' may only call set_offset during open",
                self.node_name
            )));
        }
        self.offset = Some(offset);
        Ok(())
    }

    /// Produces a declared output side packet. The packet becomes visible
    /// through [`Graph::get_output_side_packet`](crate::Graph::get_output_side_packet)
    /// once the call returns.
    pub fn set_output_side_packet(&mut self, name: &str, packet: Packet) -> GraphResult {
        if !self.output_side_names.iter().any(|n| n == name) {
            return Err(GraphError::NotFound(format!(
                "node '{}' does not declare output side packet '{name}'",
                self.node_name
            )));
        }
        if self.staged_side_outputs.iter().any(|(n, _)| n == name) {
            return Err(GraphError::AlreadyExists(format!(
                "output side packet '{name}' was already produced"
            )));
        }
        self.staged_side_outputs.push((name.to_string(), packet));
        Ok(())
    }

    /// The status the node is being closed with: `Ok` for graceful shutdown,
    /// the first recorded error or `Cancelled` otherwise. Meaningful only
    /// inside `close`.
    pub fn final_status(&self) -> &Result<(), GraphError> {
        &self.final_status
    }
}
