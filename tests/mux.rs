mod common;

use common::{collect_stream, setup, Collector};
use flowgraph::prelude::*;

const INPUTS: [(i32, i32); 10] = [
    (1, 0),
    (2, 1),
    (3, 0),
    (4, 0),
    (5, 1),
    (6, 0),
    (7, 1),
    (8, 1),
    (9, 1),
    (10, 0),
];
const EXPECTED: [i32; 10] = [2, 4, 6, 8, 25, 12, 49, 64, 81, 20];

fn feed(graph: &Graph) {
    for (ts, (value, select)) in INPUTS.iter().enumerate() {
        graph
            .add_packet_to_input_stream("in", Packet::new(*value).at(Timestamp::new(ts as i64)))
            .unwrap();
        graph
            .add_packet_to_input_stream(
                "select",
                Packet::new(*select).at(Timestamp::new(ts as i64)),
            )
            .unwrap();
    }
    graph.close_all_input_streams().unwrap();
}

/// Demux routes each packet to the doubler (select 0) or the squarer
/// (select 1); the mux reunites the branches using the same selections.
#[test]
fn demux_then_mux_selects_the_right_branch() {
    setup();
    let config = GraphConfig::default()
        .input_stream("in")
        .input_stream("select")
        .node(
            NodeConfig::new("DemuxCalculator")
                .input("in")
                .input("select")
                .output("demux0")
                .output("demux1"),
        )
        .node(NodeConfig::new("DoublerCalculator").input("demux0").output("doubled"))
        .node(NodeConfig::new("SquareCalculator").input("demux1").output("squared"))
        .node(
            NodeConfig::new("MuxCalculator")
                .input("select")
                .input("doubled")
                .input("squared")
                .output("out"),
        );
    let mut graph = Graph::new();
    graph.initialize(config, SidePacketSet::new()).unwrap();
    let outputs: Collector<(i64, i32)> = Collector::new();
    collect_stream(&graph, "out", &outputs);

    graph.start_run(SidePacketSet::new()).unwrap();
    feed(&graph);
    graph.wait_until_done().unwrap();

    let expected: Vec<(i64, i32)> = EXPECTED
        .iter()
        .enumerate()
        .map(|(ts, v)| (ts as i64, *v))
        .collect();
    assert_eq!(outputs.items(), expected);
}

/// Same pipeline, with the mux node driven by `MuxInputStreamHandler`: the
/// control stream is its last input and the unselected data streams are
/// consumed by the handler itself.
#[test]
fn mux_input_stream_handler_variant() {
    setup();
    let config = GraphConfig::default()
        .input_stream("in")
        .input_stream("select")
        .node(
            NodeConfig::new("DemuxCalculator")
                .input("in")
                .input("select")
                .output("demux0")
                .output("demux1"),
        )
        .node(NodeConfig::new("DoublerCalculator").input("demux0").output("doubled"))
        .node(NodeConfig::new("SquareCalculator").input("demux1").output("squared"))
        .node(
            NodeConfig::new("MuxByHandlerCalculator")
                .input("doubled")
                .input("squared")
                .input("select")
                .output("out")
                .handler(HandlerConfig::new("MuxInputStreamHandler")),
        );
    let mut graph = Graph::new();
    graph.initialize(config, SidePacketSet::new()).unwrap();
    let outputs: Collector<(i64, i32)> = Collector::new();
    collect_stream(&graph, "out", &outputs);

    graph.start_run(SidePacketSet::new()).unwrap();
    feed(&graph);
    graph.wait_until_done().unwrap();

    let values: Vec<i32> = outputs.items().iter().map(|(_, v)| *v).collect();
    assert_eq!(values, EXPECTED);
}
