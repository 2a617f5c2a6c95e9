//! End-to-end graph runs through the scheduler.

use std::sync::Arc;

use parking_lot::Mutex;

use braid_rt::fsm::TaskState;
use braid_rt::mover::{Mover, Order};
use braid_rt::nodes::{connect, handle, ConsumerNode, FunctionNode, ProducerNode};
use braid_rt::scheduler::Scheduler;

type Triple = (u64, u64, u64);

/// A producer that walks through `values` and then ends the stream.
fn producer_from_vec(
    values: Vec<u64>,
    mover: &Arc<Mover<u64>>,
) -> Arc<ProducerNode<u64, impl FnMut() -> Option<u64> + Send>> {
    let mut iter = values.into_iter();
    ProducerNode::new(Arc::clone(mover), move || iter.next())
}

fn collecting_consumer(
    mover: &Arc<Mover<u64>>,
) -> (
    Arc<ConsumerNode<u64, impl FnMut(u64) + Send>>,
    Arc<Mutex<Vec<u64>>>,
) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let consumer = ConsumerNode::new(Arc::clone(mover), move |item| {
        sink.lock().push(item);
    });
    (consumer, seen)
}

#[test]
fn test_round_trip_in_order() {
    let count = 100u64;
    let mover = Arc::new(Mover::new(1));
    let producer = producer_from_vec((0..count).collect(), &mover);
    let (consumer, seen) = collecting_consumer(&mover);

    let p = handle(&producer);
    let c = handle(&consumer);
    connect(&p, &c);

    let sched = Scheduler::new(2).unwrap();
    sched.submit(p);
    sched.submit(c);
    sched.sync_wait_all();

    assert_eq!(*seen.lock(), (0..count).collect::<Vec<u64>>());
    assert_eq!(consumer.consumed(), count);
}

#[test]
fn test_channel_stress_fifo_preserves_order() {
    let count = 517u64;
    let mover = Arc::new(Mover::new(2));
    let producer = producer_from_vec((0..count).collect(), &mover);
    let (consumer, seen) = collecting_consumer(&mover);

    let p = handle(&producer);
    let c = handle(&consumer);
    connect(&p, &c);

    let sched = Scheduler::new(2).unwrap();
    sched.submit(p);
    sched.submit(c);
    sched.sync_wait_all();

    let seen = seen.lock();
    assert_eq!(*seen, (0..count).collect::<Vec<u64>>());
}

#[test]
fn test_channel_stress_lifo_delivers_every_item_once() {
    let count = 517u64;
    let mover = Arc::new(Mover::with_order(2, Order::Lifo));
    let producer = producer_from_vec((0..count).collect(), &mover);
    let (consumer, seen) = collecting_consumer(&mover);

    let p = handle(&producer);
    let c = handle(&consumer);
    connect(&p, &c);

    let sched = Scheduler::new(2).unwrap();
    sched.submit(p);
    sched.submit(c);
    sched.sync_wait_all();

    let mut seen = seen.lock().clone();
    assert_eq!(seen.len(), count as usize);
    seen.sort_unstable();
    assert_eq!(seen, (0..count).collect::<Vec<u64>>());
}

#[test]
fn test_triple_maker_pipeline() {
    let rounds = 337u64;
    // The classic sequence: consecutive integers starting at 19.
    let input: Vec<u64> = (0..rounds * 3).map(|i| i + 19).collect();
    let expected: Vec<Triple> = input
        .chunks(3)
        .map(|chunk| (chunk[0], chunk[1], chunk[2]))
        .collect();

    let source_edge = Arc::new(Mover::new(2));
    let sink_edge: Arc<Mover<Triple>> = Arc::new(Mover::new(2));

    let source = producer_from_vec(input, &source_edge);
    let maker = FunctionNode::new(
        Arc::clone(&source_edge),
        Arc::clone(&sink_edge),
        3,
        |batch: Vec<u64>| (batch[0], batch[1], batch[2]),
    );
    let collected: Arc<Mutex<Vec<Triple>>> = Arc::new(Mutex::new(Vec::new()));
    let sink_store = Arc::clone(&collected);
    let sink = ConsumerNode::new(Arc::clone(&sink_edge), move |triple| {
        sink_store.lock().push(triple);
    });

    let s = handle(&source);
    let m = handle(&maker);
    let k = handle(&sink);
    connect(&s, &m);
    connect(&m, &k);
    maker.set_upstream(&s);
    maker.set_downstream(&k);

    let sched = Scheduler::new(3).unwrap();
    sched.submit(s.clone());
    sched.submit(m.clone());
    sched.submit(k.clone());
    sched.sync_wait_all();

    assert_eq!(source.produced(), rounds * 3);
    assert_eq!(maker.processed(), rounds);
    assert_eq!(sink.consumed(), rounds);
    assert_eq!(*collected.lock(), expected);

    for node in [&s, &m, &k] {
        assert_eq!(node.state(), TaskState::Terminated);
    }
}

#[test]
fn test_triple_maker_single_worker() {
    let rounds = 11u64;
    let input: Vec<u64> = (0..rounds * 3).collect();

    let source_edge = Arc::new(Mover::new(1));
    let sink_edge: Arc<Mover<Triple>> = Arc::new(Mover::new(1));

    let source = producer_from_vec(input.clone(), &source_edge);
    let maker = FunctionNode::new(
        Arc::clone(&source_edge),
        Arc::clone(&sink_edge),
        3,
        |batch: Vec<u64>| (batch[0], batch[1], batch[2]),
    );
    let collected: Arc<Mutex<Vec<Triple>>> = Arc::new(Mutex::new(Vec::new()));
    let sink_store = Arc::clone(&collected);
    let sink = ConsumerNode::new(Arc::clone(&sink_edge), move |triple| {
        sink_store.lock().push(triple);
    });

    let s = handle(&source);
    let m = handle(&maker);
    let k = handle(&sink);
    connect(&s, &m);
    connect(&m, &k);
    maker.set_upstream(&s);
    maker.set_downstream(&k);

    let sched = Scheduler::new(1).unwrap();
    sched.submit(s);
    sched.submit(m);
    sched.submit(k);
    sched.sync_wait_all();

    let expected: Vec<Triple> = input
        .chunks(3)
        .map(|chunk| (chunk[0], chunk[1], chunk[2]))
        .collect();
    assert_eq!(*collected.lock(), expected);
}

#[test]
fn test_conservation_across_a_run() {
    let count = 250u64;
    let mover = Arc::new(Mover::new(2));
    let producer = producer_from_vec((0..count).collect(), &mover);
    let (consumer, _seen) = collecting_consumer(&mover);

    let p = handle(&producer);
    let c = handle(&consumer);
    connect(&p, &c);

    let sched = Scheduler::new(2).unwrap();
    sched.submit(p);
    sched.submit(c);
    sched.sync_wait_all();

    // Everything pushed was popped; nothing is left in flight.
    assert_eq!(mover.pushes(), count);
    assert_eq!(mover.pops(), count);
    assert_eq!(mover.in_flight(), 0);
}

#[test]
fn test_graph_terminates_with_wider_edges() {
    // Capacity 2 lets the producer run ahead; the run must still settle
    // with both nodes terminated and the full sequence delivered.
    let count = 64u64;
    let mover = Arc::new(Mover::new(2));
    let producer = producer_from_vec((0..count).collect(), &mover);
    let (consumer, seen) = collecting_consumer(&mover);

    let p = handle(&producer);
    let c = handle(&consumer);
    connect(&p, &c);

    let sched = Scheduler::new(4).unwrap();
    sched.submit(p.clone());
    sched.submit(c.clone());
    sched.sync_wait_all();

    assert_eq!(*seen.lock(), (0..count).collect::<Vec<u64>>());
    assert_eq!(p.state(), TaskState::Terminated);
    assert_eq!(c.state(), TaskState::Terminated);
}
