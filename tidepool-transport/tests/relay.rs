//! Integration tests for the dispatcher-driven transport.
//!
//! These tests exercise:
//! - Ordered delivery with and without back-pressure
//! - Closure reported exactly once for every cause
//! - Rebinding, including from inside the close handler
//! - Handlers that close or drop their own transport
//! - The async inbox adapter

use std::cell::RefCell;
use std::rc::Rc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tidepool_core::{
    ChannelConfig, ChannelError, ChannelFabric, ChannelHandle, Dispatcher, Frame,
};
use tidepool_transport::{CloseReason, Phase, Transport, TransportConfig};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn setup(config: ChannelConfig) -> (Dispatcher, ChannelFabric) {
    init_tracing();
    let dispatcher = Dispatcher::new();
    let fabric = ChannelFabric::new(&dispatcher, config);
    (dispatcher, fabric)
}

/// Record messages and closures in one log, in the order they happen.
fn record_events(transport: &Transport) -> Rc<RefCell<Vec<String>>> {
    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = events.clone();
    transport.set_message_handler(move |frame| {
        sink.borrow_mut()
            .push(format!("msg:{}", String::from_utf8_lossy(&frame.bytes)));
    });
    let sink = events.clone();
    transport.set_close_handler(move |reason| {
        sink.borrow_mut().push(format!("close:{reason}"));
    });
    events
}

fn read_all(channel: &ChannelHandle) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    while let Ok(Some(frame)) = channel.try_read() {
        frames.push(frame.bytes);
    }
    frames
}

#[test]
fn test_frames_queued_while_unbound_arrive_separately() {
    let (dispatcher, fabric) = setup(ChannelConfig::default());
    let (local, remote) = fabric.create().expect("create pair");
    let transport = Transport::new(&dispatcher);

    transport.enqueue(Frame::from_bytes("abc")).expect("enqueue");
    transport.enqueue(Frame::from_bytes("de")).expect("enqueue");
    assert_eq!(transport.phase(), Phase::Unbound);
    assert_eq!(fabric.pending_frames(remote.id()), 0);

    transport.set_channel(local).expect("bind");
    dispatcher.run_until_idle();

    assert_eq!(read_all(&remote), vec![b"abc".to_vec(), b"de".to_vec()]);
    assert_eq!(transport.queued_messages(), 0);
}

#[test]
fn test_fifo_under_random_back_pressure() {
    for seed in 0..16u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let capacity = rng.gen_range(1..4);
        let (dispatcher, fabric) =
            setup(ChannelConfig::default().with_max_pending_frames(capacity));
        let (local, remote) = fabric.create().expect("create pair");
        let transport = Transport::new(&dispatcher);
        transport.set_channel(local).expect("bind");

        let sent: Vec<Vec<u8>> = (0..64)
            .map(|i| {
                let len = rng.gen_range(0..32);
                let mut bytes = vec![i as u8];
                bytes.extend((0..len).map(|_| rng.r#gen::<u8>()));
                bytes
            })
            .collect();

        let mut received = Vec::new();
        for bytes in &sent {
            transport.enqueue(Frame::new(bytes.clone(), Vec::new())).expect("enqueue");
            if rng.gen_bool(0.3) {
                dispatcher.run_until_idle();
            }
            if rng.gen_bool(0.4)
                && let Ok(Some(frame)) = remote.try_read()
            {
                received.push(frame.bytes);
            }
        }
        while received.len() < sent.len() {
            dispatcher.run_until_idle();
            let batch = read_all(&remote);
            assert!(!batch.is_empty(), "seed {seed}: transport stalled");
            received.extend(batch);
        }

        assert_eq!(received, sent, "seed {seed}");
        assert!(!transport.is_closed());
    }
}

#[test]
fn test_back_pressure_requeues_and_flushes() {
    let (dispatcher, fabric) = setup(ChannelConfig::default().with_max_pending_frames(1));
    let (local, remote) = fabric.create().expect("create pair");
    let transport = Transport::new(&dispatcher);
    transport.set_channel(local).expect("bind");

    for payload in ["one", "two", "three"] {
        transport.enqueue(Frame::from_bytes(payload)).expect("enqueue");
    }
    assert_eq!(transport.queued_messages(), 2);
    assert!(transport.metrics().would_block_count >= 1);
    assert_eq!(transport.metrics().peak_queue_depth, 2);

    let mut received = Vec::new();
    for _ in 0..3 {
        dispatcher.run_until_idle();
        let frame = remote.try_read().expect("read").expect("frame");
        received.push(frame.bytes);
    }
    assert_eq!(received, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
    assert_eq!(transport.metrics().messages_sent, 3);
}

#[test]
fn test_peer_close_after_frames_delivers_everything_first() {
    let (dispatcher, fabric) = setup(ChannelConfig::default());
    let (local, mut remote) = fabric.create().expect("create pair");
    let transport = Transport::new(&dispatcher);
    let events = record_events(&transport);
    transport.set_channel(local).expect("bind");

    remote.try_write(Frame::from_bytes("x")).expect("write");
    remote.try_write(Frame::from_bytes("y")).expect("write");
    remote.close();
    dispatcher.run_until_idle();

    assert_eq!(
        *events.borrow(),
        vec!["msg:x", "msg:y", "close:peer closed"]
    );
    assert_eq!(transport.close_reason(), Some(CloseReason::PeerClosed));
    assert_eq!(transport.phase(), Phase::Closed);
}

#[test]
fn test_close_fires_exactly_once_per_cause() {
    let causes = ["explicit", "peer", "io", "drop"];
    for cause in causes {
        let (dispatcher, fabric) = setup(ChannelConfig::default());
        let (local, mut remote) = fabric.create().expect("create pair");
        let transport = Transport::new(&dispatcher);
        let closes = Rc::new(RefCell::new(Vec::new()));
        let sink = closes.clone();
        transport.set_close_handler(move |reason| sink.borrow_mut().push(reason));
        transport.set_channel(local).expect("bind");
        let endpoint = transport.endpoint_id().expect("bound");

        let mut transport = Some(transport);
        match cause {
            "explicit" => {
                if let Some(transport) = &transport {
                    transport.close();
                    transport.close();
                }
            }
            "peer" => remote.close(),
            "io" => {
                assert!(fabric.inject_io_error(endpoint, "disk on fire"));
            }
            _ => drop(transport.take()),
        }
        dispatcher.run_until_idle();
        // Every later event is a no-op.
        if let Some(transport) = &transport {
            transport.close();
        }
        remote.close();
        dispatcher.run_until_idle();
        drop(transport);
        dispatcher.run_until_idle();

        let closes = closes.borrow();
        assert_eq!(closes.len(), 1, "cause {cause}: {closes:?}");
        let expected = match cause {
            "explicit" => CloseReason::Requested,
            "peer" => CloseReason::PeerClosed,
            "io" => CloseReason::Io(ChannelError::Io("disk on fire".to_string())),
            _ => CloseReason::Dropped,
        };
        assert_eq!(closes[0], expected, "cause {cause}");
    }
}

#[test]
fn test_io_error_drops_queued_frames() {
    let (dispatcher, fabric) = setup(ChannelConfig::default().with_max_pending_frames(1));
    let (local, _remote) = fabric.create().expect("create pair");
    let transport = Transport::new(&dispatcher);
    let events = record_events(&transport);
    transport.set_channel(local).expect("bind");

    transport.enqueue(Frame::from_bytes("sent")).expect("enqueue");
    transport.enqueue(Frame::from_bytes("stuck")).expect("enqueue");
    let endpoint = transport.endpoint_id().expect("bound");
    fabric.inject_io_error(endpoint, "reset");
    dispatcher.run_until_idle();

    assert_eq!(events.borrow().len(), 1);
    assert!(events.borrow()[0].starts_with("close:I/O failure"));
    assert!(transport.close_reason().is_some_and(|reason| reason.is_error()));
    assert_eq!(transport.metrics().messages_dropped, 1);
    assert_eq!(transport.endpoint_id(), None);
}

#[test]
fn test_read_budget_yields_between_batches() {
    let (dispatcher, fabric) = setup(ChannelConfig::default());
    let (local, remote) = fabric.create().expect("create pair");
    let config = TransportConfig::default().with_max_reads_per_wakeup(2);
    let transport = Transport::with_config(&dispatcher, config);
    let events = record_events(&transport);

    for i in 0..5 {
        remote.try_write(Frame::from_bytes(format!("{i}"))).expect("write");
    }
    transport.set_channel(local).expect("bind");

    assert!(dispatcher.step());
    assert_eq!(events.borrow().len(), 2);
    dispatcher.run_until_idle();
    assert_eq!(
        *events.borrow(),
        vec!["msg:0", "msg:1", "msg:2", "msg:3", "msg:4"]
    );
}

#[test]
fn test_rebind_after_close() {
    let (dispatcher, fabric) = setup(ChannelConfig::default());
    let (first, _first_peer) = fabric.create().expect("create pair");
    let (second, second_peer) = fabric.create().expect("create pair");
    let transport = Transport::new(&dispatcher);
    let events = record_events(&transport);

    transport.set_channel(first).expect("bind");
    transport.close();
    assert!(transport.is_closed());

    transport.set_channel(second).expect("rebind");
    assert!(transport.is_bound());
    assert_eq!(transport.close_reason(), None);
    transport.enqueue(Frame::from_bytes("again")).expect("enqueue");
    dispatcher.run_until_idle();

    assert_eq!(read_all(&second_peer), vec![b"again".to_vec()]);
    assert_eq!(transport.metrics().binds, 2);
    assert_eq!(*events.borrow(), vec!["close:closed by owner"]);
}

#[test]
fn test_rebind_from_close_handler() {
    let (dispatcher, fabric) = setup(ChannelConfig::default());
    let (first, mut first_peer) = fabric.create().expect("create pair");
    let (spare, spare_peer) = fabric.create().expect("create pair");
    let transport = Rc::new(Transport::new(&dispatcher));
    let spare = Rc::new(RefCell::new(Some(spare)));
    let closes = Rc::new(RefCell::new(Vec::new()));

    let weak = Rc::downgrade(&transport);
    let sink = closes.clone();
    transport.set_close_handler(move |reason| {
        sink.borrow_mut().push(reason);
        let next = spare.borrow_mut().take();
        if let (Some(transport), Some(channel)) = (weak.upgrade(), next) {
            transport.set_channel(channel).expect("rebind from close handler");
        }
    });
    transport.set_channel(first).expect("bind");

    first_peer.close();
    dispatcher.run_until_idle();
    assert_eq!(transport.phase(), Phase::Bound);
    assert_eq!(*closes.borrow(), vec![CloseReason::PeerClosed]);

    transport.enqueue(Frame::from_bytes("moved")).expect("enqueue");
    dispatcher.run_until_idle();
    assert_eq!(read_all(&spare_peer), vec![b"moved".to_vec()]);

    transport.close();
    assert_eq!(
        *closes.borrow(),
        vec![CloseReason::PeerClosed, CloseReason::Requested]
    );
    assert_eq!(transport.phase(), Phase::Closed);
}

#[test]
fn test_handler_dropping_its_transport() {
    let (dispatcher, fabric) = setup(ChannelConfig::default());
    let (local, remote) = fabric.create().expect("create pair");
    let slot: Rc<RefCell<Option<Transport>>> = Rc::new(RefCell::new(None));
    let closes = Rc::new(RefCell::new(Vec::new()));
    let delivered = Rc::new(RefCell::new(0));

    let transport = Transport::new(&dispatcher);
    let sink = closes.clone();
    transport.set_close_handler(move |reason| sink.borrow_mut().push(reason));
    let owner = slot.clone();
    let counter = delivered.clone();
    transport.set_message_handler(move |_frame| {
        *counter.borrow_mut() += 1;
        let taken = owner.borrow_mut().take();
        drop(taken);
    });
    transport.set_channel(local).expect("bind");
    *slot.borrow_mut() = Some(transport);

    remote.try_write(Frame::from_bytes("first")).expect("write");
    remote.try_write(Frame::from_bytes("second")).expect("write");
    dispatcher.run_until_idle();

    assert_eq!(*delivered.borrow(), 1);
    assert_eq!(*closes.borrow(), vec![CloseReason::Dropped]);
    assert!(slot.borrow().is_none());
    assert!(matches!(remote.try_read(), Err(ChannelError::PeerClosed)));
    assert_eq!(dispatcher.pending_waits(), 0);
}

#[test]
fn test_close_cancels_latched_callbacks() {
    let (dispatcher, fabric) = setup(ChannelConfig::default());
    let (local, remote) = fabric.create().expect("create pair");
    let transport = Transport::new(&dispatcher);
    let events = record_events(&transport);
    transport.set_channel(local).expect("bind");

    remote.try_write(Frame::from_bytes("late")).expect("write");
    assert_eq!(dispatcher.ready_len(), 1);
    transport.close();
    dispatcher.run_until_idle();

    assert_eq!(*events.borrow(), vec!["close:closed by owner"]);
    assert_eq!(dispatcher.stats().waits_fired, 0);
}

#[tokio::test]
async fn test_inbox_receives_until_closed() {
    let (dispatcher, fabric) = setup(ChannelConfig::default());
    let (local, mut remote) = fabric.create().expect("create pair");
    let transport = Transport::new(&dispatcher);
    let mut inbox = transport.inbox();
    transport.set_channel(local).expect("bind");

    remote.try_write(Frame::from_bytes("hello")).expect("write");
    remote.try_write(Frame::from_bytes("world")).expect("write");
    remote.close();

    let consumer = async {
        let mut received = Vec::new();
        while let Some(frame) = inbox.recv().await {
            received.push(frame.bytes);
        }
        let reason = inbox.closed().await;
        dispatcher.shutdown();
        (received, reason)
    };
    let ((), (received, reason)) = tokio::join!(dispatcher.run(), consumer);

    assert_eq!(received, vec![b"hello".to_vec(), b"world".to_vec()]);
    assert_eq!(reason, Some(CloseReason::PeerClosed));
    assert_eq!(inbox.close_reason(), Some(CloseReason::PeerClosed));
}
