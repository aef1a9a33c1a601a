//! End-to-end pub/sub scenarios across the registry, dispatch engine, and
//! worker-pool task queue.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use riptide_bus::{Bus, InlineQueue, Scope, SecretKeys, SubscribeArgs, WorkerPool};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn wait_for(count: &Arc<AtomicUsize>, expected: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while count.load(Ordering::SeqCst) < expected {
        assert!(
            Instant::now() < deadline,
            "expected {expected} deliveries, saw {}",
            count.load(Ordering::SeqCst)
        );
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn exact_and_pattern_subscribers_share_one_publish() {
    let bus = Bus::new(Arc::new(InlineQueue), SecretKeys::from_passphrase("e2e"));

    let exact_hits = Arc::new(AtomicUsize::new(0));
    let pattern_hits = Arc::new(AtomicUsize::new(0));
    let exact_unsub = Arc::new(AtomicUsize::new(0));

    let h = Arc::clone(&exact_hits);
    let u = Arc::clone(&exact_unsub);
    bus.subscribe(
        SubscribeArgs::exact("pubsub_test_channel", -127, move |_, env| {
            assert_eq!(env.channel(), "pubsub_test_channel");
            h.fetch_add(1, Ordering::SeqCst);
        })
        .on_unsubscribe(move || {
            u.fetch_add(1, Ordering::SeqCst);
        }),
    )
    .unwrap()
    .detach();

    let h = Arc::clone(&pattern_hits);
    bus.subscribe(SubscribeArgs::pattern("pubsub_*", -127, move |_, _| {
        h.fetch_add(1, Ordering::SeqCst);
    }))
    .unwrap()
    .detach();

    // One publish reaches both the exact and the pattern subscriber.
    bus.publish("pubsub_test_channel", b"first", -127, Scope::Local)
        .unwrap();
    assert_eq!(exact_hits.load(Ordering::SeqCst), 1);
    assert_eq!(pattern_hits.load(Ordering::SeqCst), 1);

    // Remove the exact subscription; its on-unsubscribe fires exactly once.
    assert_eq!(bus.unsubscribe("pubsub_test_channel", -127, false), 1);
    assert_eq!(exact_unsub.load(Ordering::SeqCst), 1);

    // Second publish reaches only the pattern subscriber.
    bus.publish("pubsub_test_channel", b"second", -127, Scope::Local)
        .unwrap();
    assert_eq!(exact_hits.load(Ordering::SeqCst), 1);
    assert_eq!(pattern_hits.load(Ordering::SeqCst), 2);
}

#[test]
fn filter_mismatch_is_never_delivered() {
    let bus = Bus::new(Arc::new(InlineQueue), SecretKeys::from_passphrase("e2e"));
    let hits = Arc::new(AtomicUsize::new(0));

    let h = Arc::clone(&hits);
    bus.subscribe(SubscribeArgs::pattern("pubsub_*", -127, move |_, _| {
        h.fetch_add(1, Ordering::SeqCst);
    }))
    .unwrap()
    .detach();

    bus.publish("pubsub_test_channel", b"wrong universe", 0, Scope::Local)
        .unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[test]
fn concurrent_publishes_deliver_exactly_once_per_subscriber() {
    init_tracing();
    const PUBLISHERS: usize = 8;
    const PUBLISHES_EACH: usize = 25;
    const SUBSCRIBERS: usize = 3;

    let pool = Arc::new(WorkerPool::new(4).unwrap());
    let bus = Arc::new(Bus::new(pool, SecretKeys::from_passphrase("e2e")));

    let delivered = Arc::new(AtomicUsize::new(0));
    for _ in 0..SUBSCRIBERS {
        let d = Arc::clone(&delivered);
        bus.subscribe(SubscribeArgs::exact("load", 5, move |_, env| {
            assert_eq!(env.message(), b"payload");
            d.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap()
        .detach();
    }

    let publishers: Vec<_> = (0..PUBLISHERS)
        .map(|_| {
            let bus = Arc::clone(&bus);
            std::thread::spawn(move || {
                for _ in 0..PUBLISHES_EACH {
                    bus.publish("load", b"payload", 5, Scope::Local).unwrap();
                }
            })
        })
        .collect();
    for p in publishers {
        p.join().unwrap();
    }

    // Every matching publish reaches every subscriber exactly once.
    let expected = PUBLISHERS * PUBLISHES_EACH * SUBSCRIBERS;
    wait_for(&delivered, expected);
    assert_eq!(delivered.load(Ordering::SeqCst), expected);
    assert_eq!(bus.metrics().delivered(), expected as u64);
    assert_eq!(bus.metrics().skipped(), 0);
}

#[test]
fn single_subscriber_observes_its_deliveries_in_publish_order() {
    // One worker drains the queue FIFO, so one subscriber sees its own
    // deliveries in publish order even though publication is decoupled.
    let pool = Arc::new(WorkerPool::new(1).unwrap());
    let bus = Bus::new(pool, SecretKeys::from_passphrase("e2e"));

    let seen: Arc<parking_lot::Mutex<Vec<u64>>> = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let done = Arc::new(AtomicUsize::new(0));

    let s = Arc::clone(&seen);
    let d = Arc::clone(&done);
    bus.subscribe(SubscribeArgs::exact("ordered", 0, move |_, env| {
        s.lock().push(env.id());
        d.fetch_add(1, Ordering::SeqCst);
    }))
    .unwrap()
    .detach();

    for _ in 0..40 {
        bus.publish("ordered", b"tick", 0, Scope::Local).unwrap();
    }

    wait_for(&done, 40);
    let ids = seen.lock();
    assert_eq!(ids.len(), 40);
    assert!(ids.windows(2).all(|w| w[0] < w[1]), "ids must be ascending");
}

#[test]
fn teardown_notifies_every_remaining_subscription() {
    let unsubs = Arc::new(AtomicUsize::new(0));
    {
        let bus = Bus::new(Arc::new(InlineQueue), SecretKeys::from_passphrase("e2e"));
        for i in 0..5 {
            let u = Arc::clone(&unsubs);
            bus.subscribe(
                SubscribeArgs::exact(format!("c{i}"), 0, |_, _| {}).on_unsubscribe(move || {
                    u.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap()
            .detach();
        }
        bus.registry().teardown();
        assert_eq!(unsubs.load(Ordering::SeqCst), 5);
    }
    // Dropping the bus after teardown must not fire anything twice.
    assert_eq!(unsubs.load(Ordering::SeqCst), 5);
}
