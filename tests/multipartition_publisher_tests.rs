//! Tests for partition discovery, routing and shutdown of the
//! multipartition publisher, using mock partition publishers.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use partlog::publisher::mock::{MockAdminConnection, MockPartitionPublisher};
use partlog::publisher::{
    AlarmRegistry, DefaultRoutingPolicy, LifecycleService, MultipartitionPublisher,
    PartitionPublisher, PublisherConfig,
};
use partlog::{Error, Message, MessageMetadata, Offset, Partition, Result, TopicPath};
use std::sync::mpsc;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;

type Publisher = MultipartitionPublisher<MockPartitionPublisher>;

fn topic() -> TopicPath {
    TopicPath::new("test-project", "us-central1-a", "orders")
}

fn publisher_with_counter(admin: &Arc<MockAdminConnection>, counter: u64) -> Publisher {
    let handle = Handle::current();
    MultipartitionPublisher::new(
        topic(),
        Box::new(|partition| Arc::new(MockPartitionPublisher::new(partition))),
        admin.clone(),
        AlarmRegistry::new(handle.clone()),
        Arc::new(DefaultRoutingPolicy::with_counter(counter)),
        &PublisherConfig::default(),
        handle,
    )
}

fn publisher(admin: &Arc<MockAdminConnection>) -> Publisher {
    publisher_with_counter(admin, 0)
}

/// Wait (in small steps) until `condition` holds.
async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}

fn at(partition: u32, offset: i64) -> MessageMetadata {
    MessageMetadata::new(Partition(partition), Offset(offset))
}

type Hook = Box<dyn FnOnce() + Send>;

/// Mock partition publisher that runs a one-shot hook on its first publish
/// or on shutdown.
struct HookedPublisher {
    mock: MockPartitionPublisher,
    on_publish: Mutex<Option<Hook>>,
    on_shutdown: Mutex<Option<Hook>>,
}

impl HookedPublisher {
    fn new(partition: Partition) -> Self {
        Self {
            mock: MockPartitionPublisher::new(partition),
            on_publish: Mutex::new(None),
            on_shutdown: Mutex::new(None),
        }
    }

    fn set_on_publish(&self, hook: impl FnOnce() + Send + 'static) {
        *self.on_publish.lock() = Some(Box::new(hook));
    }

    fn set_on_shutdown(&self, hook: impl FnOnce() + Send + 'static) {
        *self.on_shutdown.lock() = Some(Box::new(hook));
    }
}

impl LifecycleService for HookedPublisher {
    fn start(&self) -> BoxFuture<'static, Result<()>> {
        self.mock.start()
    }

    fn shutdown(&self) -> BoxFuture<'static, ()> {
        let hook = self.on_shutdown.lock().take();
        if let Some(hook) = hook {
            hook();
        }
        self.mock.shutdown()
    }
}

impl PartitionPublisher for HookedPublisher {
    fn publish(&self, message: Message) -> BoxFuture<'static, Result<Offset>> {
        let published = self.mock.publish(message);
        let hook = self.on_publish.lock().take();
        if let Some(hook) = hook {
            hook();
        }
        published
    }

    fn flush(&self) {
        self.mock.flush();
    }
}

fn hooked_publisher(
    admin: &Arc<MockAdminConnection>,
    config: &PublisherConfig,
    factory: impl Fn(Partition) -> Arc<HookedPublisher> + Send + Sync + 'static,
) -> MultipartitionPublisher<HookedPublisher> {
    let handle = Handle::current();
    MultipartitionPublisher::new(
        topic(),
        Box::new(factory),
        admin.clone(),
        AlarmRegistry::new(handle.clone()),
        Arc::new(DefaultRoutingPolicy::with_counter(0)),
        config,
        handle,
    )
}

// ============================================================================
// Partition discovery
// ============================================================================

#[tokio::test]
async fn test_creates_one_publisher_per_partition() {
    let admin = Arc::new(MockAdminConnection::new(4));
    let publisher = publisher(&admin);
    let _running = publisher.start();

    eventually(|| publisher.partition_count() == 4).await;
    for index in 0..4 {
        let child = publisher.partition_publisher(Partition(index)).unwrap();
        assert_eq!(child.partition(), Partition(index));
        assert!(child.is_started());
    }
    assert!(publisher.partition_publisher(Partition(4)).is_none());
    assert_eq!(admin.call_count(), 1);

    publisher.shutdown().await;
}

#[tokio::test]
async fn test_publish_before_partition_count_known() {
    let admin = Arc::new(MockAdminConnection::new(3));
    admin.pause();
    let publisher = publisher(&admin);
    let _running = publisher.start();

    let first = publisher.publish(Message::new("a"));
    let second = publisher.publish(Message::new("b"));
    let third = publisher.publish(Message::new("c"));
    assert_eq!(publisher.pending_count(), 3);
    assert_eq!(publisher.partition_count(), 0);

    admin.resume();
    assert_eq!(first.await, Ok(at(0, 0)));
    assert_eq!(second.await, Ok(at(1, 0)));
    assert_eq!(third.await, Ok(at(2, 0)));
    assert_eq!(publisher.pending_count(), 0);

    publisher.shutdown().await;
}

#[tokio::test]
async fn test_initial_query_failure_is_fatal() {
    let admin = Arc::new(MockAdminConnection::new(0));
    let failure = Error::Unavailable("control plane down".to_string());
    admin.pause();
    admin.set_error(failure.clone());

    let publisher = publisher(&admin);
    let running = publisher.start();
    let pending = publisher.publish(Message::new("a"));

    admin.resume();
    assert_eq!(running.await, Err(failure.clone()));
    assert_eq!(pending.await, Err(failure.clone()));
    assert_eq!(publisher.partition_count(), 0);
    assert_eq!(publisher.status(), Some(failure.clone()));
    assert_eq!(publisher.publish(Message::new("b")).await, Err(failure));

    publisher.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_partition_growth_is_picked_up_by_polling() {
    let admin = Arc::new(MockAdminConnection::new(2));
    let publisher = publisher(&admin);
    let _running = publisher.start();
    eventually(|| publisher.partition_count() == 2).await;

    let p0 = publisher.partition_publisher(Partition(0)).unwrap();
    let p1 = publisher.partition_publisher(Partition(1)).unwrap();

    admin.set_partition_count(3);
    tokio::time::sleep(Duration::from_secs(61)).await;
    eventually(|| publisher.partition_count() == 3).await;

    assert!(Arc::ptr_eq(&p0, &publisher.partition_publisher(Partition(0)).unwrap()));
    assert!(Arc::ptr_eq(&p1, &publisher.partition_publisher(Partition(1)).unwrap()));
    assert!(publisher.partition_publisher(Partition(2)).unwrap().is_started());
    assert!(admin.call_count() >= 2);

    publisher.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_refresh_failure_is_tolerated() {
    let admin = Arc::new(MockAdminConnection::new(2));
    let publisher = publisher(&admin);
    let _running = publisher.start();
    eventually(|| publisher.partition_count() == 2).await;

    admin.set_error(Error::Unavailable("blip".to_string()));
    tokio::time::sleep(Duration::from_secs(61)).await;
    eventually(|| admin.call_count() >= 2).await;

    assert_eq!(publisher.status(), None);
    assert_eq!(publisher.partition_count(), 2);
    assert!(publisher.publish(Message::new("still works")).await.is_ok());

    admin.set_partition_count(3);
    tokio::time::sleep(Duration::from_secs(60)).await;
    eventually(|| publisher.partition_count() == 3).await;

    publisher.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_partition_count_decrease_is_ignored() {
    let admin = Arc::new(MockAdminConnection::new(3));
    let publisher = publisher(&admin);
    let _running = publisher.start();
    eventually(|| publisher.partition_count() == 3).await;

    admin.set_partition_count(1);
    tokio::time::sleep(Duration::from_secs(61)).await;
    eventually(|| admin.call_count() >= 2).await;

    assert_eq!(publisher.partition_count(), 3);
    assert_eq!(publisher.status(), None);

    publisher.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_no_partitions_created_after_abort() {
    let admin = Arc::new(MockAdminConnection::new(2));
    let publisher = publisher(&admin);
    let running = publisher.start();
    eventually(|| publisher.partition_count() == 2).await;

    let failure = Error::Aborted("stream failed".to_string());
    publisher
        .partition_publisher(Partition(0))
        .unwrap()
        .fail(failure.clone());
    assert_eq!(running.await, Err(failure));

    admin.set_partition_count(3);
    tokio::time::sleep(Duration::from_secs(61)).await;

    assert_eq!(admin.call_count(), 1);
    assert_eq!(publisher.partition_count(), 2);

    publisher.shutdown().await;
}

/// A partition query that completes while the children are being shut down
/// must not leave a partition publisher that is never shut down.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_partitions_found_during_shutdown_are_shut_down() {
    let admin = Arc::new(MockAdminConnection::new(1));
    let created: Arc<Mutex<Vec<Arc<HookedPublisher>>>> = Arc::new(Mutex::new(Vec::new()));
    let (factory_tx, factory_rx) = mpsc::channel::<Partition>();
    let config = PublisherConfig {
        partition_poll_interval: Duration::from_millis(20),
        ..PublisherConfig::default()
    };

    let registry = created.clone();
    let publisher = hooked_publisher(&admin, &config, move |partition| {
        let child = Arc::new(HookedPublisher::new(partition));
        registry.lock().push(child.clone());
        let _ = factory_tx.send(partition);
        child
    });
    let _running = publisher.start();
    eventually(|| publisher.partition_count() == 1).await;
    assert_eq!(factory_rx.recv_timeout(Duration::from_secs(1)), Ok(Partition(0)));

    // Hold the next poll, which will report a second partition.
    admin.pause();
    admin.set_partition_count(2);
    let calls = admin.call_count();
    eventually(|| admin.call_count() > calls).await;

    // Let the held query finish while partition 0 is shutting down.
    let gate = admin.clone();
    publisher
        .partition_publisher(Partition(0))
        .unwrap()
        .set_on_shutdown(move || {
            gate.resume();
            let _ = factory_rx.recv_timeout(Duration::from_millis(300));
        });
    publisher.shutdown().await;

    for index in 0..publisher.partition_count() {
        let child = publisher.partition_publisher(Partition(index as u32)).unwrap();
        assert!(child.mock.is_shut_down(), "partition {index} was never shut down");
    }
    for child in created.lock().iter() {
        assert!(
            !child.mock.is_started() || child.mock.is_shut_down(),
            "partition {} started but never shut down",
            child.mock.partition()
        );
    }
    assert_eq!(publisher.partition_count(), 1);
}

// ============================================================================
// Routing
// ============================================================================

#[tokio::test]
async fn test_keyed_messages_use_key_hash() {
    let admin = Arc::new(MockAdminConnection::new(29));
    let publisher = publisher(&admin);
    let _running = publisher.start();
    eventually(|| publisher.partition_count() == 29).await;

    let first = publisher.publish(Message::new("1").with_ordering_key("oaisdhfoiahsd"));
    let second = publisher.publish(Message::new("2").with_ordering_key("oaisdhfoiahsd"));
    let other = publisher.publish(Message::new("3").with_ordering_key("P(#*&(#"));

    assert_eq!(first.await, Ok(at(18, 0)));
    assert_eq!(second.await, Ok(at(18, 1)));
    assert_eq!(other.await, Ok(at(0, 0)));

    let published = publisher.partition_publisher(Partition(18)).unwrap().published();
    let data: Vec<_> = published.iter().map(|m| m.data().clone()).collect();
    assert_eq!(data, vec!["1", "2"]);

    publisher.shutdown().await;
}

#[tokio::test]
async fn test_unkeyed_messages_round_robin() {
    let admin = Arc::new(MockAdminConnection::new(3));
    let publisher = publisher_with_counter(&admin, 0);
    let _running = publisher.start();
    eventually(|| publisher.partition_count() == 3).await;

    let results: Vec<_> = (0..6)
        .map(|i| publisher.publish(Message::new(format!("m{i}"))))
        .collect();
    let results = futures::future::join_all(results).await;

    assert_eq!(
        results,
        vec![
            Ok(at(0, 0)),
            Ok(at(1, 0)),
            Ok(at(2, 0)),
            Ok(at(0, 1)),
            Ok(at(1, 1)),
            Ok(at(2, 1)),
        ]
    );

    publisher.shutdown().await;
}

#[tokio::test]
async fn test_empty_key_is_round_robin() {
    let admin = Arc::new(MockAdminConnection::new(2));
    let publisher = publisher_with_counter(&admin, 1);
    let _running = publisher.start();
    eventually(|| publisher.partition_count() == 2).await;

    let metadata = publisher
        .publish(Message::new("x").with_ordering_key(""))
        .await
        .unwrap();
    assert_eq!(metadata.partition, Partition(1));

    publisher.shutdown().await;
}

#[tokio::test]
async fn test_publish_during_drain_is_routed_by_running_drain() {
    let admin = Arc::new(MockAdminConnection::new(1));
    admin.pause();

    type Outer = MultipartitionPublisher<HookedPublisher>;
    let outer: Arc<Mutex<Weak<Outer>>> = Arc::new(Mutex::new(Weak::new()));
    let nested: Arc<Mutex<Vec<BoxFuture<'static, Result<MessageMetadata>>>>> =
        Arc::new(Mutex::new(Vec::new()));

    let (o, n) = (outer.clone(), nested.clone());
    let publisher = Arc::new(hooked_publisher(
        &admin,
        &PublisherConfig::default(),
        move |partition| {
            let child = Arc::new(HookedPublisher::new(partition));
            let (o, n) = (o.clone(), n.clone());
            child.set_on_publish(move || {
                let Some(publisher) = o.lock().upgrade() else {
                    return;
                };
                let mut nested = n.lock();
                nested.push(publisher.publish(Message::new("c")));
                nested.push(publisher.publish(Message::new("d")));
            });
            child
        },
    ));
    *outer.lock() = Arc::downgrade(&publisher);

    let _running = publisher.start();
    let a = publisher.publish(Message::new("a"));
    let b = publisher.publish(Message::new("b"));
    admin.resume();

    assert_eq!(a.await, Ok(at(0, 0)));
    assert_eq!(b.await, Ok(at(0, 1)));
    eventually(|| nested.lock().len() == 2).await;
    let later = std::mem::take(&mut *nested.lock());
    assert_eq!(
        futures::future::join_all(later).await,
        vec![Ok(at(0, 2)), Ok(at(0, 3))]
    );
    assert_eq!(publisher.pending_count(), 0);

    let published = publisher.partition_publisher(Partition(0)).unwrap().mock.published();
    let data: Vec<_> = published.iter().map(|m| m.data().clone()).collect();
    assert_eq!(data, vec!["a", "b", "c", "d"]);

    publisher.shutdown().await;
}

#[tokio::test]
async fn test_flush_reaches_every_partition() {
    let admin = Arc::new(MockAdminConnection::new(3));
    let publisher = publisher(&admin);
    let _running = publisher.start();
    eventually(|| publisher.partition_count() == 3).await;

    publisher.flush();
    for index in 0..3 {
        assert_eq!(
            publisher.partition_publisher(Partition(index)).unwrap().flush_count(),
            1
        );
    }

    publisher.shutdown().await;
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_partition_failure_aborts_publisher() {
    let admin = Arc::new(MockAdminConnection::new(2));
    let publisher = publisher(&admin);
    let running = publisher.start();
    eventually(|| publisher.partition_count() == 2).await;

    let failure = Error::Aborted("stream failed".to_string());
    publisher
        .partition_publisher(Partition(1))
        .unwrap()
        .fail(failure.clone());

    assert_eq!(running.await, Err(failure.clone()));
    assert_eq!(publisher.publish(Message::new("late")).await, Err(failure));

    publisher.shutdown().await;
}

#[tokio::test]
async fn test_start_twice_fails() {
    let admin = Arc::new(MockAdminConnection::new(1));
    let publisher = publisher(&admin);
    let _running = publisher.start();

    let second = publisher.start().await;
    assert!(matches!(second, Err(Error::FailedPrecondition(_))));

    publisher.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_resolves_held_publishes() {
    let admin = Arc::new(MockAdminConnection::new(2));
    let publisher = publisher(&admin);
    let running = publisher.start();
    eventually(|| publisher.partition_count() == 2).await;

    for index in 0..2 {
        publisher
            .partition_publisher(Partition(index))
            .unwrap()
            .hold_publishes();
    }
    let first = publisher.publish(Message::new("a"));
    let second = publisher.publish(Message::new("b"));
    eventually(|| {
        (0..2).all(|i| publisher.partition_publisher(Partition(i)).unwrap().held_count() == 1)
    })
    .await;

    publisher.shutdown().await;
    assert_eq!(first.await, Err(Error::Shutdown));
    assert_eq!(second.await, Err(Error::Shutdown));
    assert_eq!(running.await, Ok(()));
    for index in 0..2 {
        assert!(publisher.partition_publisher(Partition(index)).unwrap().is_shut_down());
    }
}

#[tokio::test]
async fn test_shutdown_fails_pending_and_waits_for_query() {
    let admin = Arc::new(MockAdminConnection::new(2));
    admin.pause();
    let publisher = publisher(&admin);
    let running = publisher.start();

    let pending = publisher.publish(Message::new("a"));
    eventually(|| admin.call_count() == 1).await;

    let mut shutdown = publisher.shutdown();
    assert_eq!(pending.await, Err(Error::Shutdown));
    assert_eq!(running.await, Ok(()));

    assert!(
        tokio::time::timeout(Duration::from_millis(20), &mut shutdown)
            .await
            .is_err(),
        "shutdown completed while a partition query was outstanding"
    );

    admin.resume();
    shutdown.await;
    assert_eq!(publisher.partition_count(), 0);
}

#[tokio::test]
async fn test_publish_after_shutdown_fails() {
    let admin = Arc::new(MockAdminConnection::new(1));
    let publisher = publisher(&admin);
    let _running = publisher.start();
    eventually(|| publisher.partition_count() == 1).await;

    publisher.shutdown().await;
    assert_eq!(
        publisher.publish(Message::new("late")).await,
        Err(Error::Shutdown)
    );
    assert_eq!(publisher.start().await, Ok(()));
}

#[tokio::test]
async fn test_mock_partition_publisher_lifecycle() {
    let child = MockPartitionPublisher::new(Partition(5));
    let started = child.start();
    child.shutdown().await;
    assert_eq!(started.await, Ok(()));
    assert!(child.is_shut_down());
}
