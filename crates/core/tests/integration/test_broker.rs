//! Broker property tests
//!
//! Exercises the request/response contract end to end: FIFO ordering,
//! exactly-one-outcome per request, distinct delivery under concurrent
//! workers, idempotent result posting, and cleanup after timeouts and
//! cancellation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use modserve_core::broker::QueueBroker;
use modserve_core::config::QueueSettings;
use modserve_core::payload::{ModuleResponse, QueuedRequest, RequestPayload};
use modserve_core::Error;

fn broker_with_capacity(capacity: usize) -> Arc<QueueBroker> {
    Arc::new(QueueBroker::new(QueueSettings {
        response_timeout_secs: 60,
        command_dequeue_timeout_secs: 10,
        max_queue_length: capacity,
    }))
}

fn broker() -> Arc<QueueBroker> {
    broker_with_capacity(32)
}

fn request(reqtype: &str) -> QueuedRequest {
    QueuedRequest::new(reqtype, RequestPayload::new(reqtype))
}

fn label_response(label: &str) -> ModuleResponse {
    let mut data = serde_json::Map::new();
    data.insert("label".into(), label.into());
    ModuleResponse::success(data)
}

/// Scenario: no worker polls within the timeout, so the caller gets
/// RequestTimeout - and nothing else, ever.
#[tokio::test]
async fn enqueue_times_out_without_worker() {
    let broker = broker();
    broker.create_queue("detect_queue");

    let err = broker
        .enqueue(
            "detect_queue",
            request("detect"),
            Duration::from_millis(200),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::RequestTimeout { .. }));
}

/// Scenario: a worker is already polling when the request arrives; the
/// caller's enqueue resolves within milliseconds of the posted result.
#[tokio::test]
async fn round_trip_through_a_polling_worker() {
    let broker = broker();
    broker.create_queue("detect_queue");

    let worker_broker = broker.clone();
    let worker = tokio::spawn(async move {
        let request = worker_broker
            .dequeue("detect_queue", Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap()
            .expect("worker should receive the request");
        assert_eq!(request.reqtype, "detect");
        worker_broker.set_result(&request.reqid, label_response("cat"));
        request.reqid
    });

    // Give the worker time to block on the empty queue first.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    let response = broker
        .enqueue(
            "detect_queue",
            request("detect"),
            Duration::from_secs(5),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(response, label_response("cat"));
    worker.await.unwrap();
}

/// FIFO: with one worker polling, A enqueued before B is dequeued first.
#[tokio::test]
async fn requests_are_served_in_enqueue_order() {
    let broker = broker();
    broker.create_queue("detect_queue");

    let first = request("first");
    let second = request("second");

    for req in [first, second] {
        let enqueue_broker = broker.clone();
        tokio::spawn(async move {
            let _ = enqueue_broker
                .enqueue(
                    "detect_queue",
                    req,
                    Duration::from_secs(5),
                    &CancellationToken::new(),
                )
                .await;
        });
        // Order the appends deterministically.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    for expected in ["first", "second"] {
        let dequeued = broker
            .dequeue("detect_queue", Duration::from_secs(2), &CancellationToken::new())
            .await
            .unwrap()
            .expect("request should be pending");
        assert_eq!(dequeued.reqtype, expected);
        broker.set_result(&dequeued.reqid, label_response("done"));
    }
}

/// With N pending requests and N concurrent workers, every worker receives
/// a distinct request and none is delivered twice.
#[tokio::test]
async fn concurrent_workers_receive_distinct_requests() {
    let broker = broker();
    broker.create_queue("detect_queue");

    let mut expected_ids = Vec::new();
    for _ in 0..4 {
        let req = request("detect");
        expected_ids.push(req.reqid.clone());
        let enqueue_broker = broker.clone();
        tokio::spawn(async move {
            let _ = enqueue_broker
                .enqueue(
                    "detect_queue",
                    req,
                    Duration::from_secs(5),
                    &CancellationToken::new(),
                )
                .await;
        });
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut workers = Vec::new();
    for _ in 0..4 {
        let worker_broker = broker.clone();
        workers.push(tokio::spawn(async move {
            let request = worker_broker
                .dequeue("detect_queue", Duration::from_secs(2), &CancellationToken::new())
                .await
                .unwrap()
                .expect("each worker should receive one request");
            worker_broker.set_result(&request.reqid, label_response("done"));
            request.reqid
        }));
    }

    let mut received = Vec::new();
    for worker in workers {
        received.push(worker.await.unwrap());
    }

    received.sort();
    expected_ids.sort();
    assert_eq!(received, expected_ids, "every request delivered exactly once");
}

/// A second set_result for the same reqid is a no-op.
#[tokio::test]
async fn set_result_is_idempotent() {
    let broker = broker();
    broker.create_queue("detect_queue");

    let caller_broker = broker.clone();
    let caller = tokio::spawn(async move {
        caller_broker
            .enqueue(
                "detect_queue",
                request("detect"),
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .unwrap()
    });

    let dequeued = broker
        .dequeue("detect_queue", Duration::from_secs(2), &CancellationToken::new())
        .await
        .unwrap()
        .unwrap();

    assert!(broker.set_result(&dequeued.reqid, label_response("cat")));
    assert!(!broker.set_result(&dequeued.reqid, label_response("dog")));

    // The caller observed exactly the first result.
    assert_eq!(caller.await.unwrap(), label_response("cat"));
}

/// A request whose caller already timed out is never handed to a worker.
#[tokio::test]
async fn expired_requests_are_skipped_on_dequeue() {
    let broker = broker();
    broker.create_queue("detect_queue");

    let expired = broker
        .enqueue(
            "detect_queue",
            request("expired"),
            Duration::from_millis(50),
            &CancellationToken::new(),
        )
        .await;
    assert!(matches!(expired, Err(Error::RequestTimeout { .. })));

    // A live request behind the expired one.
    let live = request("live");
    let live_id = live.reqid.clone();
    let enqueue_broker = broker.clone();
    tokio::spawn(async move {
        let _ = enqueue_broker
            .enqueue(
                "detect_queue",
                live,
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let dequeued = broker
        .dequeue("detect_queue", Duration::from_secs(2), &CancellationToken::new())
        .await
        .unwrap()
        .expect("the live request should be delivered");
    assert_eq!(dequeued.reqid, live_id);
    broker.set_result(&dequeued.reqid, label_response("done"));
}

/// Cancelling a blocked enqueue unblocks it promptly, removes its queue
/// entry observably, and discards any late result.
#[tokio::test]
async fn cancelled_enqueue_cleans_up() {
    let broker = broker();
    broker.create_queue("detect_queue");

    let cancel = CancellationToken::new();
    let req = request("detect");
    let reqid = req.reqid.clone();

    let caller_broker = broker.clone();
    let caller_cancel = cancel.clone();
    let caller = tokio::spawn(async move {
        caller_broker
            .enqueue("detect_queue", req, Duration::from_secs(30), &caller_cancel)
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let result = caller.await.unwrap();
    assert!(matches!(result, Err(Error::Cancelled { .. })));

    // Not yet dequeued, so the entry is gone from the worker's view...
    let next = broker
        .dequeue("detect_queue", Duration::from_millis(100), &CancellationToken::new())
        .await
        .unwrap();
    assert!(next.is_none());

    // ...and a late result is discarded.
    assert!(!broker.set_result(&reqid, label_response("late")));
}

/// A cancelled dequeue unblocks with a cancellation-specific failure.
#[tokio::test]
async fn cancelled_dequeue_unblocks() {
    let broker = broker();
    broker.create_queue("detect_queue");

    let cancel = CancellationToken::new();
    let worker_broker = broker.clone();
    let worker_cancel = cancel.clone();
    let worker = tokio::spawn(async move {
        worker_broker
            .dequeue("detect_queue", Duration::from_secs(30), &worker_cancel)
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let result = worker.await.unwrap();
    assert!(matches!(result, Err(Error::Cancelled { .. })));
}

/// A full queue rejects further enqueues fast instead of blocking.
#[tokio::test]
async fn full_queue_rejects_enqueue() {
    let broker = broker_with_capacity(2);
    broker.create_queue("detect_queue");

    for _ in 0..2 {
        let enqueue_broker = broker.clone();
        tokio::spawn(async move {
            let _ = enqueue_broker
                .enqueue(
                    "detect_queue",
                    request("detect"),
                    Duration::from_secs(5),
                    &CancellationToken::new(),
                )
                .await;
        });
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.queue_depth("detect_queue"), Some(2));

    let started = Instant::now();
    let err = broker
        .enqueue(
            "detect_queue",
            request("detect"),
            Duration::from_secs(30),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::QueueFull { .. }));
    assert!(started.elapsed() < Duration::from_secs(1), "rejection must not block");
}

/// Queues are independent; queue names are case-insensitive.
#[tokio::test]
async fn queues_are_independent_and_case_insensitive() {
    let broker = broker();
    broker.create_queue("Detect_Queue");
    broker.create_queue("face_queue");

    let enqueue_broker = broker.clone();
    tokio::spawn(async move {
        let _ = enqueue_broker
            .enqueue(
                "DETECT_QUEUE",
                request("detect"),
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The other queue stays empty.
    let other = broker
        .dequeue("face_queue", Duration::from_millis(100), &CancellationToken::new())
        .await
        .unwrap();
    assert!(other.is_none());

    let dequeued = broker
        .dequeue("detect_queue", Duration::from_secs(2), &CancellationToken::new())
        .await
        .unwrap()
        .expect("case-insensitive lookup should find the request");
    broker.set_result(&dequeued.reqid, label_response("done"));
}
