use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tesseradb::core::queue::{ApplicationQueue, WorkItem};
use tokio::time::Instant;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn items_of_one_group_never_overlap() {
    let queue = ApplicationQueue::new(4);
    let running = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let order = Arc::new(Mutex::new(Vec::new()));

    for i in 0..6u32 {
        let running = running.clone();
        let max_seen = max_seen.clone();
        let order = order.clone();
        queue.add(WorkItem::grouped(
            42,
            Box::pin(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                order.lock().push(i);
                running.fetch_sub(1, Ordering::SeqCst);
            }),
        ));
    }
    queue.quiesce().await;

    // At most one member of the group ran at a time, in FIFO order.
    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4, 5]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn different_groups_run_concurrently() {
    let queue = ApplicationQueue::new(4);
    let running = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));

    for group in 0..3u64 {
        let running = running.clone();
        let max_seen = max_seen.clone();
        queue.add(WorkItem::grouped(
            group,
            Box::pin(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }),
        ));
    }
    queue.quiesce().await;
    assert!(max_seen.load(Ordering::SeqCst) > 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn urgent_items_jump_the_normal_queue() {
    // One worker, so queue order is observable.
    let queue = ApplicationQueue::new(1);
    let order = Arc::new(Mutex::new(Vec::new()));

    let o = order.clone();
    queue.add(WorkItem::new(Box::pin(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        o.lock().push("first-normal");
    })));
    // Give the worker time to pick up the first item.
    tokio::time::sleep(Duration::from_millis(10)).await;

    let o = order.clone();
    queue.add(WorkItem::new(Box::pin(async move {
        o.lock().push("second-normal");
    })));
    let o = order.clone();
    queue.add_urgent(WorkItem::new(Box::pin(async move {
        o.lock().push("urgent");
    })));

    queue.quiesce().await;
    let order = order.lock();
    let urgent_pos = order.iter().position(|s| *s == "urgent").unwrap();
    let second_pos = order.iter().position(|s| *s == "second-normal").unwrap();
    assert!(urgent_pos < second_pos);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn expired_items_are_discarded_without_blocking_their_group() {
    let queue = ApplicationQueue::new(1);
    let ran = Arc::new(Mutex::new(Vec::new()));

    // Keep the worker busy so the expired item is still queued when its
    // deadline passes.
    let r = ran.clone();
    queue.add(WorkItem::grouped(
        7,
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            r.lock().push("blocker");
        }),
    ));

    let r = ran.clone();
    queue.add(
        WorkItem::grouped(
            7,
            Box::pin(async move {
                r.lock().push("expired");
            }),
        )
        .with_deadline(Instant::now() + Duration::from_millis(10)),
    );

    let r = ran.clone();
    queue.add(WorkItem::grouped(
        7,
        Box::pin(async move {
            r.lock().push("survivor");
        }),
    ));

    queue.quiesce().await;
    assert_eq!(*ran.lock(), vec!["blocker", "survivor"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn quiesce_waits_for_all_workers() {
    let queue = ApplicationQueue::new(2);
    let done = Arc::new(AtomicUsize::new(0));
    for _ in 0..5 {
        let done = done.clone();
        queue.add(WorkItem::new(Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            done.fetch_add(1, Ordering::SeqCst);
        })));
    }
    queue.quiesce().await;
    assert_eq!(done.load(Ordering::SeqCst), 5);
}
