/// Delivery tests
///
/// Batch delivery, checkpointing and redelivery after handler failures.
/// Run with: cargo test --test processing_tests

use changefeed_processor::{
    Batch, ChangeDispatcher, ChangeFeedProcessorBuilder, ContinuationToken, CopyToContainerHandler,
    FeedError, FeedReader, InMemoryChangeFeed, InMemoryContainer, InMemoryLeaseStore, LeaseManager,
    LeaseStore, ManualClock, PartitionId, PollOutcome, ProcessorOptions, handler_fn,
};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn fast_options() -> ProcessorOptions {
    ProcessorOptions::new()
        .feed_poll_delay(Duration::from_millis(5))
        .lease_ttl(Duration::from_secs(5))
        .lease_renew_interval(Duration::from_secs(1))
        .lease_acquire_interval(Duration::from_millis(200))
        .retry_backoff(Duration::from_millis(5), Duration::from_millis(50))
}

fn ids(batch: &Batch) -> Vec<String> {
    batch.records.iter().map(|record| record.id.clone()).collect()
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    for _ in 0..500 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn three_batches_are_delivered_and_checkpointed_in_order() {
    let feed = InMemoryChangeFeed::with_partitions(1).await;
    for n in 1..=3 {
        feed.upsert(json!({"id": format!("doc-{n}")})).await.unwrap();
    }
    let store = InMemoryLeaseStore::new();
    let delivered = Arc::new(Mutex::new(Vec::new()));
    let recorder = delivered.clone();

    let processor = ChangeFeedProcessorBuilder::new()
        .host_name("host-a")
        .lease_store(Arc::new(store.clone()))
        .feed_source(Arc::new(feed.clone()))
        .handler(handler_fn(move |batch| {
            recorder.lock().unwrap().push((ids(batch), batch.continuation));
            Ok(())
        }))
        .options(fast_options().max_items_per_batch(1))
        .build()
        .unwrap();

    processor.start().await.unwrap();
    wait_until(|| processor.stats().checkpoints == 3).await;
    processor.stop().await.unwrap();

    let delivered = delivered.lock().unwrap().clone();
    assert_eq!(
        delivered,
        vec![
            (vec!["doc-1".to_string()], ContinuationToken::new(1)),
            (vec!["doc-2".to_string()], ContinuationToken::new(2)),
            (vec!["doc-3".to_string()], ContinuationToken::new(3)),
        ]
    );

    let lease = store.get_lease(&"0".into()).await.unwrap().unwrap();
    assert_eq!(lease.continuation, ContinuationToken::new(3));
    assert_eq!(processor.stats().batches_delivered, 3);
}

#[tokio::test]
async fn failed_batch_is_redelivered_unchanged() {
    let feed = InMemoryChangeFeed::with_partitions(1).await;
    for n in 1..=3 {
        feed.upsert(json!({"id": format!("doc-{n}")})).await.unwrap();
    }
    let clock = ManualClock::default();
    let leases = Arc::new(LeaseManager::new(
        Arc::new(InMemoryLeaseStore::new()),
        Arc::new(clock.clone()),
        Duration::from_secs(10),
    ));
    let reader = FeedReader::new(
        Arc::new(feed.clone()),
        &ProcessorOptions::new().max_items_per_batch(1),
    );

    let attempts = Arc::new(Mutex::new(Vec::new()));
    let recorder = attempts.clone();
    let dispatcher = ChangeDispatcher::new(
        handler_fn(move |batch| {
            let mut attempts = recorder.lock().unwrap();
            attempts.push(ids(batch));
            let second_batch_first_try = batch.continuation == ContinuationToken::new(2)
                && attempts.iter().filter(|seen| **seen == ids(batch)).count() == 1;
            if second_batch_first_try {
                return Err(FeedError::HandlerFailed("downstream unavailable".into()));
            }
            Ok(())
        }),
        leases.clone(),
    );

    let partition = PartitionId::from("0");
    let lease = leases.acquire(&partition, &"host-a".into()).await.unwrap();
    let lease = Arc::new(tokio::sync::Mutex::new(lease));

    let mut failed_batch = None;
    for _ in 0..4 {
        let token = lease.lock().await.continuation;
        let PollOutcome::Batch(batch) = reader.poll(&partition, &token).await.unwrap() else {
            panic!("expected a batch at {token}");
        };
        match dispatcher.dispatch(&lease, &batch).await {
            Ok(_) => {
                if let Some(failed) = failed_batch.take() {
                    assert_eq!(failed, batch, "redelivered batch must be identical");
                }
            }
            Err(err) => {
                assert!(matches!(err, FeedError::HandlerFailed(_)));
                let stored = leases.lease(&partition).await.unwrap().unwrap();
                assert_eq!(stored.continuation, ContinuationToken::new(1));
                failed_batch = Some(batch);
            }
        }
    }

    let attempts = attempts.lock().unwrap().clone();
    assert_eq!(
        attempts,
        vec![
            vec!["doc-1".to_string()],
            vec!["doc-2".to_string()],
            vec!["doc-2".to_string()],
            vec!["doc-3".to_string()],
        ]
    );
    assert_eq!(lease.lock().await.continuation, ContinuationToken::new(3));
    assert_eq!(dispatcher.stats().batches_failed, 1);
}

#[tokio::test]
async fn checkpoints_never_move_backwards() {
    let feed = InMemoryChangeFeed::with_partitions(2).await;
    let store = InMemoryLeaseStore::new();
    let seen = Arc::new(Mutex::new(Vec::<(PartitionId, ContinuationToken)>::new()));
    let recorder = seen.clone();

    let processor = ChangeFeedProcessorBuilder::new()
        .host_name("host-a")
        .lease_store(Arc::new(store.clone()))
        .feed_source(Arc::new(feed.clone()))
        .handler(handler_fn(move |batch| {
            recorder
                .lock()
                .unwrap()
                .push((batch.partition.clone(), batch.continuation));
            Ok(())
        }))
        .options(fast_options().max_items_per_batch(3))
        .build()
        .unwrap();

    processor.start().await.unwrap();
    for n in 0..40 {
        feed.upsert(json!({"id": format!("item-{n}")})).await.unwrap();
        if n % 7 == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
    wait_until(|| processor.stats().records_delivered == 40).await;
    processor.stop().await.unwrap();

    let seen = seen.lock().unwrap().clone();
    for partition in ["0", "1"] {
        let tokens: Vec<ContinuationToken> = seen
            .iter()
            .filter(|(p, _)| p.as_str() == partition)
            .map(|(_, token)| *token)
            .collect();
        assert!(tokens.windows(2).all(|pair| pair[0] < pair[1]), "{tokens:?}");
    }
}

#[tokio::test]
async fn copy_handler_mirrors_documents_into_the_output() {
    let feed = InMemoryChangeFeed::with_partitions(2).await;
    let output = InMemoryContainer::new("orders-copy");

    let processor = ChangeFeedProcessorBuilder::new()
        .host_name("host-a")
        .lease_store(Arc::new(InMemoryLeaseStore::new()))
        .feed_source(Arc::new(feed.clone()))
        .handler(Arc::new(CopyToContainerHandler::new(Arc::new(output.clone()))))
        .options(fast_options())
        .build()
        .unwrap();

    processor.start().await.unwrap();
    feed.upsert(json!({"id": "order-1", "total": 10})).await.unwrap();
    feed.upsert(json!({"id": "order-2", "total": 20})).await.unwrap();
    feed.upsert(json!({"id": "order-1", "total": 15})).await.unwrap();

    wait_until(|| processor.stats().records_delivered == 3).await;
    processor.stop().await.unwrap();

    assert_eq!(output.len().await, 2);
    assert_eq!(output.get("order-1").await.unwrap()["total"], json!(15));
    assert_eq!(output.get("order-2").await.unwrap()["total"], json!(20));
}
