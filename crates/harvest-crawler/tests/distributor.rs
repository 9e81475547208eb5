mod common;

use std::collections::HashSet;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use harvest_crawler::{
    CrawlerConfig, OnQueueFull, RunSettings, SubmitError, TaskDistributor, WorkItem,
};

use common::{blocked, leaf, not_found, ok, transient, ScriptedFetcher, ScriptedSink};

fn distributor(
    config: &CrawlerConfig,
    fetcher: ScriptedFetcher,
    sink: ScriptedSink,
) -> (TaskDistributor, Arc<ScriptedFetcher>, Arc<ScriptedSink>) {
    let fetcher = Arc::new(fetcher);
    let sink = Arc::new(sink);
    let parts = common::parts(config, fetcher.clone(), sink.clone());
    (TaskDistributor::new(config, parts), fetcher, sink)
}

fn product(id: u64) -> WorkItem {
    WorkItem::product(
        format!("prod:{id}"),
        Arc::new(leaf("a1", &["Fruits", "Apples"])),
    )
}

fn products(ids: impl IntoIterator<Item = u64>) -> ScriptedFetcher {
    ids.into_iter().fold(ScriptedFetcher::new(), |f, id| {
        f.on(&format!("prod:{id}"), [ok(&format!("{id}|item {id}|100|80"))])
    })
}

#[tokio::test]
async fn full_batches_flush_and_drain_flushes_the_rest() {
    let config = common::config();
    let (mut d, _, sink) = distributor(&config, products(1..=6), ScriptedSink::new());

    d.run(RunSettings::from(&config));
    for id in 1..=6 {
        d.submit(product(id)).await.unwrap();
    }
    let report = d.drain().await;

    assert_eq!(sink.batch_sizes(), vec![4, 2]);
    assert_eq!(report.products_attempted, 6);
    assert_eq!(report.products_succeeded, 6);
    assert_eq!(report.batches_flushed, 2);
    assert_eq!(sink.records().len(), 6);
}

#[tokio::test]
async fn records_carry_category_fallback_and_discount() {
    let config = common::config();
    let (mut d, _, sink) = distributor(&config, products([1]), ScriptedSink::new());

    d.run(RunSettings::from(&config));
    d.submit(product(1)).await.unwrap();
    d.drain().await;

    let record = &sink.records()[0];
    assert_eq!(record.category_main, "Fruits");
    assert_eq!(record.category_mid, "");
    assert_eq!(record.category_leaf, "Apples");
    assert_eq!(record.discount_percent, Some(20.0));
}

#[tokio::test]
async fn transient_failures_stop_after_max_retries() {
    let config = common::config();
    let fetcher = ScriptedFetcher::new().on("prod:9", [transient()]);
    let (mut d, fetcher, sink) = distributor(&config, fetcher, ScriptedSink::new());

    d.run(RunSettings::from(&config));
    d.submit(product(9)).await.unwrap();
    let report = d.drain().await;

    assert_eq!(fetcher.calls_to("prod:9"), 4);
    assert_eq!(report.retried, 3);
    assert_eq!(report.products_failed, 1);
    assert_eq!(report.products_succeeded, 0);
    assert_eq!(report.failures[0].item, "product prod:9");
    assert!(report.failures[0].reason.contains("503"));
    assert!(sink.records().is_empty());
}

#[tokio::test]
async fn transient_failure_recovers() {
    let config = common::config();
    let fetcher = ScriptedFetcher::new().on("prod:1", [transient(), ok("1|milk|50|50")]);
    let (mut d, fetcher, _) = distributor(&config, fetcher, ScriptedSink::new());

    d.run(RunSettings::from(&config));
    d.submit(product(1)).await.unwrap();
    let report = d.drain().await;

    assert_eq!(fetcher.calls_to("prod:1"), 2);
    assert_eq!(report.retried, 1);
    assert_eq!(report.products_succeeded, 1);
    assert_eq!(report.products_failed, 0);
}

#[tokio::test]
async fn blocked_attempt_is_retried_with_another_identity() {
    let config = common::config();
    let fetcher = ScriptedFetcher::new().on("prod:1", [blocked(), ok("1|milk|50|50")]);
    let (mut d, fetcher, _) = distributor(&config, fetcher, ScriptedSink::new());

    d.run(RunSettings::from(&config));
    d.submit(product(1)).await.unwrap();
    let report = d.drain().await;

    let identities = fetcher.identities_for("prod:1");
    assert_eq!(identities.len(), 2);
    assert_ne!(identities[0], identities[1]);
    assert_eq!(report.products_succeeded, 1);
}

#[tokio::test]
async fn permanent_failure_is_not_retried() {
    let config = common::config();
    let fetcher = ScriptedFetcher::new().on("prod:1", [not_found()]);
    let (mut d, fetcher, _) = distributor(&config, fetcher, ScriptedSink::new());

    d.run(RunSettings::from(&config));
    d.submit(product(1)).await.unwrap();
    let report = d.drain().await;

    assert_eq!(fetcher.calls_to("prod:1"), 1);
    assert_eq!(report.retried, 0);
    assert_eq!(report.products_failed, 1);
}

#[tokio::test]
async fn unparsable_detail_is_a_failure() {
    let config = common::config();
    let fetcher = ScriptedFetcher::new().on("prod:1", [ok("garbage")]);
    let (mut d, fetcher, _) = distributor(&config, fetcher, ScriptedSink::new());

    d.run(RunSettings::from(&config));
    d.submit(product(1)).await.unwrap();
    let report = d.drain().await;

    assert_eq!(fetcher.calls_to("prod:1"), 1);
    assert_eq!(report.products_failed, 1);
    assert!(report.failures[0].reason.contains("bad record line"));
}

#[tokio::test]
async fn malformed_rejection_is_terminal_for_that_record_only() {
    let config = common::config();
    let (mut d, _, sink) = distributor(&config, products(1..=4), ScriptedSink::new().malformed([3]));

    d.run(RunSettings::from(&config));
    for id in 1..=4 {
        d.submit(product(id)).await.unwrap();
    }
    let report = d.drain().await;

    assert_eq!(report.products_succeeded, 3);
    assert_eq!(report.products_failed, 1);
    assert_eq!(report.retried, 0);
    assert_eq!(sink.batches().len(), 1);
    assert!(sink.records().iter().all(|r| r.product_id != 3));
}

#[tokio::test]
async fn retryable_rejection_is_persisted_again() {
    let config = common::config();
    let (mut d, _, sink) = distributor(&config, products(1..=4), ScriptedSink::new().flaky([2]));

    d.run(RunSettings::from(&config));
    for id in 1..=4 {
        d.submit(product(id)).await.unwrap();
    }
    let report = d.drain().await;

    assert_eq!(report.products_succeeded, 4);
    assert_eq!(report.products_failed, 0);
    assert_eq!(report.retried, 1);
    assert_eq!(sink.batches().last(), Some(&vec![2]));
    assert_eq!(sink.records().len(), 4);
}

#[tokio::test]
async fn sink_outage_is_retried_before_giving_up() {
    let config = common::config();
    let sink = ScriptedSink::new().unavailable_for(1);
    let (mut d, _, sink) = distributor(&config, products(1..=2), sink);

    d.run(RunSettings::from(&config));
    for id in 1..=2 {
        d.submit(product(id)).await.unwrap();
    }
    let report = d.drain().await;

    assert_eq!(sink.calls(), 2);
    assert_eq!(report.products_succeeded, 2);
    assert_eq!(report.products_overflowed, 0);
}

#[tokio::test]
async fn undeliverable_batch_goes_to_the_overflow_file() {
    let dir = tempfile::tempdir().unwrap();
    let overflow = dir.path().join("overflow.jsonl");
    let config = CrawlerConfig {
        sink_max_attempts: 2,
        overflow_path: Some(overflow.clone()),
        ..common::config()
    };
    let (mut d, _, sink) = distributor(&config, products(1..=2), ScriptedSink::new().down());

    d.run(RunSettings::from(&config));
    for id in 1..=2 {
        d.submit(product(id)).await.unwrap();
    }
    let report = d.drain().await;

    assert_eq!(sink.calls(), 2);
    assert_eq!(report.products_overflowed, 2);
    assert_eq!(report.overflow_batches, 1);
    assert_eq!(report.products_succeeded, 0);
    assert_eq!(fs::read_to_string(overflow).unwrap().lines().count(), 2);
}

#[tokio::test]
async fn reject_mode_refuses_items_beyond_capacity() {
    let config = CrawlerConfig {
        queue_capacity: 1,
        on_queue_full: OnQueueFull::Reject,
        ..common::config()
    };
    let (d, _, sink) = distributor(&config, products(1..=2), ScriptedSink::new());

    // Nothing consumes the queue before `run`.
    d.submit(product(1)).await.unwrap();
    assert_eq!(d.submit(product(2)).await, Err(SubmitError::QueueFull));

    let report = d.drain().await;
    assert_eq!(report.products_succeeded, 1);
    assert_eq!(sink.records()[0].product_id, 1);
}

#[tokio::test]
async fn listing_pages_fan_out_into_products() {
    let config = common::config();
    let fetcher = products([1, 2])
        .on("list:a1:1", [ok("pages 2\ndetail prod:1\ndetail prod:2")])
        .on("list:a1:2", [ok("resolved 3|pear|40|30\nresolved 4|bad|10|20")]);
    let (mut d, fetcher, sink) = distributor(&config, fetcher, ScriptedSink::new());

    d.run(RunSettings::from(&config));
    d.submit(WorkItem::listing(leaf("a1", &["Fruits", "Apples"]), 1))
        .await
        .unwrap();
    let report = d.drain().await;

    assert_eq!(fetcher.calls_to("list:a1:2"), 1);
    assert_eq!(report.listing_pages_succeeded, 2);
    assert_eq!(report.products_attempted, 4);
    assert_eq!(report.products_succeeded, 3);
    // sp above mrp
    assert_eq!(report.products_failed, 1);
    let ids = sink.records().iter().map(|r| r.product_id).collect::<Vec<_>>();
    assert_eq!(ids, vec![1, 2, 3]);
}

#[tokio::test]
async fn empty_listing_page_ends_the_category() {
    let config = common::config();
    let fetcher = ScriptedFetcher::new().on("list:a1:1", [Ok(harvest_crawler::Payload::new(204, ""))]);
    let (mut d, _, sink) = distributor(&config, fetcher, ScriptedSink::new());

    d.run(RunSettings::from(&config));
    d.submit(WorkItem::listing(leaf("a1", &["Fruits", "Apples"]), 1))
        .await
        .unwrap();
    let report = d.drain().await;

    assert_eq!(report.listing_pages_succeeded, 1);
    assert_eq!(report.products_attempted, 0);
    assert_eq!(sink.calls(), 0);
}

#[tokio::test]
async fn failed_listing_page_only_loses_that_page() {
    let config = common::config();
    let fetcher = products([1])
        .on("list:a1:1", [ok("pages 2\ndetail prod:1")])
        .on("list:a1:2", [not_found()]);
    let (mut d, _, _) = distributor(&config, fetcher, ScriptedSink::new());

    d.run(RunSettings::from(&config));
    d.submit(WorkItem::listing(leaf("a1", &["Fruits", "Apples"]), 1))
        .await
        .unwrap();
    let report = d.drain().await;

    assert_eq!(report.listing_pages_succeeded, 1);
    assert_eq!(report.listing_pages_failed, 1);
    assert_eq!(report.products_succeeded, 1);
}

#[tokio::test]
async fn cancellation_flushes_buffered_records_and_reports_pending_work() {
    let config = CrawlerConfig {
        batch_size: 10,
        backoff_base_ms: 60_000,
        backoff_cap_ms: 60_000,
        ..common::config()
    };
    let fetcher = products([1, 2])
        .on("prod:7", [transient()])
        .on("prod:8", [transient()])
        .on("prod:9", [transient()]);
    let (mut d, _, sink) = distributor(&config, fetcher, ScriptedSink::new());
    let cancel = d.cancellation_token();
    let stats = d.stats();

    d.run(RunSettings::from(&config));
    for id in [1, 2, 7, 8, 9] {
        d.submit(product(id)).await.unwrap();
    }
    tokio::time::timeout(Duration::from_secs(5), async {
        while stats.report().retried < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    cancel.cancel();
    let report = tokio::time::timeout(Duration::from_secs(5), d.drain())
        .await
        .unwrap();

    assert_eq!(report.products_succeeded, 2);
    assert_eq!(report.pending_at_shutdown, 3);
    assert_eq!(report.products_failed, 0);
    assert_eq!(sink.records().len(), 2);
}

#[tokio::test]
async fn duplicate_ids_never_share_a_batch() {
    let config = CrawlerConfig {
        batch_size: 3,
        ..common::config()
    };
    let (mut d, _, sink) = distributor(&config, products(1..=3), ScriptedSink::new());

    d.run(RunSettings::from(&config));
    for id in [1, 2, 3, 1, 2] {
        d.submit(product(id)).await.unwrap();
    }
    let report = d.drain().await;

    assert!(sink
        .batches()
        .iter()
        .all(|b| b.iter().collect::<HashSet<_>>().len() == b.len()));
    assert_eq!(report.products_succeeded, 5);
    assert_eq!(sink.records().len(), 3);
}

#[tokio::test]
async fn unparsable_listing_entry_counts_as_failed() {
    let config = common::config();
    let fetcher = ScriptedFetcher::new().on("list:a1:1", [ok("resolved 3|pear|40|30\ngarbled x9")]);
    let (mut d, _, sink) = distributor(&config, fetcher, ScriptedSink::new());

    d.run(RunSettings::from(&config));
    d.submit(WorkItem::listing(leaf("a1", &["Fruits", "Apples"]), 1))
        .await
        .unwrap();
    let report = d.drain().await;

    assert_eq!(report.products_attempted, 2);
    assert_eq!(report.products_succeeded, 1);
    assert_eq!(report.products_failed, 1);
    assert!(report.failures[0].item.starts_with("product x9"));
    assert_eq!(report.failures[0].reason, "garbled entry");
    assert_eq!(sink.records().len(), 1);
}

#[tokio::test]
async fn flush_interval_persists_a_partial_batch() {
    let config = CrawlerConfig {
        flush_interval_secs: 1,
        ..common::config()
    };
    let (mut d, _, sink) = distributor(&config, products([1]), ScriptedSink::new());

    d.run(RunSettings::from(&config));
    d.submit(product(1)).await.unwrap();
    tokio::time::timeout(Duration::from_secs(3), async {
        while sink.calls() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    // Persisted before drain, with the batch still below batch_size.
    assert_eq!(sink.batch_sizes(), vec![1]);
    let report = d.drain().await;
    assert_eq!(report.batches_flushed, 1);
    assert_eq!(report.products_succeeded, 1);
}

#[tokio::test]
async fn block_mode_waits_until_a_worker_frees_a_slot() {
    let config = CrawlerConfig {
        queue_capacity: 1,
        on_queue_full: OnQueueFull::Block,
        ..common::config()
    };
    let (mut d, _, sink) = distributor(&config, products(1..=2), ScriptedSink::new());

    d.submit(product(1)).await.unwrap();
    // Nothing dequeues before `run`.
    assert!(tokio::time::timeout(Duration::from_millis(50), d.submit(product(2)))
        .await
        .is_err());

    d.run(RunSettings::from(&config));
    tokio::time::timeout(Duration::from_secs(3), d.submit(product(2)))
        .await
        .unwrap()
        .unwrap();
    let report = d.drain().await;

    assert_eq!(report.products_attempted, 2);
    assert_eq!(report.products_succeeded, 2);
    assert_eq!(sink.records().len(), 2);
}

#[tokio::test]
async fn cancel_releases_a_submit_waiting_for_room() {
    let config = CrawlerConfig {
        queue_capacity: 1,
        on_queue_full: OnQueueFull::Block,
        ..common::config()
    };
    let (d, _, sink) = distributor(&config, products(1..=2), ScriptedSink::new());
    let cancel = d.cancellation_token();

    d.submit(product(1)).await.unwrap();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
    });
    let waited = tokio::time::timeout(Duration::from_secs(3), d.submit(product(2)))
        .await
        .unwrap();
    assert_eq!(waited, Err(SubmitError::Closed));
    assert_eq!(d.submit(product(2)).await, Err(SubmitError::Closed));

    let report = tokio::time::timeout(Duration::from_secs(3), d.drain())
        .await
        .unwrap();
    assert_eq!(report.pending_at_shutdown, 1);
    assert_eq!(report.products_succeeded, 0);
    assert_eq!(sink.calls(), 0);
}
