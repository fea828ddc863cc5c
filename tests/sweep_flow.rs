//! End-to-end sweep behaviour: scheduler ticks, crawl jobs and frontier
//! probes running against in-memory stores.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Harness, ScriptedReports};
use iquery_sweep::coordination::Mark;
use iquery_sweep::queue::{JobHandler, JobOutcome, WorkerPool, WorkerPoolConfig};
use iquery_sweep::sweep::{SchedulerConfig, TickOutcome};
use tokio::sync::watch;

#[tokio::test]
async fn test_catch_up_probe_and_sweep_to_frontier() {
    let h = Harness::new(&["abc"], ScriptedReports::new().with_range("abc", 1, 140)).await;
    h.seed("abc", 100, 105).await;
    let mut scheduler = h.scheduler(SchedulerConfig::default());
    let marks = h.coordinator.watermarks();

    let mut ticks = 0;
    loop {
        ticks += 1;
        assert!(ticks <= 100, "sweep did not settle");

        scheduler.tick("abc").await.unwrap();
        h.drain().await;
        h.coordinator.cooldowns().clear("abc").await.unwrap();

        let snapshot = marks.snapshot("abc").await.unwrap();
        if snapshot.init == 140 && snapshot.empty_probes >= 1 {
            break;
        }
    }

    let snapshot = marks.snapshot("abc").await.unwrap();
    assert_eq!(snapshot.final_id, 140);
    assert_eq!(snapshot.highest_known, 140);
    for id in 101..=140 {
        assert!(h.store.contains("abc", id), "case {id} was not recorded");
    }
    assert!(!h.store.contains("abc", 100));
    assert!(h.reports.requests().iter().all(|(_, id)| *id > 100));
    assert!(!h.coordinator.locks().probe_in_flight("abc").await.unwrap());
}

#[tokio::test]
async fn test_caught_up_court_takes_final_from_database_before_probing() {
    let h = Harness::new(&["abc"], ScriptedReports::new()).await;
    h.seed("abc", 150, 150).await;
    h.store.insert_case("abc", 200);
    let mut scheduler = h.scheduler(SchedulerConfig::default());

    assert_eq!(
        scheduler.tick("abc").await.unwrap(),
        TickOutcome::FinalAdvanced { from: 150, to: 200 }
    );
    assert!(h.queue.is_empty().await.unwrap());
    assert!(!h.coordinator.locks().probe_in_flight("abc").await.unwrap());

    h.coordinator.cooldowns().clear("abc").await.unwrap();
    assert_eq!(
        scheduler.tick("abc").await.unwrap(),
        TickOutcome::Enqueued { pacer_case_id: 151 }
    );
}

#[tokio::test]
async fn test_probe_that_finds_nothing_counts_empty_result() {
    let h = Harness::new(&["abc"], ScriptedReports::new().with_range("abc", 1, 200)).await;
    h.seed("abc", 200, 200).await;
    h.store.insert_case("abc", 200);
    let mut scheduler = h.scheduler(SchedulerConfig::default());

    assert_eq!(scheduler.tick("abc").await.unwrap(), TickOutcome::ProbeLaunched);
    let outcomes = h.drain().await;
    assert_eq!(outcomes.len(), 1);
    match &outcomes[0] {
        JobOutcome::Probed(probe) => {
            assert_eq!(probe.start, 200);
            assert_eq!(probe.frontier, None);
            assert_eq!(probe.empty_probes, 1);
        }
        other => panic!("unexpected outcome {other:?}"),
    }

    let marks = h.coordinator.watermarks();
    assert_eq!(marks.get(Mark::Final, "abc").await.unwrap(), 200);
    assert_eq!(marks.get(Mark::EmptyProbes, "abc").await.unwrap(), 1);
    assert!(!h.coordinator.locks().probe_in_flight("abc").await.unwrap());
}

#[tokio::test]
async fn test_bounded_run_with_worker_pool() {
    let reports = ScriptedReports::new()
        .with_range("abc", 1, 12)
        .with_range("xyz", 1, 53);
    let h = Harness::new(&["abc", "xyz"], reports).await;
    h.seed("abc", 10, 12).await;
    h.seed("xyz", 50, 53).await;

    let handler: Arc<dyn JobHandler> = h.runner.clone();
    let pool_config = WorkerPoolConfig::new(2)
        .with_poll_interval(Duration::from_millis(10))
        .with_shutdown_timeout(Duration::from_secs(5));
    let mut pool = WorkerPool::with_queue(pool_config, h.queue.clone(), handler);
    pool.start().await.unwrap();

    let config = SchedulerConfig {
        iteration_delay: Duration::from_millis(5),
        ..SchedulerConfig::default()
    }
    .with_iterations(3)
    .with_clear_cooldowns(true);
    let mut scheduler = h.scheduler(config);
    let (_tx, rx) = watch::channel(false);
    let summary = scheduler.run(rx).await.unwrap();
    assert_eq!(summary.iterations, 3);
    assert_eq!(summary.enqueued, 5);
    assert_eq!(summary.probes_launched, 1);

    for _ in 0..400 {
        let stats = h.queue.stats().await.unwrap();
        if stats.pending_jobs == 0 && stats.processing_jobs == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    pool.shutdown().await.unwrap();

    for id in [11, 12] {
        assert!(h.store.contains("abc", id));
    }
    for id in [51, 52, 53] {
        assert!(h.store.contains("xyz", id));
    }
    assert_eq!(h.queue.dead_letter_len().await.unwrap(), 0);
}

#[tokio::test]
async fn test_missing_id_in_sweep_is_not_an_error() {
    let reports = ScriptedReports::new().with_range("abc", 1, 105);
    reports.remove("abc", 102);
    let h = Harness::new(&["abc"], reports).await;
    h.seed("abc", 100, 105).await;
    let mut scheduler = h.scheduler(SchedulerConfig::default());

    let mut outcomes = Vec::new();
    for _ in 0..5 {
        scheduler.tick("abc").await.unwrap();
        outcomes.extend(h.drain().await);
        h.coordinator.cooldowns().clear("abc").await.unwrap();
    }

    assert_eq!(outcomes.len(), 5);
    assert_eq!(outcomes[1], JobOutcome::NotFound);
    assert!(!h.store.contains("abc", 102));
    assert!(h.store.contains("abc", 105));
    assert_eq!(
        h.coordinator.watermarks().get(Mark::Init, "abc").await.unwrap(),
        105
    );
}
