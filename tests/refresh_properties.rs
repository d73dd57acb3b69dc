use std::sync::Arc;
use std::time::Duration;

use kurabak::clock::{Clock, ManualClock};
use kurabak::prices::{
    AssetClass, AssetKey, RefreshError, Schedule, Scheduler, SnapshotCache,
};
use kurabak::staleness::{health_report, HealthStatus};
use rust_decimal_macros::dec;

mod support;
use support::{
    coordinator, currency, gram_gold, server_error, silver, t0, ScriptedSource, Step, TestStore,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn readers_see_whole_batches_only() {
    let old = currency(&[("USD", "32,50"), ("EUR", "35,10"), ("GBP", "41,20")]);
    let new = currency(&[("USD", "33,00"), ("EUR", "36,00"), ("GBP", "42,00")]);
    let steps = (0..40)
        .map(|i| Step::Ok(if i % 2 == 0 { old.clone() } else { new.clone() }))
        .collect();
    let source = Arc::new(ScriptedSource::new().with(AssetClass::Currency, steps));
    let store = Arc::new(TestStore::new());
    let clock = Arc::new(ManualClock::new(t0()));
    let coordinator = Arc::new(coordinator(source, store, clock));

    let cache: Arc<SnapshotCache> = Arc::clone(coordinator.cache());
    let reader = tokio::spawn(async move {
        let mut reads = 0;
        while reads < 5_000 {
            let values: Vec<_> = cache
                .get_all(AssetClass::Currency)
                .iter()
                .map(|s| s.value)
                .collect();
            assert!(
                values.is_empty()
                    || values == vec![dec!(32.50), dec!(35.10), dec!(41.20)]
                    || values == vec![dec!(33.00), dec!(36.00), dec!(42.00)],
                "mixed batch observed: {values:?}"
            );
            reads += 1;
            tokio::task::yield_now().await;
        }
    });

    for _ in 0..40 {
        let outcome = coordinator.refresh(AssetClass::Currency).await;
        assert!(outcome.succeeded);
    }
    reader.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn concurrent_trigger_all_calls_provider_once_per_class() {
    let slow = Duration::from_millis(200);
    let source = Arc::new(
        ScriptedSource::new()
            .with(
                AssetClass::Currency,
                vec![Step::Slow(slow, currency(&[("USD", "32,50")]))],
            )
            .with(AssetClass::Gold, vec![Step::Slow(slow, gram_gold("2.450,75"))])
            .with(AssetClass::Silver, vec![Step::Slow(slow, silver("34,1234"))]),
    );
    let store = Arc::new(TestStore::new());
    let clock = Arc::new(ManualClock::new(t0()));
    let coordinator = Arc::new(coordinator(Arc::clone(&source), store, clock));
    let scheduler = Scheduler::new(Arc::clone(&coordinator), Schedule::default());

    let (first, second) = tokio::join!(scheduler.trigger_all(), scheduler.trigger_all());

    for class in AssetClass::ALL {
        assert_eq!(source.calls(class), 1, "{class} fetched more than once");
    }
    assert_eq!(first, second);
    assert!(first.iter().all(|o| o.succeeded));
    assert_eq!(
        first.iter().map(|o| o.class).collect::<Vec<_>>(),
        AssetClass::ALL.to_vec()
    );
}

#[tokio::test]
async fn history_is_written_before_the_cache_moves() {
    let source = Arc::new(ScriptedSource::new().with(
        AssetClass::Currency,
        vec![
            Step::Ok(currency(&[("USD", "32,50"), ("EUR", "35,10")])),
            Step::Ok(currency(&[("USD", "32,80"), ("EUR", "35,40")])),
        ],
    ));
    let store = Arc::new(TestStore::new());
    let clock = Arc::new(ManualClock::new(t0()));
    let coordinator = coordinator(source, Arc::clone(&store), Arc::clone(&clock));

    assert!(coordinator.refresh(AssetClass::Currency).await.succeeded);
    clock.advance(chrono::Duration::hours(1));
    assert!(coordinator.refresh(AssetClass::Currency).await.succeeded);

    let seen = store.seen_at_append();
    assert_eq!(seen.len(), 4);
    for (point, cached) in &seen[..2] {
        assert!(cached.is_none(), "{} was cached before its history", point.key);
    }
    for (point, cached) in &seen[2..] {
        let cached = cached.as_ref().unwrap();
        assert!(cached.fetched_at < point.recorded_at);
    }

    for snapshot in coordinator.cache().get_all(AssetClass::Currency) {
        let points = store.points(&snapshot.key).await;
        assert!(points
            .iter()
            .any(|p| p.value == snapshot.value && p.recorded_at == snapshot.fetched_at));
    }
}

#[tokio::test]
async fn gold_failure_does_not_hold_back_currency() {
    let source = Arc::new(
        ScriptedSource::new()
            .with(
                AssetClass::Currency,
                vec![
                    Step::Ok(currency(&[("USD", "32,50")])),
                    Step::Ok(currency(&[("USD", "32,80")])),
                ],
            )
            .with(
                AssetClass::Gold,
                vec![Step::Ok(gram_gold("2.450,75")), Step::Fail(server_error())],
            )
            .with(AssetClass::Silver, vec![Step::Ok(silver("34,1234"))]),
    );
    let store = Arc::new(TestStore::new());
    let clock = Arc::new(ManualClock::new(t0()));
    let coordinator = Arc::new(coordinator(Arc::clone(&source), store, Arc::clone(&clock)));
    let scheduler = Scheduler::new(Arc::clone(&coordinator), Schedule::default());

    assert!(scheduler.trigger_all().await.iter().all(|o| o.succeeded));
    let gold_before = coordinator.cache().get(&AssetKey::gold("Gram Altın")).unwrap();

    clock.advance(chrono::Duration::hours(1));
    let outcomes = scheduler.trigger_all().await;
    assert!(outcomes[0].succeeded);
    assert!(!outcomes[1].succeeded);
    assert!(matches!(
        outcomes[1].error,
        Some(RefreshError::UpstreamUnavailable { attempts: 3, .. })
    ));
    assert_eq!(source.calls(AssetClass::Gold), 4);

    let usd = coordinator.cache().get(&AssetKey::currency("USD")).unwrap();
    assert_eq!(usd.value, dec!(32.80));
    assert_eq!(usd.fetched_at, t0() + chrono::Duration::hours(1));

    let gold = coordinator.cache().get(&AssetKey::gold("Gram Altın")).unwrap();
    assert_eq!(gold.value, gold_before.value);
    assert_eq!(gold.fetched_at, gold_before.fetched_at);
    assert_eq!(gold.stale_since, Some(t0() + chrono::Duration::hours(1)));
}

#[tokio::test]
async fn staleness_grows_while_refreshes_fail() {
    let source = Arc::new(ScriptedSource::new().with(
        AssetClass::Silver,
        vec![Step::Ok(silver("34,1234")), Step::Fail(server_error())],
    ));
    let store = Arc::new(TestStore::new());
    let clock = Arc::new(ManualClock::new(t0()));
    let coordinator = coordinator(source, store, Arc::clone(&clock));
    let threshold = Duration::from_secs(30 * 60);

    assert!(coordinator.refresh(AssetClass::Silver).await.succeeded);

    let outage = chrono::Duration::hours(2);
    for _ in 0..4 {
        clock.advance(outage / 4);
        assert!(!coordinator.refresh(AssetClass::Silver).await.succeeded);
    }
    assert_eq!(clock.now(), t0() + outage);

    let report = health_report(&coordinator, threshold);
    let silver = &report.classes[2];
    assert_eq!(silver.class, AssetClass::Silver);
    assert_eq!(silver.status, HealthStatus::Stale);
    assert!(silver.age_secs.unwrap() >= outage.num_seconds() as u64);
    assert_eq!(silver.last_success_at, Some(t0()));
    assert_eq!(silver.refresh.consecutive_failures, 4);
    assert_eq!(report.status, HealthStatus::Empty);
}

#[tokio::test]
async fn usd_move_yields_change_and_one_point() {
    let source = Arc::new(ScriptedSource::new().with(
        AssetClass::Currency,
        vec![
            Step::Ok(currency(&[("USD", "32.50")])),
            Step::Ok(currency(&[("USD", "32.80")])),
        ],
    ));
    let store = Arc::new(TestStore::new());
    let clock = Arc::new(ManualClock::new(t0()));
    let coordinator = coordinator(source, Arc::clone(&store), Arc::clone(&clock));
    let usd = AssetKey::currency("USD");

    assert!(coordinator.refresh(AssetClass::Currency).await.succeeded);
    let before = store.points(&usd).await.len();

    clock.advance(chrono::Duration::minutes(60));
    let outcome = coordinator.refresh(AssetClass::Currency).await;
    assert!(outcome.succeeded);
    assert_eq!(outcome.snapshots_written, 1);

    let snapshot = coordinator.cache().get(&usd).unwrap();
    assert_eq!(snapshot.value, dec!(32.80));
    assert_eq!(snapshot.change_percent, dec!(0.92));

    let points = store.points(&usd).await;
    assert_eq!(points.len(), before + 1);
    let last = points.last().unwrap();
    assert_eq!(last.value, dec!(32.80));
    assert_eq!(last.recorded_at, t0() + chrono::Duration::minutes(60));
}

#[tokio::test(start_paused = true)]
async fn silver_timing_out_three_times_leaves_cache_and_history_alone() {
    let source = Arc::new(ScriptedSource::new().with(
        AssetClass::Silver,
        vec![Step::Ok(silver("34,1234")), Step::Hang],
    ));
    let store = Arc::new(TestStore::new());
    let clock = Arc::new(ManualClock::new(t0()));
    let coordinator = coordinator(Arc::clone(&source), Arc::clone(&store), Arc::clone(&clock));
    let key = AssetKey::silver("Gümüş");

    assert!(coordinator.refresh(AssetClass::Silver).await.succeeded);
    let cached = coordinator.cache().get(&key).unwrap();
    let generation = coordinator.cache().generation();
    let appends = store.appends();

    clock.advance(chrono::Duration::hours(1));
    let outcome = coordinator.refresh(AssetClass::Silver).await;

    match outcome.error {
        Some(RefreshError::UpstreamUnavailable { attempts, ref message, .. }) => {
            assert_eq!(attempts, 3);
            assert!(message.contains("Timeout"), "unexpected message: {message}");
        }
        other => panic!("expected UpstreamUnavailable, got {other:?}"),
    }
    assert_eq!(source.calls(AssetClass::Silver), 4);
    assert_eq!(store.appends(), appends);
    assert_eq!(store.points(&key).await.len(), 1);

    let after = coordinator.cache().get(&key).unwrap();
    assert_eq!(after.value, cached.value);
    assert_eq!(after.fetched_at, cached.fetched_at);
    assert_eq!(coordinator.cache().generation(), generation);
}
