use super::*;
use crate::config::ConfigHandle;
use crate::events::EventKind;
use crate::fraud::RuleName;
use crate::storage::MockResultSink;
use crate::testing::{day, engine_config, listing, raw_listing, ListingGenerator};
use crate::types::{ClusterStatus, HeatingType};
use crate::valuation::FactorKind;
use rust_decimal_macros::dec;
use std::collections::BTreeSet;
use std::sync::Arc;

fn snapshot() -> ConfigSnapshot {
    ConfigHandle::fixed(engine_config()).snapshot()
}

/// Membership of every live cluster, independent of cluster ids
fn memberships(engine: &Engine) -> BTreeSet<BTreeSet<ListingKey>> {
    engine
        .store()
        .all()
        .into_iter()
        .filter(|c| !c.is_merged())
        .map(|c| c.members.keys().cloned().collect())
        .collect()
}

fn events_of(output: &BatchOutput, kind: EventKind) -> Vec<&Event> {
    output.events.iter().filter(|e| e.kind() == kind).collect()
}

#[test]
fn test_cross_source_copies_become_one_property() {
    let engine = Engine::new();
    let batch = vec![raw_listing("halooglasi", "1", day(0)), raw_listing("nekretnine", "77", day(0))];

    let output = engine.process_batch(&snapshot(), batch, day(0)).unwrap();

    assert_eq!(output.properties.len(), 1);
    let property = &output.properties[0];
    assert_eq!(property.members.len(), 2);
    assert_eq!(property.current_price, Some(dec!(125000)));
    assert_eq!(property.recommended_price, Some(dec!(118750)));

    let valuation = output.valuation(property.id).unwrap();
    assert_eq!(valuation.version, property.version);
    let signal = output.fraud_signal(property.id).unwrap();
    assert_eq!(signal.version, property.version);
    assert!(output.quarantined.is_empty());
    assert!(output.unresolved.is_empty());
}

#[test]
fn test_resubmitted_batch_changes_nothing() {
    let engine = Engine::new();
    let batch = vec![
        raw_listing("halooglasi", "1", day(0)),
        raw_listing("nekretnine", "77", day(0)),
        raw_listing("4zida", "5", day(0)),
    ];
    let first = engine.process_batch(&snapshot(), batch.clone(), day(0)).unwrap();
    let before = engine.store().all();

    let second = engine.process_batch(&snapshot(), batch, day(0)).unwrap();

    assert!(!first.properties.is_empty());
    assert!(second.properties.is_empty());
    assert!(second.valuations.is_empty());
    assert!(second.events.is_empty());
    assert_eq!(engine.store().all(), before);
}

#[test]
fn test_submission_order_does_not_matter() {
    let mut generator = ListingGenerator::new(42);
    let (units, listings) = generator.batch(30, day(0));
    let mut shuffled = listings.clone();
    generator.shuffle(&mut shuffled);

    let first = Engine::new();
    first.process_batch(&snapshot(), listings, day(0)).unwrap();
    let second = Engine::new();
    second.process_batch(&snapshot(), shuffled, day(0)).unwrap();

    let clusters = memberships(&first);
    assert_eq!(clusters.len(), units.len());
    assert_eq!(clusters, memberships(&second));
    assert!(first.store().unresolved().is_empty());
}

#[test]
fn test_price_drop_emits_delta() {
    let engine = Engine::new();
    engine
        .process_batch(&snapshot(), vec![raw_listing("halooglasi", "1", day(0))], day(0))
        .unwrap();

    let mut cheaper = raw_listing("halooglasi", "1", day(5));
    cheaper.price = Some("110.000 €".to_string());
    let output = engine.process_batch(&snapshot(), vec![cheaper], day(5)).unwrap();

    let deltas = events_of(&output, EventKind::PriceDelta);
    assert_eq!(deltas.len(), 1);
    let EventPayload::PriceDelta(delta) = &deltas[0].payload else {
        panic!("expected a price delta");
    };
    assert_eq!(delta.previous, dec!(118750));
    assert_eq!(delta.current, dec!(104500));
    assert_eq!(deltas[0].timestamp, day(5));
    assert_eq!(deltas[0].correlation_id.as_deref(), Some(output.batch_id.as_str()));

    let property = &output.properties[0];
    assert_eq!(property.price_history.len(), 2);
    assert_eq!(output.valuation(property.id).unwrap().version, property.version);
}

#[test]
fn test_high_risk_event_only_on_entering_tier() {
    let engine = Engine::new();

    let mut suspicious = raw_listing("halooglasi", "1", day(0));
    suspicious.title = "HITNO! LUX ekskluzivan stan".to_string();
    suspicious.published_at = Some(day(-90));
    suspicious.phone = None;

    // Same photo on two unrelated flats elsewhere in the city
    let mut elsewhere = Vec::new();
    for (id, neighborhood, lat) in [("2", "Zvezdara", "44.7900"), ("3", "Novi Beograd", "44.8150")] {
        let mut other = raw_listing("nekretnine", id, day(0));
        other.neighborhood = Some(neighborhood.to_string());
        other.latitude = Some(lat.to_string());
        other.image_hashes = vec!["img-a".to_string()];
        elsewhere.push(other);
    }

    let mut batch = vec![suspicious.clone()];
    batch.extend(elsewhere);
    let output = engine.process_batch(&snapshot(), batch, day(0)).unwrap();

    let high = events_of(&output, EventKind::HighRisk);
    assert_eq!(high.len(), 1);
    let EventPayload::HighRisk(risk) = &high[0].payload else {
        panic!("expected a high risk event");
    };
    assert_eq!(risk.score, dec!(0.80));
    assert_eq!(risk.previous_tier, None);
    let signal = output.fraud_signal(risk.cluster_id).unwrap();
    assert_eq!(signal.tier, RiskTier::High);

    let mut repriced = suspicious;
    repriced.scraped_at = day(1);
    repriced.price = Some("120.000 €".to_string());
    let output = engine.process_batch(&snapshot(), vec![repriced], day(1)).unwrap();

    assert!(events_of(&output, EventKind::HighRisk).is_empty());
    assert_eq!(output.fraud_signal(risk.cluster_id).unwrap().tier, RiskTier::High);
}

#[test]
fn test_rejected_records_are_quarantined() {
    let engine = Engine::new();
    let mut no_price = raw_listing("halooglasi", "1", day(0));
    no_price.price = Some("Cena na upit".to_string());

    let output = engine
        .process_batch(&snapshot(), vec![no_price, raw_listing("halooglasi", "2", day(0))], day(0))
        .unwrap();

    assert_eq!(output.quarantined.len(), 1);
    assert_eq!(output.quarantined[0].key, ListingKey::new("halooglasi", "1"));
    assert_eq!(events_of(&output, EventKind::Quarantined).len(), 1);
    assert_eq!(output.properties.len(), 1);
}

#[test]
fn test_locality_change_moves_history() {
    let engine = Engine::new();
    engine
        .process_batch(&snapshot(), vec![raw_listing("halooglasi", "1", day(0))], day(0))
        .unwrap();

    let mut moved = raw_listing("halooglasi", "1", day(1));
    moved.neighborhood = Some("Zvezdara".to_string());
    engine.process_batch(&snapshot(), vec![moved], day(1)).unwrap();

    let all = engine.store().all();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].partition.neighborhood, "zvezdara");
    assert_eq!(all[0].price_history.len(), 1);
    assert_eq!(all[0].price_history[0].observed_at, day(0));
}

#[test]
fn test_unconfirmed_property_goes_stale() {
    let engine = Engine::new();
    let first = engine
        .process_batch(&snapshot(), vec![raw_listing("halooglasi", "1", day(0))], day(0))
        .unwrap();
    let id = first.properties[0].id;

    let output = engine.process_batch(&snapshot(), Vec::new(), day(60)).unwrap();

    let property = output.property(id).unwrap();
    assert_eq!(property.status, ClusterStatus::Stale);
    assert_eq!(property.recommended_price, None);
}

#[test]
fn test_manual_split_reaches_next_pass() {
    let engine = Engine::new();
    let output = engine
        .process_batch(
            &snapshot(),
            vec![raw_listing("halooglasi", "1", day(0)), raw_listing("nekretnine", "77", day(0))],
            day(0),
        )
        .unwrap();
    let id = output.properties[0].id;

    let split = engine
        .split(&snapshot(), id, &ListingKey::new("nekretnine", "77"), day(1))
        .unwrap()
        .unwrap();
    assert_eq!(split.moved_observations, 1);

    // Consolidation must not glue the pair back together
    engine.process_batch(&snapshot(), Vec::new(), day(1)).unwrap();
    assert_eq!(memberships(&engine).len(), 2);
}

#[test]
fn test_identical_scrapes_collapse_but_rescrapes_stay() {
    let first = listing("halooglasi", "1", day(0));
    let rescrape = listing("halooglasi", "1", day(3));
    assert_eq!(first.fingerprint, rescrape.fingerprint);

    let ordered = order_listings(vec![rescrape, first.clone(), first]);
    let times: Vec<_> = ordered.iter().map(|l| l.scraped_at).collect();
    assert_eq!(times, vec![day(0), day(3)]);
}

#[test]
fn test_rescrape_in_same_batch_confirms_listing() {
    let engine = Engine::new();
    let batch = vec![raw_listing("halooglasi", "1", day(3)), raw_listing("halooglasi", "1", day(0))];
    let output = engine.process_batch(&snapshot(), batch, day(3)).unwrap();

    let member = &output.properties[0].members[&ListingKey::new("halooglasi", "1")];
    assert_eq!(member.last_confirmed, day(3));
}

/// Six separate Vračar flats, far enough apart never to merge
fn vracar_street() -> Vec<RawListing> {
    let streets = ["Njegoševa 12", "Krunska 40", "Makenzijeva 3", "Kursulina 17", "Maksima Gorkog 8", "Južni bulevar 21"];
    streets
        .iter()
        .enumerate()
        .map(|(i, street)| {
            let mut raw = raw_listing("halooglasi", &(100 + i).to_string(), day(0));
            raw.street = Some(street.to_string());
            raw.latitude = Some(format!("{:.4}", 44.7905 + 0.004 * i as f64));
            raw.price = Some(format!("{}.000 €", 120 + 5 * i));
            raw.image_hashes = vec![format!("img-{}", i)];
            raw.agent_id = Some(format!("agent-{}", i));
            raw
        })
        .collect()
}

#[test]
fn test_config_change_revalues_untouched_clusters() {
    let handle = ConfigHandle::fixed(engine_config());
    let engine = Engine::new();
    let first = engine.process_batch(&handle.snapshot(), vracar_street(), day(0)).unwrap();
    assert_eq!(first.properties.len(), 6);
    assert_eq!(first.valuations.len(), 6);

    let mut tuned = engine_config();
    tuned.valuation.factors.heating.insert(HeatingType::CentralCity, dec!(0.50));
    assert_eq!(handle.replace(tuned).unwrap(), 2);

    let second = engine.process_batch(&handle.snapshot(), Vec::new(), day(0)).unwrap();
    assert!(second.properties.is_empty());
    assert_eq!(second.config_generation, 2);
    assert_eq!(second.valuations.len(), 6);
    for valuation in &second.valuations {
        let heating = valuation.factors.iter().find(|f| f.kind == FactorKind::Heating).unwrap();
        assert_eq!(heating.multiplier, dec!(0.50));
        assert!(valuation.estimate.unwrap() < first.valuation(valuation.cluster_id).unwrap().estimate.unwrap());
    }

    let third = engine.process_batch(&handle.snapshot(), Vec::new(), day(0)).unwrap();
    assert!(third.valuations.is_empty());
    assert!(third.fraud_signals.is_empty());
}

#[test]
fn test_urgency_ages_into_signal_without_rescrape() {
    let engine = Engine::new();
    let mut urgent = raw_listing("halooglasi", "1", day(0));
    urgent.title = "HITNO! Trosoban stan, Vračar".to_string();
    let first = engine.process_batch(&snapshot(), vec![urgent], day(0)).unwrap();
    let id = first.properties[0].id;
    let signal = first.fraud_signal(id).unwrap();
    assert!(signal.triggered.iter().all(|t| t.rule != RuleName::UrgencyClaim));

    // Nothing changes in the cluster, only the clock moves
    let quiet = engine.process_batch(&snapshot(), Vec::new(), day(10)).unwrap();
    assert!(quiet.fraud_signals.is_empty());

    let later = engine.process_batch(&snapshot(), Vec::new(), day(40)).unwrap();
    assert!(later.properties.is_empty());
    let signal = later.fraud_signal(id).unwrap();
    assert_eq!(signal.version, first.properties[0].version);
    assert!(signal.triggered.iter().any(|t| t.rule == RuleName::UrgencyClaim));
    assert!(signal.score > first.fraud_signal(id).unwrap().score);
}

#[tokio::test]
async fn test_scheduler_publishes_each_pass() {
    let mut sink = MockResultSink::new();
    sink.expect_publish()
        .withf(|output| output.properties.len() == 1)
        .times(1)
        .returning(|_| Ok(()));

    let queue = Arc::new(IngestQueue::new(16));
    let scheduler = Scheduler::new(
        Arc::new(ConfigHandle::fixed(engine_config())),
        Arc::new(Engine::new()),
        Arc::clone(&queue),
        Arc::new(sink),
    );
    queue.sender().send(raw_listing("halooglasi", "1", day(0))).await.unwrap();

    let report = scheduler.run_pass(day(0)).await.unwrap();
    assert_eq!(report.listings, 1);
    assert_eq!(report.properties, 1);
    assert!(report.published);
}

#[test]
fn test_failed_publish_is_retried_in_order() {
    let mut sink = MockResultSink::new();
    let mut calls = 0;
    sink.expect_publish().times(3).returning(move |_| {
        calls += 1;
        if calls == 1 {
            Err(EngineError::Internal("disk full".to_string()))
        } else {
            Ok(())
        }
    });

    let queue = Arc::new(IngestQueue::new(16));
    let scheduler = Scheduler::new(
        Arc::new(ConfigHandle::fixed(engine_config())),
        Arc::new(Engine::new()),
        Arc::clone(&queue),
        Arc::new(sink),
    );

    tokio_test::block_on(async {
        queue.sender().send(raw_listing("halooglasi", "1", day(0))).await.unwrap();
        let first = scheduler.run_pass(day(0)).await.unwrap();
        assert!(!first.published);
        assert_eq!(scheduler.unpublished_len().await, 1);

        let second = scheduler.run_pass(day(1)).await.unwrap();
        assert!(second.published);
        assert_eq!(scheduler.unpublished_len().await, 0);
    });
}

#[test]
fn test_bad_config_aborts_pass_and_keeps_queue() {
    let dir = std::env::temp_dir().join(format!("estate-config-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("estate.toml");
    std::fs::write(&path, include_str!("../../config.example.toml")).unwrap();

    let handle = Arc::new(ConfigHandle::load(&path).unwrap());
    let mut sink = MockResultSink::new();
    sink.expect_publish().times(0);
    let queue = Arc::new(IngestQueue::new(16));
    let scheduler = Scheduler::new(handle, Arc::new(Engine::new()), Arc::clone(&queue), Arc::new(sink));

    std::fs::write(&path, "[valuation\nbroken").unwrap();
    tokio_test::block_on(async {
        queue.sender().send(raw_listing("halooglasi", "1", day(0))).await.unwrap();
        let err = scheduler.run_pass(day(0)).await.unwrap_err();
        assert!(err.is_fatal());
    });

    assert_eq!(queue.drain().len(), 1);
    std::fs::remove_dir_all(&dir).unwrap();
}
