use super::*;
use crate::config::ConfigHandle;
use crate::engine::Engine;
use crate::testing::{day, engine_config, raw_listing};

fn sample_output() -> BatchOutput {
    let mut no_price = raw_listing("halooglasi", "9", day(0));
    no_price.price = None;
    let batch = vec![
        raw_listing("halooglasi", "1", day(0)),
        raw_listing("nekretnine", "77", day(0)),
        no_price,
    ];
    let snapshot = ConfigHandle::fixed(engine_config()).snapshot();
    Engine::new().process_batch(&snapshot, batch, day(0)).unwrap()
}

#[tokio::test]
async fn test_save_and_read_back() {
    let db = Database::in_memory().await.unwrap();
    let output = sample_output();
    let id = output.properties[0].id;

    db.save_batch(&output).await.unwrap();

    let property = db.get_property(id).await.unwrap().unwrap();
    assert_eq!(property, output.properties[0]);
    assert_eq!(property.members.len(), 2);

    let valuation = db.get_valuation(id).await.unwrap().unwrap();
    assert_eq!(valuation.version, property.version);
    let signal = db.get_fraud_signal(id).await.unwrap().unwrap();
    assert_eq!(signal.version, property.version);

    let quarantined = db.get_quarantined().await.unwrap();
    assert_eq!(quarantined.len(), 1);
    assert_eq!(quarantined[0].key.source_listing_id, "9");
    assert_eq!(db.event_count().await.unwrap(), output.events.len() as i64);
    assert!(db.get_property(ClusterId(999_999)).await.unwrap().is_none());
}

#[tokio::test]
async fn test_republishing_is_harmless() {
    let db = Database::in_memory().await.unwrap();
    let output = sample_output();

    db.publish(&output).await.unwrap();
    db.publish(&output).await.unwrap();

    assert_eq!(db.get_quarantined().await.unwrap().len(), 1);
    assert_eq!(db.event_count().await.unwrap(), output.events.len() as i64);
}

#[tokio::test]
async fn test_older_version_never_overwrites() {
    let db = Database::in_memory().await.unwrap();
    let mut output = sample_output();
    db.save_batch(&output).await.unwrap();
    let id = output.properties[0].id;
    let current = output.properties[0].version;

    output.properties[0].version = current - 1;
    output.properties[0].recommended_price = None;
    output.events.clear();
    db.save_batch(&output).await.unwrap();

    let stored = db.get_property(id).await.unwrap().unwrap();
    assert_eq!(stored.version, current);
    assert!(stored.recommended_price.is_some());
}

#[tokio::test]
async fn test_risky_properties_filters_by_tier() {
    let db = Database::in_memory().await.unwrap();
    let mut output = sample_output();
    for signal in &mut output.fraud_signals {
        signal.tier = RiskTier::Medium;
    }
    db.save_batch(&output).await.unwrap();

    assert_eq!(db.risky_properties(RiskTier::Low).await.unwrap().len(), output.fraud_signals.len());
    assert!(db.risky_properties(RiskTier::High).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_connect_creates_file() {
    let path = std::env::temp_dir()
        .join(format!("estate-db-{}", uuid::Uuid::new_v4()))
        .join("estate.db");
    let db = Database::connect(&path).await.unwrap();
    db.save_batch(&sample_output()).await.unwrap();
    assert!(path.exists());

    if let Some(parent) = path.parent() {
        let _ = std::fs::remove_dir_all(parent);
    }
}

#[tokio::test]
async fn test_restart_resumes_from_saved_state() {
    let db = Database::in_memory().await.unwrap();
    let snapshot = ConfigHandle::fixed(engine_config()).snapshot();
    let batch = vec![raw_listing("halooglasi", "1", day(0)), raw_listing("nekretnine", "77", day(0))];

    let first_run = Engine::new();
    let output = first_run.process_batch(&snapshot, batch.clone(), day(0)).unwrap();
    db.save_batch(&output).await.unwrap();
    let saved = output.properties[0].clone();

    let restarted = Engine::new();
    let restored = restarted.restore(
        db.load_properties().await.unwrap(),
        db.load_valuations().await.unwrap(),
        db.load_fraud_signals().await.unwrap(),
    );
    assert_eq!(restored, 1);
    assert_eq!(restarted.store().all(), first_run.store().all());

    // The same listings resolve into the restored property
    let again = restarted.process_batch(&snapshot, batch, day(0)).unwrap();
    assert!(again.properties.is_empty());
    assert!(again.valuations.is_empty());
    assert!(again.fraud_signals.is_empty());
    assert!(again.events.is_empty());

    // A new flat gets a fresh id instead of overwriting the stored one
    let mut other = raw_listing("4zida", "5", day(1));
    other.neighborhood = Some("Zvezdara".to_string());
    other.latitude = Some("44.7900".to_string());
    other.street = Some("Bulevar kralja Aleksandra 300".to_string());
    other.image_hashes = vec!["img-z".to_string()];
    let fresh = restarted.process_batch(&snapshot, vec![other], day(1)).unwrap();
    db.save_batch(&fresh).await.unwrap();

    let created = fresh.properties.iter().find(|p| p.partition.neighborhood == "zvezdara").unwrap();
    assert!(created.id > saved.id);
    assert_eq!(db.get_property(saved.id).await.unwrap().unwrap(), saved);
    assert_eq!(db.load_properties().await.unwrap().len(), 2);
}
