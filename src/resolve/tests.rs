use super::*;
use crate::config::PricingConfig;
use crate::pricing::PriceReconciler;
use crate::testing::{day, listing};
use crate::types::{GeoPoint, HeatingType};
use rust_decimal_macros::dec;

fn resolve(store: &ClusterStore, config: &ResolverConfig, listing: NormalizedListing) -> Result<Resolution> {
    Resolver::new(store, config).resolve(listing)
}

fn partition_of(store: &ClusterStore, listing: &NormalizedListing) -> std::sync::Arc<parking_lot::Mutex<Partition>> {
    store.partition(&listing.partition_key())
}

#[test]
fn test_first_listing_creates_singleton() {
    let store = ClusterStore::new();
    let config = ResolverConfig::default();

    let resolution = resolve(&store, &config, listing("a", "1", day(0))).unwrap();
    let Resolution::Created(id) = resolution else {
        panic!("expected a new cluster, got {:?}", resolution);
    };

    let cluster = store.get(id).unwrap();
    assert_eq!(cluster.members.len(), 1);
    assert_eq!(cluster.version, 1);
    assert_eq!(cluster.status, ClusterStatus::Active);
    assert_eq!(store.locate(&ListingKey::new("a", "1")).unwrap().neighborhood, "vracar");
}

#[test]
fn test_resubmission_is_idempotent() {
    let store = ClusterStore::new();
    let config = ResolverConfig::default();

    let id = resolve(&store, &config, listing("a", "1", day(0))).unwrap().home();
    let before = store.get(id).unwrap();

    let again = resolve(&store, &config, listing("a", "1", day(3))).unwrap();
    assert_eq!(again, Resolution::Unchanged(id));

    let after = store.get(id).unwrap();
    assert_eq!(after.version, before.version);
    assert_eq!(after.representative, before.representative);
    assert_eq!(after.members[&ListingKey::new("a", "1")].last_confirmed, day(3));
    assert_eq!(store.cluster_count(), 1);
}

#[test]
fn test_cross_source_duplicate_joins() {
    let store = ClusterStore::new();
    let config = ResolverConfig::default();

    let id = resolve(&store, &config, listing("a", "1", day(0))).unwrap().home();

    let mut copy = listing("b", "77", day(1));
    copy.street = Some("njegoseva 12a".to_string());
    copy.image_hashes.insert("img-c".to_string());
    let resolution = resolve(&store, &config, copy).unwrap();
    assert_eq!(resolution, Resolution::Joined(id));

    let cluster = store.get(id).unwrap();
    assert_eq!(cluster.members.len(), 2);
    assert_eq!(cluster.version, 2);
    assert_eq!(cluster.representative.image_hashes.len(), 3);
    assert_eq!(cluster.sources().len(), 2);
}

#[test]
fn test_same_source_never_joins() {
    let store = ClusterStore::new();
    let config = ResolverConfig::default();

    let first = resolve(&store, &config, listing("a", "1", day(0))).unwrap().home();
    let second = resolve(&store, &config, listing("a", "2", day(0))).unwrap();
    assert!(matches!(second, Resolution::Created(id) if id != first));
}

#[test]
fn test_distant_listing_creates_new_cluster() {
    let store = ClusterStore::new();
    let config = ResolverConfig::default();

    resolve(&store, &config, listing("a", "1", day(0))).unwrap();

    let mut other = listing("b", "1", day(0));
    other.geo = Some(GeoPoint { lat: 44.8105, lon: 20.4880 });
    other.street = Some("krunska 40".to_string());
    other.image_hashes = ["img-z".to_string()].into_iter().collect();
    assert!(matches!(resolve(&store, &config, other).unwrap(), Resolution::Created(_)));
    assert_eq!(store.cluster_count(), 2);
}

#[test]
fn test_area_outside_band_is_filtered() {
    let store = ClusterStore::new();
    let config = ResolverConfig::default();

    resolve(&store, &config, listing("a", "1", day(0))).unwrap();
    let mut bigger = listing("b", "1", day(0));
    bigger.area_m2 = dec!(80);
    assert!(matches!(resolve(&store, &config, bigger).unwrap(), Resolution::Created(_)));
}

#[test]
fn test_ambiguous_match_is_held() {
    let store = ClusterStore::new();
    let config = ResolverConfig::default();

    // Two same-source twins can never join each other
    let first = resolve(&store, &config, listing("a", "1", day(0))).unwrap().home();
    let second = resolve(&store, &config, listing("a", "2", day(0))).unwrap().home();

    let err = resolve(&store, &config, listing("b", "9", day(1))).unwrap_err();
    match err {
        EngineError::AmbiguousMatch { key, candidates } => {
            assert_eq!(key, ListingKey::new("b", "9"));
            assert_eq!(candidates, vec![first, second]);
        }
        other => panic!("expected ambiguity, got {}", other),
    }
    assert_eq!(store.unresolved(), vec![ListingKey::new("b", "9")]);
    assert_eq!(store.cluster_count(), 2);

    // Still ambiguous on retry; stays held
    let handle = partition_of(&store, &listing("b", "9", day(1)));
    let mut partition = handle.lock();
    let retried = Resolver::new(&store, &config).retry_held(&mut partition);
    assert_eq!(retried.len(), 1);
    assert!(retried[0].1.is_err());
    assert_eq!(partition.held_keys().len(), 1);
}

#[test]
fn test_changed_content_updates_in_place() {
    let store = ClusterStore::new();
    let config = ResolverConfig::default();

    let id = resolve(&store, &config, listing("a", "1", day(0))).unwrap().home();

    let mut update = listing("a", "1", day(2));
    update.fingerprint = "changed".to_string();
    update.heating = HeatingType::Gas;
    let resolution = resolve(&store, &config, update).unwrap();
    assert_eq!(
        resolution,
        Resolution::Updated {
            cluster_id: id,
            split_off: None
        }
    );

    let cluster = store.get(id).unwrap();
    assert_eq!(cluster.version, 2);
    assert_eq!(cluster.representative.heating, HeatingType::Gas);
}

#[test]
fn test_late_older_scrape_does_not_overwrite() {
    let store = ClusterStore::new();
    let config = ResolverConfig::default();

    let mut newer = listing("a", "1", day(5));
    newer.fingerprint = "newer".to_string();
    let id = resolve(&store, &config, newer).unwrap().home();

    let mut older = listing("a", "1", day(1));
    older.heating = HeatingType::Electric;
    assert_eq!(resolve(&store, &config, older).unwrap(), Resolution::Unchanged(id));
    assert_eq!(store.get(id).unwrap().representative.heating, HeatingType::CentralCity);
}

#[test]
fn test_contradicting_update_splits() {
    let store = ClusterStore::new();
    let config = ResolverConfig::default();

    let id = resolve(&store, &config, listing("a", "1", day(0))).unwrap().home();
    assert_eq!(resolve(&store, &config, listing("b", "1", day(0))).unwrap(), Resolution::Joined(id));

    // The second site now places the listing 2 km away
    let mut moved = listing("b", "1", day(3));
    moved.fingerprint = "moved".to_string();
    moved.geo = Some(GeoPoint { lat: 44.8185, lon: 20.4780 });
    let resolution = resolve(&store, &config, moved).unwrap();

    let Resolution::Updated {
        cluster_id,
        split_off: Some(new_id),
    } = resolution
    else {
        panic!("expected a split, got {:?}", resolution);
    };
    assert_eq!(cluster_id, id);
    assert_eq!(resolution.home(), new_id);

    let source = store.get(id).unwrap();
    assert_eq!(source.status, ClusterStatus::Split);
    assert_eq!(source.members.len(), 1);
    let detached = store.get(new_id).unwrap();
    assert!(detached.members.contains_key(&ListingKey::new("b", "1")));
}

#[test]
fn test_conflicting_legal_status_splits() {
    let store = ClusterStore::new();
    let config = ResolverConfig::default();

    let id = resolve(&store, &config, listing("a", "1", day(0))).unwrap().home();
    resolve(&store, &config, listing("b", "1", day(0))).unwrap();

    let mut update = listing("b", "1", day(1));
    update.fingerprint = "legal".to_string();
    update.legal_status = LegalStatus::Unregistered;
    let resolution = resolve(&store, &config, update).unwrap();
    assert!(matches!(resolution, Resolution::Updated { split_off: Some(_), .. }));
    assert_eq!(store.get(id).unwrap().members.len(), 1);
}

#[test]
fn test_split_preserves_observation_count() {
    let store = ClusterStore::new();
    let config = ResolverConfig::default();
    let pricing = PriceReconciler::new(PricingConfig::default());

    let id = resolve(&store, &config, listing("a", "1", day(0))).unwrap().home();
    resolve(&store, &config, listing("b", "1", day(1))).unwrap();

    {
        let handle = partition_of(&store, &listing("a", "1", day(0)));
        let mut partition = handle.lock();
        let cluster = partition.cluster_mut(id).unwrap();
        let a = ListingKey::new("a", "1");
        let b = ListingKey::new("b", "1");
        assert!(pricing.observe(cluster, &a, dec!(125000), day(0)));
        assert!(pricing.observe(cluster, &b, dec!(128000), day(1)));
        assert!(pricing.observe(cluster, &a, dec!(120000), day(5)));
        assert_eq!(cluster.price_history.len(), 3);
    }

    let outcome = Resolver::new(&store, &config)
        .split(id, &ListingKey::new("a", "1"), day(6))
        .unwrap()
        .unwrap();
    assert_eq!(outcome.moved_observations, 2);

    let source = store.get(id).unwrap();
    let detached = store.get(outcome.new_cluster).unwrap();
    assert_eq!(source.price_history.len() + detached.price_history.len(), 3);
    assert!(detached.price_history.iter().all(|o| o.key == ListingKey::new("a", "1")));
    assert!(source.version > 2);
    assert_eq!(detached.members[&ListingKey::new("a", "1")].first_seen, day(0));
}

#[test]
fn test_split_of_singleton_is_noop() {
    let store = ClusterStore::new();
    let config = ResolverConfig::default();

    let id = resolve(&store, &config, listing("a", "1", day(0))).unwrap().home();
    let outcome = Resolver::new(&store, &config)
        .split(id, &ListingKey::new("a", "1"), day(1))
        .unwrap();
    assert!(outcome.is_none());
    assert_eq!(store.get(id).unwrap().version, 1);
}

#[test]
fn test_split_unknown_ids() {
    let store = ClusterStore::new();
    let config = ResolverConfig::default();
    let resolver = Resolver::new(&store, &config);

    let err = resolver.split(ClusterId(999), &ListingKey::new("a", "1"), day(0)).unwrap_err();
    assert!(matches!(err, EngineError::UnknownCluster(ClusterId(999))));

    let id = resolver.resolve(listing("a", "1", day(0))).unwrap().home();
    let err = resolver.split(id, &ListingKey::new("x", "x"), day(0)).unwrap_err();
    assert!(matches!(err, EngineError::UnknownMember { .. }));
}

#[test]
fn test_consolidation_merges_into_lower_id() {
    let store = ClusterStore::new();
    let config = ResolverConfig::default();
    let resolver = Resolver::new(&store, &config);

    // a:1 first appears at a wrong location, so b:1 starts its own cluster
    let mut misplaced = listing("a", "1", day(0));
    misplaced.geo = Some(GeoPoint { lat: 44.8185, lon: 20.4780 });
    misplaced.street = Some("krunska 40".to_string());
    misplaced.image_hashes.clear();
    let first = resolver.resolve(misplaced).unwrap().home();
    let second = resolver.resolve(listing("b", "1", day(0))).unwrap().home();
    assert_ne!(first, second);

    // Corrected later; both clusters now describe one unit
    let mut corrected = listing("a", "1", day(2));
    corrected.fingerprint = "corrected".to_string();
    resolver.resolve(corrected).unwrap();

    let handle = partition_of(&store, &listing("a", "1", day(0)));
    let mut partition = handle.lock();
    let merges = resolver.consolidate_in(&mut partition, day(2));
    assert_eq!(merges.len(), 1);
    assert_eq!(merges[0].survivor, first);
    assert_eq!(merges[0].absorbed, second);

    let survivor = partition.cluster(first).unwrap();
    assert_eq!(survivor.members.len(), 2);
    let tombstone = partition.cluster(second).unwrap();
    assert_eq!(tombstone.status, ClusterStatus::Merged { into: first });
    assert!(tombstone.members.is_empty());
    assert_eq!(partition.cluster_of(&ListingKey::new("b", "1")), Some(first));

    // Nothing left to merge
    assert!(resolver.consolidate_in(&mut partition, day(2)).is_empty());
}

#[test]
fn test_consolidation_respects_split() {
    let store = ClusterStore::new();
    let config = ResolverConfig::default();
    let resolver = Resolver::new(&store, &config);

    let id = resolver.resolve(listing("a", "1", day(0))).unwrap().home();
    resolver.resolve(listing("b", "1", day(0))).unwrap();
    resolver.split(id, &ListingKey::new("b", "1"), day(1)).unwrap().unwrap();

    let handle = partition_of(&store, &listing("a", "1", day(0)));
    let mut partition = handle.lock();
    assert!(resolver.consolidate_in(&mut partition, day(1)).is_empty());
}

#[test]
fn test_neighborhood_change_moves_listing() {
    let store = ClusterStore::new();
    let config = ResolverConfig::default();
    let pricing = PriceReconciler::new(PricingConfig::default());
    let resolver = Resolver::new(&store, &config);

    let old_id = resolver.resolve(listing("a", "1", day(0))).unwrap().home();
    {
        let handle = partition_of(&store, &listing("a", "1", day(0)));
        let mut partition = handle.lock();
        let cluster = partition.cluster_mut(old_id).unwrap();
        pricing.observe(cluster, &ListingKey::new("a", "1"), dec!(125000), day(0));
    }

    let mut moved = listing("a", "1", day(1));
    moved.fingerprint = "moved".to_string();
    moved.neighborhood = "zvezdara".to_string();
    let resolution = resolver.resolve(moved).unwrap();
    let Resolution::Created(new_id) = resolution else {
        panic!("expected a new cluster, got {:?}", resolution);
    };

    assert!(store.get(old_id).is_none());
    let cluster = store.get(new_id).unwrap();
    assert_eq!(cluster.partition.neighborhood, "zvezdara");
    assert_eq!(cluster.price_history.len(), 1);
    assert_eq!(store.locate(&ListingKey::new("a", "1")).unwrap().neighborhood, "zvezdara");
}

#[test]
fn test_begin_pass_clears_split_marks() {
    let store = ClusterStore::new();
    let config = ResolverConfig::default();
    let resolver = Resolver::new(&store, &config);

    let id = resolver.resolve(listing("a", "1", day(0))).unwrap().home();
    resolver.resolve(listing("b", "1", day(0))).unwrap();
    resolver.split(id, &ListingKey::new("b", "1"), day(1)).unwrap();
    let version = store.get(id).unwrap().version;

    store.begin_pass(day(2));
    let cluster = store.get(id).unwrap();
    assert_eq!(cluster.status, ClusterStatus::Active);
    assert_eq!(cluster.version, version);
}

#[test]
fn test_restore_indexes_members_and_continues_ids() {
    let store = ClusterStore::new();
    let mut older = CanonicalProperty::singleton(ClusterId(4), listing("a", "1", day(0)));
    older.members.insert(ListingKey::new("b", "2"), MemberRecord::new(listing("b", "2", day(0))));
    // The listing "b:2" later moved into cluster 9
    let mut newer = CanonicalProperty::singleton(ClusterId(9), listing("b", "2", day(5)));
    newer.updated_at = day(5);
    let emptied = CanonicalProperty::singleton(ClusterId(12), listing("a", "1", day(-3)));

    let restored = store.restore(vec![older, emptied, newer]);

    assert_eq!(restored, 2);
    assert_eq!(store.get(ClusterId(9)).unwrap().members.len(), 1);
    let older = store.get(ClusterId(4)).unwrap();
    assert_eq!(older.members.keys().cloned().collect::<Vec<_>>(), vec![ListingKey::new("a", "1")]);
    assert!(store.get(ClusterId(12)).is_none());
    assert_eq!(store.locate(&ListingKey::new("b", "2")).unwrap().neighborhood, "vracar");
    assert_eq!(store.next_id(), ClusterId(13));
    assert_eq!(store.city_epoch("Beograd"), 1);

    // A restored listing resolves into its cluster instead of a new one
    let config = ResolverConfig::default();
    let resolution = resolve(&store, &config, listing("a", "1", day(0))).unwrap();
    assert_eq!(resolution, Resolution::Unchanged(ClusterId(4)));
}
