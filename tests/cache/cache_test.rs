//! Layered cache behavior: round-trips, restart recovery, cold-load
//! collapsing, namespacing and the cleanup sweep.

use std::collections::BTreeMap;
use std::sync::Arc;

use tessera::cache::{
    BlobStore, DataKey, MemoryStoreFactory, StaticCluster, StoreFactory, TableCache,
};
use tessera::config::CacheSettings;
use tessera::lens::TableData;
use tessera::model::{ExecMode, TableAssembly, Value};

fn key(seed: &str) -> DataKey {
    let asm = TableAssembly::bound(seed, "db", seed);
    DataKey::compute(
        &asm,
        &BTreeMap::new(),
        "user",
        ExecMode::Runtime,
        false,
        0,
        0,
        false,
    )
    .unwrap()
}

fn table() -> Arc<TableData> {
    Arc::new(TableData::new(
        vec!["id".into(), "name".into()],
        vec![
            vec![Value::Int(1), Value::Str("a".into())],
            vec![Value::Int(2), Value::Str("b".into())],
        ],
    ))
}

fn new_cache(factory: &Arc<MemoryStoreFactory>) -> Arc<TableCache> {
    let cluster = Arc::new(StaticCluster::with_incarnation("inc1"));
    Arc::new(
        TableCache::new(
            &CacheSettings::default(),
            Arc::clone(factory) as Arc<dyn StoreFactory>,
            cluster,
        )
        .unwrap(),
    )
}

#[test]
fn test_round_trip_within_process() {
    let factory = Arc::new(MemoryStoreFactory::new());
    let cache = new_cache(&factory);
    let k = key("orders");
    cache.put("acme", &k, table());
    let got = cache.get("acme", &k).unwrap();
    assert_eq!(got.headers, vec!["id".to_string(), "name".to_string()]);
    assert_eq!(got.data_rows(), 2);
    assert_eq!(got.rows[1][1], Value::Str("b".into()));
}

#[test]
fn test_round_trip_across_restart() {
    let factory = Arc::new(MemoryStoreFactory::new());
    let first = new_cache(&factory);
    let k = key("orders");
    first.put("acme", &k, table());
    first.flush();
    drop(first);

    // A second cache over the same store: the local tier is empty, so
    // this exercises the distributed path only.
    let second = new_cache(&factory);
    let got = second.get("acme", &k).expect("store-backed hit");
    assert_eq!(got.data_rows(), 2);
    assert_eq!(got.rows[0][0], Value::Int(1));
}

#[test]
fn test_cold_load_deserializes_once() {
    let factory = Arc::new(MemoryStoreFactory::new());
    let warm = new_cache(&factory);
    let k = key("orders");
    warm.put("acme", &k, table());
    warm.flush();
    drop(warm);

    let cold = new_cache(&factory);
    let store = factory.store(&TableCache::namespace("acme"));
    let before = store.read_calls();

    std::thread::scope(|s| {
        for _ in 0..8 {
            let cache = Arc::clone(&cold);
            let k = &k;
            s.spawn(move || {
                assert!(cache.get("acme", k).is_some());
            });
        }
    });

    // Eight concurrent cold gets collapse into one store read.
    assert_eq!(store.read_calls() - before, 1);
}

#[test]
fn test_tenant_isolation() {
    let factory = Arc::new(MemoryStoreFactory::new());
    let cache = new_cache(&factory);
    let k = key("orders");
    cache.put("tenant_a", &k, table());
    cache.flush();
    assert!(cache.get("tenant_b", &k).is_none());
    // Case-normalized namespace: Tenant_A and tenant_a are one.
    assert!(cache.get("Tenant_A", &k).is_some());
}

#[test]
fn test_sweep_removes_stale_entries() {
    let factory = Arc::new(MemoryStoreFactory::new());
    let cache = new_cache(&factory);
    let fresh = key("fresh");
    let old = key("old");
    cache.put("acme", &fresh, table());
    cache.put("acme", &old, table());
    cache.flush();

    let store = factory.store(&TableCache::namespace("acme"));
    // Foreign-incarnation entry plus one past the retention window.
    store.write("inc0:left_over", b"{}").unwrap();
    let old_key = format!("inc1:{}", old.as_str());
    store.backdate(&old_key, 60 * 60);

    let stats = cache.sweep_once("acme").expect("sweep owner");
    assert_eq!(stats.deleted_foreign, 1);
    assert_eq!(stats.deleted_expired, 1);
    assert!(store.exists(&format!("inc1:{}", fresh.as_str())).unwrap());
}

#[test]
fn test_closed_handle_reacquired() {
    let factory = Arc::new(MemoryStoreFactory::new());
    let cache = new_cache(&factory);
    let k = key("orders");
    cache.put("acme", &k, table());
    cache.flush();

    // Simulate the store handle closing under us.
    factory.store(&TableCache::namespace("acme")).close();

    let k2 = key("customers");
    cache.put("acme", &k2, table());
    cache.flush();
    let store = factory.store(&TableCache::namespace("acme"));
    assert!(store
        .exists(&format!("inc1:{}", k2.as_str()))
        .unwrap());
}

#[test]
fn test_store_failure_degrades_to_miss() {
    let factory = Arc::new(MemoryStoreFactory::new());
    let cache = new_cache(&factory);
    let k = key("orders");
    // Corrupt bytes in the store: read succeeds, deserialize fails,
    // caller sees a miss rather than an error.
    let store = factory.store(&TableCache::namespace("acme"));
    store
        .write(&format!("inc1:{}", k.as_str()), b"not json")
        .unwrap();
    assert!(cache.get("acme", &k).is_none());
}
