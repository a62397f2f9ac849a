//! Zone store integration tests
//!
//! These run against a live redis at `redis://127.0.0.1:6379` and are
//! ignored by default:
//!
//! ```text
//! cargo test -p pendingdns-store -- --ignored
//! ```
//!
//! Each test works in its own zone so runs do not interfere.

use serde_json::json;

use pendingdns_store::names::parse_id;
use pendingdns_store::zone::HEALTH_QUEUE_KEY;
use pendingdns_store::{KeyStore, RecordSource, RecordType, RecordValue, ZoneStore};

const REDIS_URL: &str = "redis://127.0.0.1:6379";

async fn store() -> ZoneStore {
    let ks = KeyStore::connect(REDIS_URL, None)
        .await
        .expect("redis available");
    ZoneStore::new(ks)
}

async fn clear_zone(zone: &ZoneStore, name: &str) {
    for record in zone.list(name).await.unwrap() {
        if let Some(id) = record.id {
            zone.delete(name, &id).await.unwrap();
        }
    }
}

#[tokio::test]
#[ignore = "requires redis"]
async fn test_add_then_resolve() {
    let zone = store().await;
    let apex = "zs-add.example.test";
    clear_zone(&zone, apex).await;

    let id = zone
        .add(apex, "", RecordType::A, &json!(["1.2.3.4"]), None)
        .await
        .unwrap()
        .expect("record accepted");

    let rows = zone.resolve(apex, RecordType::A, false).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(
        rows[0].value,
        RecordValue::A {
            address: "1.2.3.4".into(),
            health_check: None
        }
    );
    assert_eq!(rows[0].id.as_deref(), Some(id.as_str()));

    clear_zone(&zone, apex).await;
}

#[tokio::test]
#[ignore = "requires redis"]
async fn test_id_roundtrip_through_store() {
    let zone = store().await;
    let apex = "zs-id.example.test";
    clear_zone(&zone, apex).await;

    let id = zone
        .add(apex, "www", RecordType::Cname, &json!(["@"]), None)
        .await
        .unwrap()
        .unwrap();

    let (reversed, rtype, _hid) = parse_id(&id).expect("id parses");
    assert_eq!(reversed, "test.example.zs-id.www");
    assert_eq!(rtype, RecordType::Cname);

    clear_zone(&zone, apex).await;
}

#[tokio::test]
#[ignore = "requires redis"]
async fn test_wildcard_fallback_and_precedence() {
    let zone = store().await;
    let apex = "zs-wild.example.test";
    clear_zone(&zone, apex).await;

    zone.add(
        apex,
        "*.sub",
        RecordType::Cname,
        &json!(["target.example.test"]),
        None,
    )
    .await
    .unwrap()
    .unwrap();

    // Wildcard matches and is tagged with the matching wildcard name.
    let name = format!("leaf.sub.{}", apex);
    let rows = zone.resolve(&name, RecordType::Cname, false).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].wildcard.as_deref(), Some("*.sub.zs-wild.example.test"));

    // An exact record at the same position beats the wildcard.
    zone.add(
        apex,
        "leaf.sub",
        RecordType::Cname,
        &json!(["exact.example.test"]),
        None,
    )
    .await
    .unwrap()
    .unwrap();

    let rows = zone.resolve(&name, RecordType::Cname, false).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].wildcard.is_none());
    assert_eq!(
        rows[0].value,
        RecordValue::Cname {
            target: "exact.example.test".into()
        }
    );

    clear_zone(&zone, apex).await;
}

#[tokio::test]
#[ignore = "requires redis"]
async fn test_update_in_place_keeps_id() {
    let zone = store().await;
    let apex = "zs-upd.example.test";
    clear_zone(&zone, apex).await;

    let id = zone
        .add(apex, "www", RecordType::A, &json!(["10.0.0.1"]), None)
        .await
        .unwrap()
        .unwrap();

    let same = zone
        .update(apex, &id, "www", RecordType::A, &json!(["10.0.0.2"]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(same, id);

    let rows = zone.resolve(&format!("www.{}", apex), RecordType::A, false).await.unwrap();
    assert_eq!(
        rows[0].value,
        RecordValue::A {
            address: "10.0.0.2".into(),
            health_check: None
        }
    );

    // Moving the record to a new name produces a new id.
    let moved = zone
        .update(apex, &id, "app", RecordType::A, &json!(["10.0.0.2"]))
        .await
        .unwrap()
        .unwrap();
    assert_ne!(moved, id);
    assert!(zone
        .resolve(&format!("www.{}", apex), RecordType::A, false)
        .await
        .unwrap()
        .is_empty());

    clear_zone(&zone, apex).await;
}

#[tokio::test]
#[ignore = "requires redis"]
async fn test_delete_sweeps_zone_index() {
    let zone = store().await;
    let apex = "zs-del.example.test";
    clear_zone(&zone, apex).await;

    let id = zone
        .add(apex, "", RecordType::Txt, &json!(["hello"]), None)
        .await
        .unwrap()
        .unwrap();

    assert!(zone.delete(apex, &id).await.unwrap());
    // Second delete: the field no longer exists.
    assert!(!zone.delete(apex, &id).await.unwrap());

    assert!(zone.list(apex).await.unwrap().is_empty());
}

#[tokio::test]
#[ignore = "requires redis"]
async fn test_delete_by_domain_with_value_match() {
    let zone = store().await;
    let apex = "zs-delby.example.test";
    clear_zone(&zone, apex).await;

    zone.add(apex, "", RecordType::Txt, &json!(["keep"]), None)
        .await
        .unwrap()
        .unwrap();
    zone.add(apex, "", RecordType::Txt, &json!(["drop"]), None)
        .await
        .unwrap()
        .unwrap();

    let removed = zone
        .delete_by_domain(apex, RecordType::Txt, Some(&json!(["drop"])))
        .await
        .unwrap();
    assert_eq!(removed, 1);

    let rows = zone.resolve(apex, RecordType::Txt, true).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(
        rows[0].value,
        RecordValue::Txt {
            data: b"keep".to_vec()
        }
    );

    let removed = zone
        .delete_by_domain(apex, RecordType::Txt, None)
        .await
        .unwrap();
    assert_eq!(removed, 1);
}

#[tokio::test]
#[ignore = "requires redis"]
async fn test_list_orders_types_and_mx_priorities() {
    let zone = store().await;
    let apex = "zs-list.example.test";
    clear_zone(&zone, apex).await;

    zone.add(apex, "", RecordType::Mx, &json!(["mx1.example.test", 10]), None)
        .await
        .unwrap()
        .unwrap();
    zone.add(apex, "", RecordType::Mx, &json!(["mx2.example.test", 1]), None)
        .await
        .unwrap()
        .unwrap();
    zone.add(apex, "", RecordType::A, &json!(["10.1.1.1"]), None)
        .await
        .unwrap()
        .unwrap();

    let records = zone.list(apex).await.unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(records[0].rtype, RecordType::A);
    assert_eq!(
        records[1].value,
        RecordValue::Mx {
            exchange: "mx2.example.test".into(),
            priority: 1
        }
    );
    assert_eq!(
        records[2].value,
        RecordValue::Mx {
            exchange: "mx1.example.test".into(),
            priority: 10
        }
    );

    clear_zone(&zone, apex).await;
}

#[tokio::test]
#[ignore = "requires redis"]
async fn test_health_queue_follows_record_lifecycle() {
    let zone = store().await;
    let apex = "zs-health.example.test";
    clear_zone(&zone, apex).await;

    let id = zone
        .add(
            apex,
            "",
            RecordType::A,
            &json!(["10.2.2.2", "tcp://10.2.2.2:80"]),
            None,
        )
        .await
        .unwrap()
        .unwrap();

    let member = format!("test.example.zs-health:{}", id);
    let score = zone
        .keystore()
        .zscore(HEALTH_QUEUE_KEY, &member)
        .await
        .unwrap();
    assert!(score.is_some(), "record with health URI is scheduled");

    // Clearing the health URI drops the schedule entry.
    zone.update(apex, &id, "", RecordType::A, &json!(["10.2.2.2"]))
        .await
        .unwrap()
        .unwrap();
    let score = zone
        .keystore()
        .zscore(HEALTH_QUEUE_KEY, &member)
        .await
        .unwrap();
    assert!(score.is_none(), "schedule entry removed with the URI");

    clear_zone(&zone, apex).await;
}

#[tokio::test]
#[ignore = "requires redis"]
async fn test_resolve_zone_prefers_longest_suffix() {
    let zone = store().await;
    let outer = "zs-zone.example.test";
    let inner = format!("sub.{}", outer);
    clear_zone(&zone, outer).await;
    clear_zone(&zone, &inner).await;

    zone.add(outer, "", RecordType::Txt, &json!(["outer"]), None)
        .await
        .unwrap()
        .unwrap();
    zone.add(&inner, "", RecordType::Txt, &json!(["inner"]), None)
        .await
        .unwrap()
        .unwrap();

    let resolved = zone
        .resolve_zone(&format!("deep.{}", inner))
        .await
        .unwrap();
    assert_eq!(resolved.as_deref(), Some(inner.as_str()));

    let resolved = zone.resolve_zone(&format!("x.{}", outer)).await.unwrap();
    assert_eq!(resolved.as_deref(), Some(outer));

    clear_zone(&zone, outer).await;
    clear_zone(&zone, &inner).await;
}
