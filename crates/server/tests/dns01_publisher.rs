//! dns-01 publication integration tests
//!
//! Require a live redis at `redis://127.0.0.1:6379`; ignored by default:
//!
//! ```text
//! cargo test -p pendingdns-server -- --ignored
//! ```

use serde_json::json;

use pendingdns_server::acme::ChallengePublisher;
use pendingdns_store::{KeyStore, RecordType, ZoneStore};

const REDIS_URL: &str = "redis://127.0.0.1:6379";

async fn publisher() -> (ChallengePublisher, ZoneStore) {
    let ks = KeyStore::connect(REDIS_URL, None)
        .await
        .expect("redis available");
    let zone = ZoneStore::new(ks);
    (ChallengePublisher::new(zone.clone()), zone)
}

#[tokio::test]
#[ignore = "requires redis"]
async fn test_set_get_remove_challenge() {
    let (publisher, zone) = publisher().await;
    let apex = "dns01-pub.example.test";

    // The zone must exist for the challenge host to resolve into it.
    let marker = zone
        .add(apex, "", RecordType::A, &json!(["192.0.2.1"]), None)
        .await
        .unwrap()
        .unwrap();

    assert!(publisher
        .set(apex, "_acme-challenge", "token-digest-value")
        .await
        .unwrap());

    let host = format!("_acme-challenge.{}", apex);
    let value = publisher.get(&host).await.unwrap();
    assert_eq!(value.as_deref(), Some("token-digest-value"));

    let zones = publisher
        .zones(&[format!("www.{}", apex), format!("*.{}", apex)])
        .await
        .unwrap();
    assert_eq!(zones, vec![apex.to_string()]);

    let removed = publisher.remove(&host).await.unwrap();
    assert_eq!(removed, 1);
    assert!(publisher.get(&host).await.unwrap().is_none());

    zone.delete(apex, &marker).await.unwrap();
}
