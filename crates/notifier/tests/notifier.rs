use std::sync::Arc;
use std::time::Duration;

use claimsrv_claims::{Account, Claims};
use claimsrv_notifier::Notifier;
use claimsrv_store::Store;
use nkeys::KeyPair;

fn account_claim() -> (String, String) {
    let operator = KeyPair::new_operator();
    let account = KeyPair::new_account();
    let claims = Claims::<Account>::new(account.public_key(), operator.public_key());
    (account.public_key(), claims.encode(&operator).unwrap())
}

#[tokio::test]
async fn integration_test_publish_account_is_applied_by_a_peer() -> anyhow::Result<()> {
    let client = async_nats::connect("127.0.0.1:4222").await?;

    let publisher = Notifier::with_client(client.clone(), "node-a");
    let subscriber = Notifier::with_client(client, "node-b");

    let store = Arc::new(Store::open_in_memory(false));
    let run_store = store.clone();
    tokio::spawn(async move {
        let _ = subscriber
            .run("", async_nats::ConnectOptions::new(), run_store, Duration::from_secs(3600))
            .await;
    });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let (key, encoded) = account_claim();
    publisher.publish_account(&key, &encoded).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(store.load(&key)?, encoded);
    Ok(())
}

#[tokio::test]
async fn integration_test_self_originated_update_is_not_reapplied() -> anyhow::Result<()> {
    let client = async_nats::connect("127.0.0.1:4222").await?;
    let node = Notifier::with_client(client, "node-solo");

    let store = Arc::new(Store::open_in_memory(false));
    let run_store = store.clone();
    let node = Arc::new(node);
    let run_node = node.clone();
    tokio::spawn(async move {
        let _ = run_node
            .run("", async_nats::ConnectOptions::new(), run_store, Duration::from_secs(3600))
            .await;
    });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let (key, encoded) = account_claim();
    node.publish_account(&key, &encoded).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    // The node republishes its own message and must not loop on it; a
    // successful load here only shows the first external apply worked,
    // so the real assertion is that this does not hang or duplicate.
    assert_eq!(store.load(&key)?, encoded);
    Ok(())
}

#[tokio::test]
async fn integration_test_lookup_returns_none_when_nobody_holds_the_key() -> anyhow::Result<()> {
    let client = async_nats::connect("127.0.0.1:4222").await?;
    let notifier = Notifier::with_client(client, "node-a");

    let result = notifier
        .request_lookup("NOBODYHASTHIS", Duration::from_millis(300))
        .await?;
    assert!(result.is_none());
    Ok(())
}

#[tokio::test]
async fn integration_test_lookup_returns_claim_held_by_a_peer() -> anyhow::Result<()> {
    let client = async_nats::connect("127.0.0.1:4222").await?;
    let requester = Notifier::with_client(client.clone(), "node-a");
    let responder = Notifier::with_client(client, "node-b");

    let (key, encoded) = account_claim();
    let store = Arc::new(Store::open_in_memory(false));
    store.save(&key, &encoded)?;

    tokio::spawn(async move {
        let _ = responder
            .run("", async_nats::ConnectOptions::new(), store, Duration::from_secs(3600))
            .await;
    });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let result = requester
        .request_lookup(&key, Duration::from_millis(500))
        .await?;
    assert_eq!(result, Some(encoded));
    Ok(())
}
