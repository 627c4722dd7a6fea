use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use claimsrv::http::{router, AppState};
use claimsrv::validation::ValidationPipeline;
use claimsrv_claims::{Account, Claims};
use claimsrv_notifier::Notifier;
use claimsrv_store::Store;
use nkeys::KeyPair;
use tokio::net::TcpListener;

/// Binds an ephemeral port, serves `state` on it, and returns the address.
/// The server task is detached; it lives for the duration of the test
/// process since these are short-lived integration tests, not long-running
/// services.
async fn spawn(state: Arc<AppState>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(state);
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service()).await.unwrap();
    });
    addr
}

async fn notifier(node_id: &str) -> Notifier {
    let client = async_nats::connect("127.0.0.1:4222")
        .await
        .expect("expected a local nats-server for integration tests");
    Notifier::with_client(client, node_id)
}

async fn state_with(operator: &KeyPair, node_id: &str) -> (Arc<AppState>, Arc<Store>) {
    let store = Arc::new(Store::open_in_memory(false));
    let notifier = Arc::new(notifier(node_id).await);
    let validation = Arc::new(ValidationPipeline::new(
        vec![operator.public_key()],
        None,
        Duration::from_secs(1),
        Arc::clone(&store),
        Arc::clone(&notifier),
    ));
    let state = Arc::new(AppState {
        store: Arc::clone(&store),
        notifier,
        validation,
        operator_jwt: None,
        system_account: None,
    });
    (state, store)
}

#[tokio::test]
async fn health_probe_returns_empty_body_with_no_cache_headers() {
    let operator = KeyPair::new_operator();
    let (state, _store) = state_with(&operator, "node-health").await;
    let addr = spawn(state).await;

    let resp = reqwest::get(format!("http://{addr}/jwt/v1/accounts/"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers().get("cache-control").unwrap(),
        "no-cache, no-store, must-revalidate"
    );
    assert_eq!(resp.text().await.unwrap(), "");
}

#[tokio::test]
async fn upload_then_retrieve_round_trips_the_encoded_claim() {
    let operator = KeyPair::new_operator();
    let (state, _store) = state_with(&operator, "node-upload").await;
    let addr = spawn(state).await;

    let account = KeyPair::new_account();
    let claims = Claims::<Account>::new(account.public_key(), operator.public_key());
    let encoded = claims.encode(&operator).unwrap();

    let client = reqwest::Client::new();
    let post = client
        .post(format!("http://{addr}/jwt/v1/accounts/{}", account.public_key()))
        .body(encoded.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(post.status(), 200);

    let get = client
        .get(format!("http://{addr}/jwt/v1/accounts/{}", account.public_key()))
        .send()
        .await
        .unwrap();
    assert_eq!(get.status(), 200);
    assert_eq!(get.headers().get("content-type").unwrap(), "application/jwt");
    assert_eq!(get.text().await.unwrap(), encoded);
}

#[tokio::test]
async fn expiry_check_returns_404_once_past_expires_but_plain_get_still_serves() {
    let operator = KeyPair::new_operator();
    let (state, _store) = state_with(&operator, "node-expiry").await;
    let addr = spawn(state).await;

    let account = KeyPair::new_account();
    let expires = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs()
        + 2;
    let claims = Claims::<Account>::new(account.public_key(), operator.public_key())
        .expires_at(expires);
    let encoded = claims.encode(&operator).unwrap();

    let client = reqwest::Client::new();
    let post = client
        .post(format!("http://{addr}/jwt/v1/accounts/{}", account.public_key()))
        .body(encoded)
        .send()
        .await
        .unwrap();
    assert_eq!(post.status(), 200);

    tokio::time::sleep(Duration::from_secs(3)).await;

    let checked = client
        .get(format!(
            "http://{addr}/jwt/v1/accounts/{}?check=true",
            account.public_key()
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(checked.status(), 404);

    let unchecked = client
        .get(format!("http://{addr}/jwt/v1/accounts/{}", account.public_key()))
        .send()
        .await
        .unwrap();
    assert_eq!(unchecked.status(), 200);
}

#[tokio::test]
async fn posting_an_account_notifies_subscribers_on_the_update_subject() {
    let operator = KeyPair::new_operator();
    let (state, _store) = state_with(&operator, "node-notify-server").await;
    let addr = spawn(state).await;

    let account = KeyPair::new_account();
    let subject = format!("$SYS.ACCOUNT.{}.CLAIMS.UPDATE", account.public_key());
    let sub_client = async_nats::connect("127.0.0.1:4222").await.unwrap();
    let mut sub = sub_client.subscribe(subject).await.unwrap();

    let claims = Claims::<Account>::new(account.public_key(), operator.public_key());
    let encoded = claims.encode(&operator).unwrap();
    let client = reqwest::Client::new();
    let post = client
        .post(format!("http://{addr}/jwt/v1/accounts/{}", account.public_key()))
        .body(encoded.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(post.status(), 200);

    use futures::StreamExt;
    let msg = tokio::time::timeout(Duration::from_secs(2), sub.next())
        .await
        .expect("expected a notification before the timeout")
        .expect("subscription closed unexpectedly");
    assert_eq!(String::from_utf8_lossy(&msg.payload), encoded);
}

#[tokio::test]
async fn policy_gate_rejects_untrusted_issuer_without_a_signer() {
    let operator = KeyPair::new_operator();
    let (state, _store) = state_with(&operator, "node-policy").await;
    let addr = spawn(state).await;

    let untrusted_operator = KeyPair::new_operator();
    let account = KeyPair::new_account();
    let claims = Claims::<Account>::new(account.public_key(), untrusted_operator.public_key());
    let encoded = claims.encode(&untrusted_operator).unwrap();

    let client = reqwest::Client::new();
    let post = client
        .post(format!("http://{addr}/jwt/v1/accounts/{}", account.public_key()))
        .body(encoded)
        .send()
        .await
        .unwrap();
    assert_eq!(post.status(), 400);
}

#[tokio::test]
async fn cache_control_reflects_remaining_lifetime_and_if_none_match_yields_304() {
    let operator = KeyPair::new_operator();
    let (state, _store) = state_with(&operator, "node-cache").await;
    let addr = spawn(state).await;

    let account = KeyPair::new_account();
    let claims = Claims::<Account>::new(account.public_key(), operator.public_key());
    let encoded = claims.encode(&operator).unwrap();
    let jti = claims.id.clone();

    let client = reqwest::Client::new();
    client
        .post(format!("http://{addr}/jwt/v1/accounts/{}", account.public_key()))
        .body(encoded)
        .send()
        .await
        .unwrap();

    let get = client
        .get(format!("http://{addr}/jwt/v1/accounts/{}", account.public_key()))
        .send()
        .await
        .unwrap();
    let cache_control = get.headers().get("cache-control").unwrap().to_str().unwrap().to_string();
    assert!(cache_control.contains("stale-while-revalidate=3600"));
    assert!(cache_control.contains("stale-if-error=3600"));
    assert_eq!(get.headers().get("etag").unwrap(), &format!("\"{jti}\""));

    let not_modified = client
        .get(format!("http://{addr}/jwt/v1/accounts/{}", account.public_key()))
        .header("if-none-match", format!("\"{jti}\""))
        .send()
        .await
        .unwrap();
    assert_eq!(not_modified.status(), 304);
}

#[tokio::test]
async fn replica_bootstrap_pulls_a_bounded_pack_from_the_primary() {
    let operator = KeyPair::new_operator();
    let (primary_state, primary_store) = state_with(&operator, "node-primary").await;
    let primary_addr = spawn(primary_state).await;

    for _ in 0..100 {
        let account = KeyPair::new_account();
        let claims = Claims::<Account>::new(account.public_key(), operator.public_key());
        let encoded = claims.encode(&operator).unwrap();
        primary_store.save(&account.public_key(), &encoded).unwrap();
    }

    let replica_store = Store::open_in_memory(false);
    let client = reqwest::Client::new();
    claimsrv::bootstrap::run(
        &replica_store,
        Some(&format!("http://{primary_addr}")),
        10,
        Duration::from_secs(5),
        &client,
    )
    .await;

    let packed = replica_store.pack(-1);
    let lines: Vec<&str> = packed.lines().filter(|l| !l.is_empty()).collect();
    assert_eq!(lines.len(), 10);
}
