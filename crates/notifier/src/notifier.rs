use std::sync::Arc;
use std::time::Duration;

use async_nats::HeaderMap;
use backoff::{future::retry, ExponentialBackoffBuilder};
use claimsrv_store::Store;
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::NotifierError;

pub type Result<T> = std::result::Result<T, NotifierError>;

/// Carries the publishing node's id on every broadcast so a node that
/// receives its own message back off a peer's echo — or its own gossip
/// round's broadcast, received by itself as a plain subscriber — can skip
/// it instead of re-applying or re-answering its own request.
const ORIGIN_HEADER: &str = "Claimsrv-Origin";

const PACK_SYNC_SUBJECT: &str = "$SYS.REQ.CLAIMS.PACK";

fn account_update_subject(account: &str) -> String {
    format!("$SYS.ACCOUNT.{account}.CLAIMS.UPDATE")
}

fn activation_update_subject(account: &str, hash_id: &str) -> String {
    format!("$SYS.ACCOUNT.{account}.CLAIMS.ACTIVATE.{hash_id}")
}

fn lookup_subject(account: &str) -> String {
    format!("$SYS.REQ.ACCOUNT.{account}.CLAIMS.LOOKUP")
}

/// Polls a subscription that may not exist (read-only nodes skip the
/// responder subscriptions) without the `select!` arm that holds it ever
/// firing when it's `None`.
async fn next_from(sub: &mut Option<async_nats::Subscriber>) -> Option<async_nats::Message> {
    match sub {
        Some(sub) => sub.next().await,
        None => futures::future::pending().await,
    }
}

/// Ties a [`Store`] to the resolver's pub/sub contract: mutation
/// broadcast, per-account lookup responses, and periodic hash-gossip
/// reconciliation with peers.
///
/// The underlying client is filled in lazily by [`Notifier::run`] so a
/// caller can hand this out to the rest of the resolver before NATS is
/// reachable; a connection attempt stuck retrying must never hold up
/// anything that only needs the store.
pub struct Notifier {
    client: tokio::sync::OnceCell<async_nats::Client>,
    node_id: String,
}

impl Notifier {
    /// A notifier with no connection yet. [`Notifier::run`] connects (with
    /// indefinite retry/backoff, since connection failure at start is
    /// non-fatal) and fills in the client once it succeeds.
    pub fn pending(node_id: impl Into<String>) -> Self {
        Notifier {
            client: tokio::sync::OnceCell::new(),
            node_id: node_id.into(),
        }
    }

    /// Wraps an already-connected client, for callers that manage their
    /// own connection lifecycle (tests, embedders).
    pub fn with_client(client: async_nats::Client, node_id: impl Into<String>) -> Self {
        let cell = tokio::sync::OnceCell::new();
        let _ = cell.set(client);
        Notifier {
            client: cell,
            node_id: node_id.into(),
        }
    }

    fn client(&self) -> Result<&async_nats::Client> {
        self.client.get().ok_or(NotifierError::NotConnected)
    }

    fn origin_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ORIGIN_HEADER, self.node_id.as_str());
        headers
    }

    /// Publishes an account mutation so subscribers converge on it without
    /// waiting for the next gossip round.
    pub async fn publish_account(&self, account: &str, encoded: &str) -> Result<()> {
        let client = self.client()?;
        client
            .publish_with_headers(
                account_update_subject(account),
                self.origin_headers(),
                encoded.to_string().into(),
            )
            .await?;
        client.flush().await.ok();
        Ok(())
    }

    /// Publishes an activation mutation under its owning account's subject
    /// tree, keyed by the activation's hash id.
    pub async fn publish_activation(&self, account: &str, hash_id: &str, encoded: &str) -> Result<()> {
        let client = self.client()?;
        client
            .publish_with_headers(
                activation_update_subject(account, hash_id),
                self.origin_headers(),
                encoded.to_string().into(),
            )
            .await?;
        client.flush().await.ok();
        Ok(())
    }

    /// Asks any listening peer for `account`'s claim. `None` means nobody
    /// answered within `timeout`, indistinguishable from "nobody has it".
    pub async fn request_lookup(&self, account: &str, timeout: Duration) -> Result<Option<String>> {
        self.request(&lookup_subject(account), Vec::new(), timeout).await
    }

    /// A bare request/reply round-trip on an arbitrary subject, for callers
    /// (the signing round-trip) that own a subject not part of this
    /// module's fixed grammar. `None` on timeout or empty reply.
    pub async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Option<String>> {
        let client = self.client()?;
        let request = client.request(subject.to_string(), payload.into());
        match tokio::time::timeout(timeout, request).await {
            Ok(Ok(msg)) if msg.payload.is_empty() => Ok(None),
            Ok(Ok(msg)) => Ok(Some(String::from_utf8_lossy(&msg.payload).into_owned())),
            Ok(Err(_)) | Err(_) => Ok(None),
        }
    }

    /// Connects with retry/backoff (unless a test already supplied a
    /// client via [`Notifier::with_client`]), then runs the
    /// subscribe-and-dispatch loop until the connection closes. Meant to
    /// be spawned as a background task for the store's lifetime; only
    /// non-read-only nodes subscribe to the responder side (peer lookup,
    /// gossip pack requests), but every node applies incoming updates and
    /// joins gossip as a requester.
    pub async fn run(
        &self,
        urls: &str,
        options: async_nats::ConnectOptions,
        store: Arc<Store>,
        reconnect_wait: Duration,
    ) -> Result<()> {
        let client = match self.client.get() {
            Some(client) => client.clone(),
            None => {
                let policy = ExponentialBackoffBuilder::new()
                    .with_initial_interval(Duration::from_millis(200))
                    .with_max_interval(Duration::from_secs(10))
                    .with_max_elapsed_time(None)
                    .build();

                let client = retry(policy, || async {
                    options.clone().connect(urls).await.map_err(|err| {
                        warn!(%err, "nats connect failed, retrying");
                        backoff::Error::transient(err)
                    })
                })
                .await
                .map_err(NotifierError::Connect)?;

                let _ = self.client.set(client.clone());
                client
            }
        };

        let mut account_updates = client.subscribe("$SYS.ACCOUNT.*.CLAIMS.UPDATE").await?;
        let mut activation_updates = client.subscribe("$SYS.ACCOUNT.*.CLAIMS.ACTIVATE.*").await?;
        let mut lookups = if store.is_read_only() {
            None
        } else {
            Some(client.subscribe("$SYS.REQ.ACCOUNT.*.CLAIMS.LOOKUP").await?)
        };
        let mut pack_requests = if store.is_read_only() {
            None
        } else {
            Some(client.subscribe(PACK_SYNC_SUBJECT).await?)
        };
        let mut ticker = tokio::time::interval(reconnect_wait);
        ticker.tick().await; // first tick fires immediately; skip it

        loop {
            tokio::select! {
                Some(msg) = account_updates.next() => self.handle_update(&store, msg),
                Some(msg) = activation_updates.next() => self.handle_update(&store, msg),
                Some(msg) = next_from(&mut lookups) => self.handle_lookup(&client, &store, msg).await,
                Some(msg) = next_from(&mut pack_requests) => self.handle_pack_request(&client, &store, msg).await,
                _ = ticker.tick() => self.run_gossip_round(&client, &store).await,
                else => break,
            }
        }
        Ok(())
    }

    fn is_self_origin(&self, msg: &async_nats::Message) -> bool {
        msg.headers
            .as_ref()
            .and_then(|h| h.get(ORIGIN_HEADER))
            .map(|v| v.as_str() == self.node_id)
            .unwrap_or(false)
    }

    fn handle_update(&self, store: &Store, msg: async_nats::Message) {
        if self.is_self_origin(&msg) {
            debug!(subject = %msg.subject, "ignoring self-originated update");
            return;
        }
        let Some(key) = subject_key(&msg.subject) else {
            warn!(subject = %msg.subject, "could not derive store key from subject");
            return;
        };
        let encoded = String::from_utf8_lossy(&msg.payload);
        if let Err(err) = store.save_if_newer(&key, &encoded) {
            warn!(%key, %err, "failed to apply notified update");
        }
    }

    /// Only called when the store is non-read-only (the node is the one
    /// subscribed to the lookup subject); a read-only replica never
    /// subscribes, so it never answers (empty on miss is what the spec
    /// allows, so an always-read-only store that never replies is
    /// indistinguishable from one that answers misses).
    async fn handle_lookup(&self, client: &async_nats::Client, store: &Store, msg: async_nats::Message) {
        let Some(reply) = msg.reply.clone() else {
            return;
        };
        let Some(account) = msg.subject.strip_prefix("$SYS.REQ.ACCOUNT.").and_then(|s| s.strip_suffix(".CLAIMS.LOOKUP")) else {
            return;
        };
        let payload = store.load(account).unwrap_or_default();
        if let Err(err) = client.publish(reply, payload.into()).await {
            warn!(%account, %err, "failed to answer lookup");
        }
    }

    async fn handle_pack_request(&self, client: &async_nats::Client, store: &Store, msg: async_nats::Message) {
        if self.is_self_origin(&msg) {
            return;
        }
        let Some(reply) = msg.reply.clone() else {
            return;
        };
        let payload = if msg.payload.as_ref() == store.hash().as_slice() {
            String::new()
        } else {
            store.pack(-1)
        };
        if let Err(err) = client.publish(reply, payload.into()).await {
            warn!(%err, "failed to answer gossip pack request");
        }
    }

    /// Broadcasts this node's hash on an ephemeral inbox and merges every
    /// non-empty reply for a bounded drain window. Peers reply empty when
    /// their hash already matches, so those are simply ignored. Runs on
    /// every node, read-only or not, since gossip requesting is how a
    /// read-only replica discovers it has fallen behind.
    async fn run_gossip_round(&self, client: &async_nats::Client, store: &Store) {
        let inbox = format!("_INBOX.{}", nuid::next());
        let Ok(mut replies) = client.subscribe(inbox.clone()).await else {
            return;
        };

        if client
            .publish_with_reply_and_headers(
                PACK_SYNC_SUBJECT,
                inbox,
                self.origin_headers(),
                store.hash().to_vec().into(),
            )
            .await
            .is_err()
        {
            return;
        }
        client.flush().await.ok();

        let drain_until = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let remaining = drain_until.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            let Ok(Some(msg)) = tokio::time::timeout(remaining, replies.next()).await else {
                break;
            };
            if msg.payload.is_empty() {
                continue;
            }
            let body = String::from_utf8_lossy(&msg.payload);
            if let Err(err) = store.merge(&body) {
                warn!(%err, "gossip pack merge failed");
            } else {
                info!("merged pack from peer gossip reply");
            }
        }
    }
}

/// Recovers the account (and, for activations, hash-id) key from an
/// incoming update subject. Activation subjects carry the owning account's
/// subtree but the activation itself is stored under its own hash-id, so
/// the trailing segment — not the account — is the store key.
fn subject_key(subject: &str) -> Option<String> {
    let parts: Vec<&str> = subject.split('.').collect();
    match parts.as_slice() {
        ["$SYS", "ACCOUNT", account, "CLAIMS", "UPDATE"] => Some((*account).to_string()),
        ["$SYS", "ACCOUNT", _account, "CLAIMS", "ACTIVATE", hash_id] => Some((*hash_id).to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn subjects_match_the_broker_naming_scheme() {
        assert_eq!(account_update_subject("ACCT"), "$SYS.ACCOUNT.ACCT.CLAIMS.UPDATE");
        assert_eq!(
            activation_update_subject("ACCT", "HASH"),
            "$SYS.ACCOUNT.ACCT.CLAIMS.ACTIVATE.HASH"
        );
        assert_eq!(lookup_subject("ACCT"), "$SYS.REQ.ACCOUNT.ACCT.CLAIMS.LOOKUP");
    }

    #[test]
    fn subject_key_extracts_account_from_update() {
        assert_eq!(
            subject_key("$SYS.ACCOUNT.ACCT.CLAIMS.UPDATE"),
            Some("ACCT".to_string())
        );
    }

    #[test]
    fn subject_key_extracts_hash_id_from_activation() {
        assert_eq!(
            subject_key("$SYS.ACCOUNT.ACCT.CLAIMS.ACTIVATE.HASH"),
            Some("HASH".to_string())
        );
    }

    #[test]
    fn subject_key_rejects_unrelated_subjects() {
        assert_eq!(subject_key("$SYS.REQ.CLAIMS.PACK"), None);
    }
}
