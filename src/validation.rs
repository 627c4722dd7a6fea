//! Accepts or rejects incoming account/activation claims: enforces the
//! trusted-issuer set, routes self-signed requests to an external signer,
//! and persists + notifies on success.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use claimsrv_claims::{hash_id, validate, Account, Activation, Claims};
use claimsrv_notifier::Notifier;
use claimsrv_store::Store;
use tracing::{info, warn};

use crate::error::ResolverError;

pub type Result<T> = std::result::Result<T, ResolverError>;

/// Outcome of an account update: either it was accepted and persisted, or a
/// signer round-trip is pending and the caller should report 202.
pub enum AccountOutcome {
    Accepted,
    SigningPending(String),
}

pub struct ValidationPipeline {
    trusted_keys: Vec<String>,
    sign_request_subject: Option<String>,
    sign_request_timeout: Duration,
    store: Arc<Store>,
    notifier: Arc<Notifier>,
}

impl ValidationPipeline {
    pub fn new(
        trusted_keys: Vec<String>,
        sign_request_subject: Option<String>,
        sign_request_timeout: Duration,
        store: Arc<Store>,
        notifier: Arc<Notifier>,
    ) -> Self {
        ValidationPipeline {
            trusted_keys,
            sign_request_subject,
            sign_request_timeout,
            store,
            notifier,
        }
    }

    /// Runs the full account-update flow against a freshly-posted encoded
    /// claim. `path_pubkey` is the `:pubkey` URL segment, checked against
    /// the claim's own subject.
    pub async fn update_account(&self, path_pubkey: &str, encoded: &str) -> Result<AccountOutcome> {
        self.update_account_inner(path_pubkey, encoded, 0).await
    }

    async fn update_account_inner(
        &self,
        path_pubkey: &str,
        encoded: &str,
        depth: u8,
    ) -> Result<AccountOutcome> {
        if depth > 1 {
            return Err(ResolverError::Transient(
                "signer returned another unsigned claim".to_string(),
            ));
        }

        let (claims, issues) = validate::<Account>(encoded)
            .map_err(|err| ResolverError::Malformed(err.to_string()))?;

        if !is_account_key(&claims.subject) {
            return Err(ResolverError::PolicyRejected(
                "subject is not an account-family key".to_string(),
            ));
        }
        if !is_operator_key(&claims.issuer) && !is_account_key(&claims.issuer) {
            return Err(ResolverError::PolicyRejected(
                "issuer is not an operator or account-family key".to_string(),
            ));
        }
        if !path_pubkey.is_empty() && path_pubkey != claims.subject {
            return Err(ResolverError::PolicyRejected(
                "path pubkey does not match claim subject".to_string(),
            ));
        }

        let trusted = self.trusted_keys.iter().any(|k| k == &claims.issuer);
        if !trusted {
            match &self.sign_request_subject {
                Some(subject) if !subject.is_empty() => {
                    let self_signed = claims.issuer == claims.subject;
                    let co_signed = self.issuer_was_co_signed(&claims.subject, &claims.issuer);
                    if !self_signed && !co_signed {
                        return Err(ResolverError::PolicyRejected(
                            "untrusted issuer for signer round-trip".to_string(),
                        ));
                    }

                    let response = self
                        .notifier
                        .request(subject, encoded.as_bytes().to_vec(), self.sign_request_timeout)
                        .await
                        .map_err(|err| ResolverError::Transient(err.to_string()))?;

                    let Some(body) = response else {
                        return Err(ResolverError::Transient(
                            "signer request timed out".to_string(),
                        ));
                    };

                    if validate::<Account>(&body).is_err() {
                        // Not a re-signed claim: treat as a human-readable
                        // message for the asynchronous signing flow.
                        return Ok(AccountOutcome::SigningPending(body));
                    }
                    return Box::pin(self.update_account_inner(path_pubkey, &body, depth + 1)).await;
                }
                _ => {
                    return Err(ResolverError::PolicyRejected(
                        "untrusted issuer; signer not enabled".to_string(),
                    ))
                }
            }
        }

        let blocking: Vec<&str> = issues
            .iter()
            .filter(|i| i.severity == claimsrv_claims::Severity::Blocking)
            .map(|i| i.message.as_str())
            .collect();
        if !blocking.is_empty() {
            return Err(ResolverError::PolicyRejected(blocking.join("; ")));
        }

        if let Some(expires) = claims.expires {
            if expires > 0 && expires < now() {
                return Err(ResolverError::PolicyRejected("claim has already expired".to_string()));
            }
        }

        self.store.save(&claims.subject, encoded)?;
        info!(subject = %ResolverError::short_code(&claims.subject), id = %claims.id, "account claim accepted");

        if let Err(err) = self.notifier.publish_account(&claims.subject, encoded).await {
            warn!(%err, "failed to publish account update");
            return Err(ResolverError::Transient(err.to_string()));
        }

        Ok(AccountOutcome::Accepted)
    }

    /// A prior claim for `subject` co-signing `issuer` permits issuer
    /// rotation onto one of its declared `valid_signers`.
    fn issuer_was_co_signed(&self, subject: &str, issuer: &str) -> bool {
        let Ok(existing) = self.store.load(subject) else {
            return false;
        };
        let Ok(existing_claims) = Claims::<Account>::decode(&existing) else {
            return false;
        };
        existing_claims
            .metadata
            .valid_signers
            .as_deref()
            .unwrap_or_default()
            .iter()
            .any(|k| k == issuer)
    }

    pub async fn update_activation(&self, encoded: &str) -> Result<String> {
        let (claims, issues) = validate::<Activation>(encoded)
            .map_err(|err| ResolverError::Malformed(err.to_string()))?;

        if !is_operator_key(&claims.issuer) && !is_account_key(&claims.issuer) {
            return Err(ResolverError::PolicyRejected(
                "issuer is not an operator or account-family key".to_string(),
            ));
        }
        if !is_account_key(&claims.subject) {
            return Err(ResolverError::PolicyRejected(
                "subject is not an account-family key".to_string(),
            ));
        }
        let blocking: Vec<&str> = issues
            .iter()
            .filter(|i| i.severity == claimsrv_claims::Severity::Blocking)
            .map(|i| i.message.as_str())
            .collect();
        if !blocking.is_empty() {
            return Err(ResolverError::PolicyRejected(blocking.join("; ")));
        }

        let computed = hash_id(&claims.issuer, &claims.subject, &claims.metadata.import_subject);
        self.store.save(&computed, encoded)?;
        info!(hash = %ResolverError::short_code(&computed), id = %claims.id, "activation claim accepted");

        if let Err(err) = self
            .notifier
            .publish_activation(&claims.issuer, &computed, encoded)
            .await
        {
            warn!(%err, "failed to publish activation update");
            return Err(ResolverError::Transient(err.to_string()));
        }

        Ok(computed)
    }
}

fn is_account_key(key: &str) -> bool {
    key.starts_with('A')
}

fn is_operator_key(key: &str) -> bool {
    key.starts_with('O')
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_secs()
}

