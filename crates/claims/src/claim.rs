use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use data_encoding::{BASE32_NOPAD, BASE64URL_NOPAD};
use nkeys::KeyPair;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{ClaimError, Result};

const HEADER_TYPE: &str = "jwt";
const HEADER_ALGORITHM: &str = "Ed25519";

#[derive(Debug, Serialize, Deserialize)]
struct ClaimsHeader {
    #[serde(rename = "typ")]
    header_type: String,
    #[serde(rename = "alg")]
    algorithm: String,
}

/// The three claim kinds this resolver handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimKind {
    Operator,
    Account,
    Activation,
}

impl fmt::Display for ClaimKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClaimKind::Operator => "operator",
            ClaimKind::Account => "account",
            ClaimKind::Activation => "activation",
        };
        f.write_str(s)
    }
}

/// Severity attached to a single `validate()` finding. Only `Blocking`
/// issues should cause a request to be rejected; `Advisory` issues are
/// informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Blocking,
    Advisory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub severity: Severity,
    pub message: String,
}

impl ValidationIssue {
    fn blocking(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Blocking,
            message: message.into(),
        }
    }

    fn advisory(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Advisory,
            message: message.into(),
        }
    }
}

/// Per-kind metadata nested under the claim body's `nats` field, the way
/// NATS account JWTs nest their type-specific payload.
pub trait ClaimMetadata: Clone + Default + Serialize + DeserializeOwned {
    const KIND: ClaimKind;

    /// A human name for logging; defaults to "Anonymous" when unset.
    fn name(&self) -> String {
        "Anonymous".to_string()
    }
}

/// Metadata for an operator claim: the root trust authority.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Default)]
pub struct Operator {
    pub name: Option<String>,
    /// Additional public keys, besides `subject`, allowed to sign accounts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_signers: Option<Vec<String>>,
}

impl ClaimMetadata for Operator {
    const KIND: ClaimKind = ClaimKind::Operator;

    fn name(&self) -> String {
        self.name.clone().unwrap_or_else(|| "Anonymous".to_string())
    }
}

/// Metadata for an account claim.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Default)]
pub struct Account {
    pub name: Option<String>,
    /// Additional public keys, besides `issuer`, allowed to have signed this
    /// account (used for signing-key rotation checks).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_signers: Option<Vec<String>>,
}

impl ClaimMetadata for Account {
    const KIND: ClaimKind = ClaimKind::Account;

    fn name(&self) -> String {
        self.name.clone().unwrap_or_else(|| "Anonymous".to_string())
    }
}

/// What an activation claim grants access to.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum ImportType {
    Stream,
    Service,
}

impl Default for ImportType {
    fn default() -> Self {
        ImportType::Stream
    }
}

/// Metadata for an activation claim: the right for `subject` to import
/// `import_subject` from the account named by `issuer`.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Default)]
pub struct Activation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "subject")]
    pub import_subject: String,
    #[serde(rename = "type")]
    pub import_type: ImportType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
}

impl ClaimMetadata for Activation {
    const KIND: ClaimKind = ClaimKind::Activation;

    fn name(&self) -> String {
        self.name.clone().unwrap_or_else(|| "Anonymous".to_string())
    }
}

/// A decoded claim body, generic over its per-kind metadata.
///
/// Field names mirror the RFC 7519 registered claims (`exp`, `jti`, `iat`,
/// `iss`, `sub`, `nbf`); the per-kind payload is nested under `nats`, as in
/// the wire format this resolver is compatible with.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Default)]
pub struct Claims<T> {
    #[serde(rename = "exp", skip_serializing_if = "Option::is_none")]
    pub expires: Option<u64>,

    #[serde(rename = "jti")]
    pub id: String,

    #[serde(rename = "iat")]
    pub issued_at: u64,

    #[serde(rename = "iss")]
    pub issuer: String,

    #[serde(rename = "sub")]
    pub subject: String,

    #[serde(rename = "nbf", skip_serializing_if = "Option::is_none")]
    pub not_before: Option<u64>,

    #[serde(rename = "nats")]
    pub metadata: T,
}

impl<T> Claims<T>
where
    T: ClaimMetadata,
{
    /// A new, non-expiring claim with default metadata. Callers mutate the
    /// returned value (e.g. `claims.metadata.name = Some(...)`) before
    /// signing.
    #[must_use]
    pub fn new(subject: String, issuer: String) -> Self {
        Claims {
            expires: None,
            id: nuid::next().to_string(),
            issued_at: since_the_epoch(),
            issuer,
            subject,
            not_before: None,
            metadata: T::default(),
        }
    }

    #[must_use]
    pub fn expires_at(mut self, unix_secs: u64) -> Self {
        self.expires = Some(unix_secs);
        self
    }

    #[must_use]
    pub fn not_before_at(mut self, unix_secs: u64) -> Self {
        self.not_before = Some(unix_secs);
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: T) -> Self {
        self.metadata = metadata;
        self
    }

    #[must_use]
    pub fn kind(&self) -> ClaimKind {
        T::KIND
    }

    /// Signs and encodes the claim. The signature covers `header.body`.
    pub fn encode(&self, kp: &KeyPair) -> Result<String> {
        let header = ClaimsHeader {
            header_type: HEADER_TYPE.to_string(),
            algorithm: HEADER_ALGORITHM.to_string(),
        };
        let header = to_jwt_segment(&header)?;
        let body = to_jwt_segment(self)?;

        let head_and_body = format!("{header}.{body}");
        let sig = kp.sign(head_and_body.as_bytes())?;
        let sig64 = BASE64URL_NOPAD.encode(&sig);
        Ok(format!("{head_and_body}.{sig64}"))
    }

    /// Decodes the body segment without verifying the signature. Used by
    /// callers that have already run [`validate`] or that only need the
    /// structural fields (e.g. the pack merge path).
    pub fn decode(encoded: &str) -> Result<Claims<T>> {
        let segments: Vec<&str> = encoded.split('.').collect();
        if segments.len() != 3 {
            return Err(ClaimError::Malformed(format!(
                "expected 3 segments, found {}",
                segments.len()
            )));
        }
        from_jwt_segment(segments[1])
    }
}

/// Decodes and fully validates a claim: header shape, non-empty
/// issuer/subject, and the Ed25519 signature against `issuer`.
///
/// Returns the decoded claim alongside every finding; callers decide how to
/// react to `Advisory` issues, but must reject on any `Blocking` one.
pub fn validate<T>(encoded: &str) -> Result<(Claims<T>, Vec<ValidationIssue>)>
where
    T: ClaimMetadata,
{
    let segments: Vec<&str> = encoded.split('.').collect();
    if segments.len() != 3 {
        return Err(ClaimError::Malformed(format!(
            "expected 3 segments, found {}",
            segments.len()
        )));
    }

    let header: ClaimsHeader = from_jwt_segment(segments[0])?;
    if header.header_type != HEADER_TYPE {
        return Err(ClaimError::InvalidHeader);
    }
    if header.algorithm != HEADER_ALGORITHM {
        return Err(ClaimError::InvalidAlgorithm);
    }

    let claims: Claims<T> = from_jwt_segment(segments[1])?;

    let mut issues = Vec::new();
    if claims.issuer.is_empty() {
        issues.push(ValidationIssue::blocking("missing issuer claim"));
    }
    if claims.subject.is_empty() {
        issues.push(ValidationIssue::blocking("missing subject claim"));
    }

    if !claims.issuer.is_empty() {
        let head_and_body = format!("{}.{}", segments[0], segments[1]);
        let sig = BASE64URL_NOPAD
            .decode(segments[2].as_bytes())
            .map_err(ClaimError::Decode)?;
        match KeyPair::from_public_key(&claims.issuer) {
            Ok(kp) => {
                if kp.verify(head_and_body.as_bytes(), &sig).is_err() {
                    issues.push(ValidationIssue::blocking("signature verification failed"));
                }
            }
            Err(_) => issues.push(ValidationIssue::blocking("issuer is not a valid public key")),
        }
    }

    if claims.metadata.name() == "Anonymous" {
        issues.push(ValidationIssue::advisory("no name set"));
    }

    Ok((claims, issues))
}

/// The registered-claim fields any store or cache layer needs without
/// knowing a claim's kind-specific metadata shape.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    #[serde(rename = "exp")]
    pub expires: Option<u64>,
    #[serde(rename = "jti")]
    pub id: String,
    #[serde(rename = "iat")]
    pub issued_at: u64,
}

/// Decodes just the registered claim fields (`exp`, `jti`, `iat`) from an
/// encoded token, ignoring its kind-specific `nats` payload. Used by code
/// that needs to know a claim's expiry or id without being generic over its
/// metadata type, such as the store's expiration index.
pub fn peek_envelope(encoded: &str) -> Result<Envelope> {
    let segments: Vec<&str> = encoded.split('.').collect();
    if segments.len() != 3 {
        return Err(ClaimError::Malformed(format!(
            "expected 3 segments, found {}",
            segments.len()
        )));
    }
    from_jwt_segment(segments[1])
}

/// Derives an activation's storage key: SHA-256 of
/// `issuer.subject.normalized-import-subject`, base32-encoded. Wildcards
/// (`*`, `>`) in the import subject are normalized to `_` so that the hash
/// is stable across brokers that render wildcards differently.
#[must_use]
pub fn hash_id(issuer: &str, subject: &str, import_subject: &str) -> String {
    let normalized: String = import_subject
        .chars()
        .map(|c| if c == '*' || c == '>' { '_' } else { c })
        .collect();
    let material = format!("{issuer}.{subject}.{normalized}");
    let digest = Sha256::digest(material.as_bytes());
    BASE32_NOPAD.encode(&digest)
}

impl Claims<Activation> {
    #[must_use]
    pub fn hash_id(&self) -> String {
        hash_id(&self.issuer, &self.subject, &self.metadata.import_subject)
    }
}

fn since_the_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_secs()
}

/// Renders a unix timestamp relative to `now`, rounded to the coarsest unit
/// that still fits: "3h ago" or "in 3h". Used by callers presenting a
/// claim's `iat`/`exp` for human inspection rather than machine parsing.
#[must_use]
pub fn human_relative(now: u64, stamp: u64) -> String {
    let now = now as i64;
    let stamp = stamp as i64;
    let diff_sec = now.abs_diff(stamp);
    let rounded = if diff_sec >= 86_400 {
        diff_sec - diff_sec % 86_400
    } else if diff_sec >= 3_600 {
        diff_sec - diff_sec % 3_600
    } else if diff_sec >= 60 {
        diff_sec - diff_sec % 60
    } else {
        diff_sec
    };
    let ht = humantime::format_duration(std::time::Duration::from_secs(rounded));
    if now > stamp {
        format!("{ht} ago")
    } else {
        format!("in {ht}")
    }
}

fn to_jwt_segment<S: Serialize>(input: &S) -> Result<String> {
    let encoded = serde_json::to_string(input)?;
    Ok(BASE64URL_NOPAD.encode(encoded.as_bytes()))
}

fn from_jwt_segment<B: AsRef<str>, D: DeserializeOwned>(encoded: B) -> Result<D> {
    let decoded = BASE64URL_NOPAD.decode(encoded.as_ref().as_bytes())?;
    let s = String::from_utf8(decoded)?;
    Ok(serde_json::from_str(&s)?)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let operator = KeyPair::new_operator();
        let account = KeyPair::new_account();
        let claims = Claims::<Account>::new(account.public_key(), operator.public_key())
            .with_metadata(Account {
                name: Some("acme".to_string()),
                valid_signers: None,
            });

        let encoded = claims.encode(&operator).unwrap();
        let decoded = Claims::<Account>::decode(&encoded).unwrap();
        assert_eq!(claims, decoded);
    }

    #[test]
    fn validate_catches_bad_signature() {
        let operator = KeyPair::new_operator();
        let other = KeyPair::new_operator();
        let account = KeyPair::new_account();
        let claims = Claims::<Account>::new(account.public_key(), other.public_key());
        let encoded = claims.encode(&operator).unwrap();

        let (_, issues) = validate::<Account>(&encoded).unwrap();
        assert!(issues
            .iter()
            .any(|i| i.severity == Severity::Blocking && i.message.contains("signature")));
    }

    #[test]
    fn validate_flags_missing_name_as_advisory() {
        let operator = KeyPair::new_operator();
        let account = KeyPair::new_account();
        let claims = Claims::<Account>::new(account.public_key(), operator.public_key());
        let encoded = claims.encode(&operator).unwrap();

        let (_, issues) = validate::<Account>(&encoded).unwrap();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, Severity::Advisory);
    }

    #[test]
    fn decode_rejects_malformed_segments() {
        let operator = KeyPair::new_operator();
        let account = KeyPair::new_account();
        let claims = Claims::<Account>::new(account.public_key(), operator.public_key());
        let encoded = claims.encode(&operator).unwrap().replace('.', "");

        let err = Claims::<Account>::decode(&encoded).unwrap_err();
        assert!(matches!(err, ClaimError::Malformed(_)));
    }

    #[test]
    fn activation_hash_id_normalizes_wildcards() {
        let issuer = KeyPair::new_account().public_key();
        let subject = KeyPair::new_account().public_key();
        let a = hash_id(&issuer, &subject, "orders.*");
        let b = hash_id(&issuer, &subject, "orders._");
        assert_eq!(a, b);
    }

    #[test]
    fn peek_envelope_reads_registered_fields_only() {
        let operator = KeyPair::new_operator();
        let account = KeyPair::new_account();
        let claims = Claims::<Account>::new(account.public_key(), operator.public_key())
            .expires_at(1_900_000_000);
        let encoded = claims.encode(&operator).unwrap();

        let envelope = peek_envelope(&encoded).unwrap();
        assert_eq!(envelope.id, claims.id);
        assert_eq!(envelope.expires, Some(1_900_000_000));
    }

    #[test]
    fn activation_hash_id_matches_claim_method() {
        let issuer = KeyPair::new_account();
        let subject = KeyPair::new_account();
        let claims = Claims::<Activation>::new(subject.public_key(), issuer.public_key())
            .with_metadata(Activation {
                name: None,
                import_subject: "orders.>".to_string(),
                import_type: ImportType::Stream,
                locale: None,
            });
        assert_eq!(
            claims.hash_id(),
            hash_id(&claims.issuer, &claims.subject, "orders.>")
        );
    }

    #[test]
    fn human_relative_rounds_to_coarsest_unit() {
        let now = 1_700_000_000;
        assert_eq!(human_relative(now, now - 3 * 3600 - 61), "3h ago");
        assert_eq!(human_relative(now, now + 2 * 86_400 + 100), "in 2days");
        assert_eq!(human_relative(now, now - 5), "5s ago");
    }
}
