//! Webhook signature verification
//!
//! Every delivery is authenticated before its payload is parsed. Stripe signs
//! `"{timestamp}.{body}"` and sends `Stripe-Signature: t=...,v1=...`; Coinbase
//! Commerce signs the raw body and sends the hex digest in
//! `X-CC-Webhook-Signature`.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

type HmacSha256 = Hmac<Sha256>;

pub trait WebhookVerifier: Send + Sync {
    fn verify(&self, payload: &[u8], signature: &str, now: OffsetDateTime) -> BillingResult<()>;
}

/// Constant-time comparison to prevent timing attacks
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[allow(clippy::expect_used)] // HMAC accepts keys of any size
fn hmac_hex(secret: &str, parts: &[&[u8]]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    for part in parts {
        mac.update(part);
    }
    hex::encode(mac.finalize().into_bytes())
}

fn rejected(provider: &str, reason: &str) -> BillingError {
    tracing::warn!(
        target: "meterflow::security",
        provider = provider,
        reason = reason,
        "Webhook signature rejected"
    );
    BillingError::WebhookSignatureInvalid
}

/// Stripe `t=...,v1=...` signatures with a timestamp tolerance
#[derive(Clone)]
pub struct StripeVerifier {
    secret: String,
    tolerance_secs: i64,
}

impl std::fmt::Debug for StripeVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeVerifier")
            .field("tolerance_secs", &self.tolerance_secs)
            .finish_non_exhaustive()
    }
}

impl StripeVerifier {
    pub fn new(secret: impl Into<String>, tolerance_secs: i64) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs,
        }
    }
}

/// Build a `Stripe-Signature` header value for `payload` signed at `timestamp`
pub fn sign_stripe_payload(secret: &str, payload: &[u8], timestamp: i64) -> String {
    format!("t={},v1={}", timestamp, stripe_mac(secret, timestamp, payload))
}

/// Stripe signs `"{t}.{body}"` over the raw body bytes
fn stripe_mac(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    hmac_hex(secret, &[timestamp.to_string().as_bytes(), b".", payload])
}

/// Split a signature header into its timestamp and every `v1` signature
fn parse_stripe_header(header: &str) -> Option<(i64, Vec<&str>)> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => timestamp = value.parse::<i64>().ok(),
            "v1" => signatures.push(value),
            _ => {}
        }
    }

    match timestamp {
        Some(t) if !signatures.is_empty() => Some((t, signatures)),
        _ => None,
    }
}

impl WebhookVerifier for StripeVerifier {
    fn verify(&self, payload: &[u8], signature: &str, now: OffsetDateTime) -> BillingResult<()> {
        let Some((timestamp, signatures)) = parse_stripe_header(signature) else {
            return Err(rejected("stripe", "malformed signature header"));
        };

        let tolerance = u64::try_from(self.tolerance_secs).unwrap_or(0);
        if now.unix_timestamp().abs_diff(timestamp) > tolerance {
            return Err(rejected("stripe", "timestamp outside tolerance"));
        }

        let expected = stripe_mac(&self.secret, timestamp, payload);

        if signatures
            .iter()
            .any(|candidate| constant_time_eq(candidate.as_bytes(), expected.as_bytes()))
        {
            Ok(())
        } else {
            Err(rejected("stripe", "signature mismatch"))
        }
    }
}

/// Configuration for Coinbase Commerce webhooks
#[derive(Debug, Clone)]
pub struct CoinbaseConfig {
    pub webhook_secret: String,
}

impl CoinbaseConfig {
    /// `None` when `COINBASE_WEBHOOK_SECRET` is unset
    pub fn from_env() -> Option<Self> {
        std::env::var("COINBASE_WEBHOOK_SECRET")
            .ok()
            .filter(|s| !s.is_empty())
            .map(|webhook_secret| Self { webhook_secret })
    }
}

/// Hex HMAC-SHA256 of the raw body
#[derive(Clone)]
pub struct CoinbaseVerifier {
    secret: String,
}

impl CoinbaseVerifier {
    pub fn new(config: CoinbaseConfig) -> Self {
        Self {
            secret: config.webhook_secret,
        }
    }

    pub fn sign(&self, payload: &[u8]) -> String {
        hmac_hex(&self.secret, &[payload])
    }
}

impl WebhookVerifier for CoinbaseVerifier {
    fn verify(&self, payload: &[u8], signature: &str, _now: OffsetDateTime) -> BillingResult<()> {
        let expected = hmac_hex(&self.secret, &[payload]);
        if constant_time_eq(signature.trim().to_lowercase().as_bytes(), expected.as_bytes()) {
            Ok(())
        } else {
            Err(rejected("coinbase", "signature mismatch"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";
    const PAYLOAD: &[u8] = br#"{"id":"evt_1","type":"invoice.paid"}"#;

    #[test]
    fn test_valid_stripe_signature() {
        let now = OffsetDateTime::now_utc();
        let header = sign_stripe_payload(SECRET, PAYLOAD, now.unix_timestamp());
        let verifier = StripeVerifier::new(SECRET, 300);
        assert!(verifier.verify(PAYLOAD, &header, now).is_ok());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let now = OffsetDateTime::now_utc();
        let header = sign_stripe_payload("whsec_other", PAYLOAD, now.unix_timestamp());
        let verifier = StripeVerifier::new(SECRET, 300);
        assert!(matches!(
            verifier.verify(PAYLOAD, &header, now),
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let now = OffsetDateTime::now_utc();
        let header = sign_stripe_payload(SECRET, PAYLOAD, now.unix_timestamp());
        let verifier = StripeVerifier::new(SECRET, 300);
        assert!(verifier
            .verify(br#"{"id":"evt_2","type":"invoice.paid"}"#, &header, now)
            .is_err());
    }

    #[test]
    fn test_expired_timestamp_rejected() {
        let now = OffsetDateTime::now_utc();
        let header = sign_stripe_payload(SECRET, PAYLOAD, now.unix_timestamp() - 301);
        let verifier = StripeVerifier::new(SECRET, 300);
        assert!(verifier.verify(PAYLOAD, &header, now).is_err());
    }

    #[test]
    fn test_any_v1_signature_accepted() {
        let now = OffsetDateTime::now_utc();
        let valid = sign_stripe_payload(SECRET, PAYLOAD, now.unix_timestamp());
        let header = format!("{},v1=deadbeef", valid);
        let verifier = StripeVerifier::new(SECRET, 300);
        assert!(verifier.verify(PAYLOAD, &header, now).is_ok());
    }

    #[test]
    fn test_malformed_header_rejected() {
        let verifier = StripeVerifier::new(SECRET, 300);
        let now = OffsetDateTime::now_utc();
        assert!(verifier.verify(PAYLOAD, "garbage", now).is_err());
        assert!(verifier.verify(PAYLOAD, "t=123", now).is_err());
        assert!(verifier.verify(PAYLOAD, "", now).is_err());
    }

    #[test]
    fn test_extreme_timestamps_rejected() {
        let verifier = StripeVerifier::new(SECRET, 300);
        let now = OffsetDateTime::now_utc();
        for t in [i64::MIN, i64::MAX] {
            let header = format!("t={},v1=00", t);
            assert!(matches!(
                verifier.verify(b"{}", &header, now),
                Err(BillingError::WebhookSignatureInvalid)
            ));
        }
    }

    #[test]
    fn test_signature_covers_raw_bytes() {
        let now = OffsetDateTime::now_utc();
        let verifier = StripeVerifier::new(SECRET, 300);
        let header = sign_stripe_payload(SECRET, &[0xff], now.unix_timestamp());
        assert!(verifier.verify(&[0xff], &header, now).is_ok());
        // Both bodies decode lossily to U+FFFD
        assert!(verifier.verify(&[0xfe], &header, now).is_err());
    }

    #[test]
    fn test_coinbase_signature() {
        let verifier = CoinbaseVerifier::new(CoinbaseConfig {
            webhook_secret: "cb_secret".into(),
        });
        let now = OffsetDateTime::now_utc();
        let signature = verifier.sign(PAYLOAD);
        assert!(verifier.verify(PAYLOAD, &signature, now).is_ok());
        assert!(verifier.verify(PAYLOAD, "00ff", now).is_err());
    }
}
