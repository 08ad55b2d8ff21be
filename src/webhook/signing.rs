//! HMAC-SHA256 request signing for outbound webhook deliveries (spec §4.7,
//! §6). Grounded on the teacher's existing `sha2` dependency, paired with
//! the `hmac` crate for a keyed digest over an arbitrary per-subscription
//! secret (the teacher itself never needs HMAC — Stripe webhook
//! verification there is handled by `async-stripe`, which this crate drops).

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header name carrying the hex-encoded signature, `v1=<hex>`.
pub const SIGNATURE_HEADER: &str = "X-Flyover-Signature";
pub const TIMESTAMP_HEADER: &str = "X-Flyover-Timestamp";
pub const EVENT_HEADER: &str = "X-Flyover-Event";
pub const DELIVERY_HEADER: &str = "X-Flyover-Delivery";
pub const EVENT_ID_HEADER: &str = "X-Flyover-Event-Id";

/// Compute `hex(HMAC-SHA256(secret, "${timestamp_ms}.${body}"))`, the
/// signature scheme both the dispatcher and any subscriber-side verifier
/// reproduce independently (spec §8 "round-trip signature" law).
pub fn sign(secret: &str, timestamp_ms: i64, body: &str) -> String {
    let signed_payload = format!("{timestamp_ms}.{body}");
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts a key of any length");
    mac.update(signed_payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Format the full header value, `v1=<hex>`.
pub fn signature_header_value(secret: &str, timestamp_ms: i64, body: &str) -> String {
    format!("v1={}", sign(secret, timestamp_ms, body))
}

/// Verify a `v1=<hex>` header value against a recomputed signature.
/// Subscriber-side helper, exercised here so the scheme is covered by a
/// round-trip test even though out-of-scope services own real verification.
pub fn verify(secret: &str, timestamp_ms: i64, body: &str, header_value: &str) -> bool {
    let Some(hex_sig) = header_value.strip_prefix("v1=") else {
        return false;
    };
    let expected = sign(secret, timestamp_ms, body);
    // constant-time-ish via length check then byte compare is unnecessary
    // for an HMAC hex digest of equal fixed length; use a simple compare.
    expected.eq_ignore_ascii_case(hex_sig)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_signature_matches() {
        let secret = "whsec_test";
        let body = r#"{"id":"abc","type":"aircraft.position_update"}"#;
        let ts = 1_700_000_000_000_i64;
        let header = signature_header_value(secret, ts, body);
        assert!(verify(secret, ts, body, &header));
    }

    #[test]
    fn verify_rejects_wrong_secret() {
        let header = signature_header_value("secret-a", 1000, "body");
        assert!(!verify("secret-b", 1000, "body", &header));
    }

    #[test]
    fn verify_rejects_tampered_body() {
        let header = signature_header_value("secret", 1000, "original");
        assert!(!verify("secret", 1000, "tampered", &header));
    }

    #[test]
    fn verify_rejects_malformed_header() {
        assert!(!verify("secret", 1000, "body", "not-v1-prefixed"));
    }
}
