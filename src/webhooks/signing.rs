//! Webhook payload signing.
//!
//! Deliveries are signed with HMAC-SHA256 over the exact payload bytes
//! using the subscriber's secret. The signature travels in a fixed header
//! as `sha256=<hex>` alongside a unix timestamp and the event kind.

use hmac::{Hmac, Mac};
use sha2::Sha256;

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
pub const TIMESTAMP_HEADER: &str = "X-Webhook-Timestamp";
pub const EVENT_HEADER: &str = "X-Webhook-Event";

type HmacSha256 = Hmac<Sha256>;

/// Signature header value for a payload.
pub fn sign(secret: &str, payload: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(payload);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Constant-shape verification helper for receivers in tests.
pub fn verify(secret: &str, payload: &[u8], signature: &str) -> bool {
    sign(secret, payload) == signature
}
