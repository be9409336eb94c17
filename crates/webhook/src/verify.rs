//! Webhook signature verification.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the HMAC signature.
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";
/// Header carrying the event kind.
pub const EVENT_HEADER: &str = "x-github-event";
/// Header carrying the host's delivery id.
pub const DELIVERY_HEADER: &str = "x-github-delivery";

/// Verify an HMAC-SHA-256 signature over the raw request body.
///
/// The signature header value is `sha256=<hex>`. Comparison is constant
/// time to prevent timing attacks.
#[must_use]
pub fn verify_signature(body: &[u8], signature: &str, secret: &str) -> bool {
    let Some(hex_digest) = signature.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(signature_bytes) = hex::decode(hex_digest) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    let computed = mac.finalize().into_bytes();

    computed.as_slice().ct_eq(&signature_bytes).into()
}

/// Compute the `sha256=<hex>` signature for a body (test helper and CLI
/// debugging aid).
#[must_use]
pub fn sign(body: &[u8], secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key size");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}
