//! Webhook signature verification using HMAC-SHA256.
//!
//! The upstream tool signs each webhook delivery with HMAC-SHA256 over the
//! exact raw request bytes, using the shared secret from the owning sync
//! configuration. The signature arrives as a hex string in the signature
//! header.
//!
//! Verification is the first step in webhook processing; requests with
//! invalid signatures are rejected before anything is parsed or persisted.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Computes the HMAC-SHA256 signature of a payload using the given secret.
///
/// This is useful for testing purposes (generating expected signatures) and
/// for clients that need to sign outbound requests.
pub fn compute_signature(payload: &[u8], secret: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

/// Verifies a webhook signature against the payload and secret.
///
/// Returns `true` if the signature is valid, `false` otherwise.
///
/// The provided signature is hex-decoded and compared against the computed
/// digest using a constant-time comparison. A signature whose decoded length
/// differs from the digest length is rejected up front: the constant-time
/// path only protects equal-length comparisons, and a length mismatch can
/// never verify anyway.
///
/// # Arguments
///
/// * `payload` - The raw webhook payload bytes
/// * `provided_hex` - The hex signature from the request header
/// * `secret` - The shared secret from the sync configuration
///
/// # Examples
///
/// ```
/// use cogni_sync::webhooks::{compute_signature, verify_signature};
///
/// let payload = b"Hello, World!";
/// let secret = b"my-secret-key";
///
/// let hex_sig = hex::encode(compute_signature(payload, secret));
///
/// assert!(verify_signature(payload, &hex_sig, secret));
/// assert!(!verify_signature(payload, &hex_sig, b"wrong-secret"));
/// ```
pub fn verify_signature(payload: &[u8], provided_hex: &str, secret: &[u8]) -> bool {
    let provided = match hex::decode(provided_hex) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };

    // Hard length gate before the constant-time path. SHA-256 digests are
    // always 32 bytes; anything else cannot match.
    if provided.len() != <Sha256 as Digest>::output_size() {
        return false;
    }

    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(payload);

    // Constant-time comparison via the HMAC library
    mac.verify_slice(&provided).is_ok()
}
