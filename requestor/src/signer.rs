use hmac::Hmac;
use hmac::Mac;
use sha2::Sha256;

use crate::error::RequestorError;

/// Header carrying the webhook payload signature.
pub const SIGNATURE_HEADER: &str = "JB-Signature";

type HmacSha256 = Hmac<Sha256>;

/// Compute the `JB-Signature` header value for a webhook body:
/// `t=<unix_ts>,v1=<hmac_sha256_hex(secret, "<t>.<body>")>`.
pub fn signature(secret: &str, timestamp: u64, body: &str) -> Result<String, RequestorError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|err| RequestorError::Protocol(format!("invalid signing key: {err}")))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body.as_bytes());
    let digest = hex::encode(mac.finalize().into_bytes());
    Ok(format!("t={timestamp},v1={digest}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn signature_is_stable_for_fixed_inputs() {
        let a = signature("wh_secret", 1_700_000_000, r#"{"call_sid":"c1"}"#).unwrap();
        let b = signature("wh_secret", 1_700_000_000, r#"{"call_sid":"c1"}"#).unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("t=1700000000,v1="));
        let digest = a.split("v1=").nth(1).unwrap();
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn signature_varies_with_body_and_secret() {
        let base = signature("s1", 1, "body").unwrap();
        assert_ne!(base, signature("s2", 1, "body").unwrap());
        assert_ne!(base, signature("s1", 1, "other").unwrap());
        assert_ne!(base, signature("s1", 2, "body").unwrap());
    }
}
