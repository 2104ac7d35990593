// ===============================
// src/signing.rs
// ===============================
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// API key pair. The secret never appears in `Debug` output.
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl Credentials {
    pub fn new(api_key: &str, api_secret: &str) -> Self {
        Self { api_key: api_key.to_string(), api_secret: api_secret.to_string() }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials").field("api_key", &self.api_key).field("api_secret", &"***").finish()
    }
}

pub fn timestamp_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Hex HMAC-SHA256 of `payload`.
pub fn sign(secret: &str, payload: &str) -> String {
    // HMAC accepts keys of any length, so this cannot fail.
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => unreachable!("hmac key of any size"),
    };
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// REST string-to-sign: timestamp + api_key + recv_window + (query | body).
pub fn rest_payload(timestamp: i64, api_key: &str, recv_window: u64, query_or_body: &str) -> String {
    format!("{timestamp}{api_key}{recv_window}{query_or_body}")
}

/// Private stream auth signs "GET/realtime" + expiry.
pub fn ws_auth_signature(secret: &str, expires_ms: i64) -> String {
    sign(secret, &format!("GET/realtime{expires_ms}"))
}

/// Query string in the order given; values url-encoded.
pub fn encode_query(params: &[(String, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_matches_reference_vector() {
        // RFC 4231 test case 2
        let sig = sign("Jefe", "what do ya want for nothing?");
        assert_eq!(sig, "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843");
    }

    #[test]
    fn rest_payload_layout() {
        let p = rest_payload(1658384314791, "XXXXXXXXXX", 5000, "category=option&symbol=BTC-29JUL22-25000-C");
        assert_eq!(p, "1658384314791XXXXXXXXXX5000category=option&symbol=BTC-29JUL22-25000-C");
    }

    #[test]
    fn query_keeps_order_and_encodes() {
        let q = encode_query(&[("symbol".into(), "BTCUSDT".into()), ("cursor".into(), "a b".into())]);
        assert_eq!(q, "symbol=BTCUSDT&cursor=a%20b");
    }

    #[test]
    fn debug_hides_secret() {
        let c = Credentials { api_key: "k".into(), api_secret: "s3cret".into() };
        assert!(!format!("{c:?}").contains("s3cret"));
    }
}
