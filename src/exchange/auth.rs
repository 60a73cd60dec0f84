//! HMAC-SHA256 request signing for private endpoints (§4.2).

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Sign a canonical `key=value&...` parameter string (parameters already
/// sorted lexicographically by key, `timestamp` already appended by the
/// caller) with the account secret, returning the hex signature.
pub fn sign(secret: &str, canonical_query: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(canonical_query.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Build the canonical query string for a private request: sort params
/// lexicographically by key and join as `key=value&...` (§4.2).
pub fn canonical_query(params: &[(&str, String)]) -> String {
    let mut sorted: Vec<&(&str, String)> = params.iter().collect();
    sorted.sort_by_key(|(k, _)| *k);
    sorted
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_query_sorts_by_key() {
        let params = vec![
            ("symbol", "BTC-USDT".to_string()),
            ("apiKey", "abc".to_string()),
            ("timestamp", "1700000000".to_string()),
        ];
        assert_eq!(
            canonical_query(&params),
            "apiKey=abc&symbol=BTC-USDT&timestamp=1700000000"
        );
    }

    #[test]
    fn sign_is_deterministic_and_hex() {
        let s1 = sign("secret", "a=1&b=2");
        let s2 = sign("secret", "a=1&b=2");
        assert_eq!(s1, s2);
        assert!(s1.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_eq!(s1.len(), 64, "SHA-256 hex digest is 64 chars");
    }

    #[test]
    fn different_secrets_yield_different_signatures() {
        assert_ne!(sign("secret-a", "a=1"), sign("secret-b", "a=1"));
    }
}
