//! OAuth2 Authorization Server (spec §4.6): the gateway is its own IdP for
//! its MCP endpoints — issuer, PKCE, and Dynamic Client Registration.

pub mod server;
pub mod store;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const CODE_TTL_SECS: i64 = 600;
pub const TOKEN_TTL_SECS: i64 = 3600;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Client {
    pub id: String,
    pub secret: String,
    pub redirect_uris: Vec<String>,
    pub grant_types: Vec<String>,
    pub response_types: Vec<String>,
    pub token_endpoint_auth_method: String,
    pub scope: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PkceMethod {
    Plain,
    S256,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthorizationCode {
    pub code: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub scope: String,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<PkceMethod>,
    pub expires_at: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Token {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub client_id: String,
    pub scope: String,
    pub expires_at: i64,
    pub created_at: i64,
}

/// 32 cryptographically random bytes, URL-safe base64 without padding —
/// used for authorization codes, access tokens, refresh tokens, and DCR
/// client secrets alike (spec §4.6 names the same construction for all
/// four).
pub fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// `S256(verifier) = base64url(SHA-256(verifier))`, per RFC 7636.
pub fn s256_challenge(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Recomputes the challenge from `verifier` by `method` and compares
/// against the stored `challenge`, using a constant-time comparison since
/// this guards a bearer-equivalent secret.
pub fn verify_pkce(method: PkceMethod, challenge: &str, verifier: &str) -> bool {
    let computed = match method {
        PkceMethod::Plain => verifier.to_string(),
        PkceMethod::S256 => s256_challenge(verifier),
    };
    constant_time_eq(computed.as_bytes(), challenge.as_bytes())
}

pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    a.len() == b.len() && a.ct_eq(b).into()
}

/// Scheme+host must match exactly; the registered URI's path must be a
/// prefix of the request's path (any suffix beyond it is accepted), per
/// spec §4.6 redirect_uri validation.
pub fn redirect_uri_matches(registered: &str, requested: &str) -> bool {
    let (Ok(reg), Ok(req)) = (
        reqwest::Url::parse(registered),
        reqwest::Url::parse(requested),
    ) else {
        return registered == requested;
    };
    reg.scheme() == req.scheme() && reg.host_str() == req.host_str() && reg.port_or_known_default() == req.port_or_known_default()
        && req.path().starts_with(reg.path())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pkce_s256_round_trip() {
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        let challenge = s256_challenge(verifier);
        assert!(verify_pkce(PkceMethod::S256, &challenge, verifier));
        assert!(!verify_pkce(
            PkceMethod::S256,
            &challenge,
            "wrong-verifier-12345678901234567890123"
        ));
    }

    #[test]
    fn pkce_plain_round_trip() {
        assert!(verify_pkce(PkceMethod::Plain, "abc", "abc"));
        assert!(!verify_pkce(PkceMethod::Plain, "abc", "xyz"));
    }

    #[test]
    fn redirect_uri_path_suffix_is_accepted() {
        assert!(redirect_uri_matches(
            "https://app.example/cb",
            "https://app.example/cb/extra"
        ));
        assert!(!redirect_uri_matches(
            "https://app.example/cb",
            "https://evil.example/cb"
        ));
    }

    #[test]
    fn random_tokens_are_unique_and_url_safe() {
        let a = random_token();
        let b = random_token();
        assert_ne!(a, b);
        assert!(!a.contains('+') && !a.contains('/') && !a.contains('='));
    }
}
