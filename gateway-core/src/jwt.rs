/// External collaborator (spec.md §1): verifies admin-endpoint bearer
/// tokens. The core never signs or issues these tokens itself — that's the
/// apiserver's job — it only verifies what arrives.
pub trait JwtVerifier: Send + Sync + 'static {
    /// Returns the verified subject on success.
    fn verify(&self, token: &str) -> Result<String, String>;
}

/// A verifier that accepts nothing; useful as a safe default when no admin
/// surface is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct DenyAllVerifier;

impl JwtVerifier for DenyAllVerifier {
    fn verify(&self, _token: &str) -> Result<String, String> {
        Err("admin endpoints not configured".to_string())
    }
}

#[cfg(test)]
pub mod test_support {
    use super::JwtVerifier;

    /// Accepts any non-empty token, returning it as the subject. Only for
    /// tests that need to exercise the admin surface without wiring a real
    /// verifier.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct AllowAllVerifier;

    impl JwtVerifier for AllowAllVerifier {
        fn verify(&self, token: &str) -> Result<String, String> {
            if token.is_empty() {
                Err("empty token".to_string())
            } else {
                Ok(token.to_string())
            }
        }
    }
}
