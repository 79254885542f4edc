use subtle::ConstantTimeEq;

/// Compare a bearer token with the configured secret in constant time.
pub fn api_secret_matches(token: &str, secret: &str) -> bool {
    bool::from(token.as_bytes().ct_eq(secret.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_secret_matches() {
        assert!(api_secret_matches("s3cret", "s3cret"));
        assert!(!api_secret_matches("s3cret", "s3cre"));
        assert!(!api_secret_matches("", "s3cret"));
    }
}
