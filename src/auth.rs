//! Shared-secret token service.
//!
//! The host process generates a secret and hands it to the worker either via
//! `--token` at spawn time or through the unauthenticated `RegisterToken`
//! bootstrap command. Every other API command must present the secret in the
//! `token` request header.
//!
//! Registration always overwrites: re-registering invalidates all requests
//! still carrying the previous secret. Validation against an unset or empty
//! secret always fails, so a worker that never received a token rejects every
//! protected command.

use std::sync::Mutex;

/// In-memory shared-secret store. One per process, injected by handle.
#[derive(Default)]
pub struct TokenService {
    token: Mutex<Option<String>>,
}

impl TokenService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` as the current secret, replacing any previous one.
    pub fn register_token(&self, value: &str) {
        let mut guard = self.token.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(value.to_string());
    }

    /// True if a non-empty secret has been registered.
    pub fn is_token_set(&self) -> bool {
        let guard = self.token.lock().unwrap_or_else(|e| e.into_inner());
        guard.as_deref().map(|t| !t.is_empty()).unwrap_or(false)
    }

    /// Exact-match check. Unset or empty secrets never validate.
    pub fn validate(&self, candidate: &str) -> bool {
        let guard = self.token.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_deref() {
            Some(token) if !token.is_empty() => token == candidate,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_fails_before_registration() {
        let svc = TokenService::new();
        assert!(!svc.is_token_set());
        assert!(!svc.validate(""));
        assert!(!svc.validate("anything"));
    }

    #[test]
    fn test_validate_exact_match_only() {
        let svc = TokenService::new();
        svc.register_token("abc123");
        assert!(svc.is_token_set());
        assert!(svc.validate("abc123"));
        assert!(!svc.validate("abc12"));
        assert!(!svc.validate("ABC123"));
        assert!(!svc.validate(""));
    }

    #[test]
    fn test_reregistration_overwrites() {
        let svc = TokenService::new();
        svc.register_token("first");
        svc.register_token("second");
        assert!(!svc.validate("first"));
        assert!(svc.validate("second"));
    }

    #[test]
    fn test_empty_token_counts_as_unset() {
        let svc = TokenService::new();
        svc.register_token("");
        assert!(!svc.is_token_set());
        assert!(!svc.validate(""));
    }
}
