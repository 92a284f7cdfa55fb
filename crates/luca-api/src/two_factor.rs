//! 2FA verifier for `CRITICAL`-autonomy actions (§4.14).
//!
//! Production wiring is a single shared operator code compared in constant
//! time — same `subtle::ConstantTimeEq` idiom as [`kiss_flow::auth`]. A real
//! deployment would swap this for a TOTP or SMS provider without touching
//! [`kiss_cases::action_bus::ActionBus`].

use kiss_cases::action_bus::TwoFactorVerifier;
use subtle::ConstantTimeEq;

pub struct SharedCodeVerifier {
    code: Option<String>,
}

impl SharedCodeVerifier {
    pub fn new(code: Option<String>) -> Self {
        Self { code }
    }
}

impl TwoFactorVerifier for SharedCodeVerifier {
    fn verify(&self, _actor: &str, code: &str) -> bool {
        match &self.code {
            Some(expected) => expected.as_bytes().ct_eq(code.as_bytes()).into(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_configured_code() {
        let v = SharedCodeVerifier::new(Some("123456".to_string()));
        assert!(v.verify("oncall", "123456"));
        assert!(!v.verify("oncall", "000000"));
    }

    #[test]
    fn unconfigured_verifier_rejects_everything() {
        let v = SharedCodeVerifier::new(None);
        assert!(!v.verify("oncall", "anything"));
    }
}
