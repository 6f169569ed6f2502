use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::CoreResult;

/// Mints a random challenge and verifies an echoed answer (spec §4.C). The
/// service keeps no state of its own beyond what `verify` needs to compare
/// — callers are responsible for persisting the minted challenge alongside
/// whatever workflow it belongs to. Both operations are pure and safe for
/// concurrent use.
pub trait ChallengeService: Send + Sync {
    fn new_challenge(&self) -> CoreResult<String>;

    fn verify(&self, challenge: &str, answer: &str) -> bool;
}

pub struct RandomChallengeService;

impl ChallengeService for RandomChallengeService {
    fn new_challenge(&self) -> CoreResult<String> {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Ok(URL_SAFE_NO_PAD.encode(bytes))
    }

    fn verify(&self, challenge: &str, answer: &str) -> bool {
        challenge == answer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_challenge_is_url_safe_and_nonempty() {
        let svc = RandomChallengeService;
        let c = svc.new_challenge().unwrap();
        assert!(!c.is_empty());
        assert!(c.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_'));
    }

    #[test]
    fn new_challenge_calls_are_unique() {
        let svc = RandomChallengeService;
        let a = svc.new_challenge().unwrap();
        let b = svc.new_challenge().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn verify_matches_exact_echo_and_rejects_mismatch() {
        let svc = RandomChallengeService;
        assert!(svc.verify("abc", "abc"));
        assert!(!svc.verify("abc", "xyz"));
    }
}
