use base64::{engine::general_purpose::STANDARD, Engine as _};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use rand::RngCore;
use uuid::Uuid;
use x25519_dalek::{PublicKey as XPublicKey, StaticSecret};

use crate::model::Keyset;

/// Mints a fresh Ed25519 signing pair and an X25519 ECDH pair under a new
/// UUIDv4 `unique_key_id` (spec §4.B `GenerateKeyset`). All four key fields
/// are returned base64-encoded.
pub fn generate_keyset() -> Keyset {
    let mut seed = [0u8; 32];
    OsRng.fill_bytes(&mut seed);
    let signing_key = SigningKey::from_bytes(&seed);
    let verifying_key = signing_key.verifying_key();

    let encr_private = StaticSecret::random_from_rng(OsRng);
    let encr_public = XPublicKey::from(&encr_private);

    Keyset {
        unique_key_id: Uuid::new_v4().to_string(),
        signing_private: STANDARD.encode(signing_key.to_bytes()),
        signing_public: STANDARD.encode(verifying_key.to_bytes()),
        encr_private: STANDARD.encode(encr_private.to_bytes()),
        encr_public: STANDARD.encode(encr_public.to_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keyset_fields_are_base64_and_unique_ids_differ() {
        let a = generate_keyset();
        let b = generate_keyset();

        assert_ne!(a.unique_key_id, b.unique_key_id);
        assert!(STANDARD.decode(&a.signing_private).is_ok());
        assert!(STANDARD.decode(&a.signing_public).is_ok());
        assert!(STANDARD.decode(&a.encr_private).is_ok());
        assert!(STANDARD.decode(&a.encr_public).is_ok());
    }
}
