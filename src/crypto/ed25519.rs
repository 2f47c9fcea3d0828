//! ed25519 signing and verification via `ed25519-dalek`.

use super::{NodeSigner, PublicKey, Signature, SignatureError, SignatureVerifier};
use ed25519_dalek::{Signer as _, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use std::io::Write;
use std::path::Path;

const KEY_FILE: &str = "keys.bin";

/// The node's ed25519 identity. The 32-byte seed doubles as the transport
/// identity seed, so a peer id is a pure function of the ledger key.
#[derive(Clone)]
pub struct NodeKeypair {
    secret: SigningKey,
}

impl NodeKeypair {
    pub fn generate() -> Self {
        Self { secret: SigningKey::generate(&mut OsRng) }
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self { secret: SigningKey::from_bytes(&seed) }
    }

    pub fn seed(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    /// Load the key file from the data directory, or generate one and
    /// persist it owner-readable only.
    pub fn load_or_create(data_dir: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join(KEY_FILE);
        if let Ok(bytes) = std::fs::read(&path) {
            if let Ok(seed) = <[u8; 32]>::try_from(bytes.as_slice()) {
                return Ok(Self::from_seed(seed));
            }
        }
        let keypair = Self::generate();
        let mut f = std::fs::File::create(&path)?;
        f.write_all(&keypair.seed())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600));
        }
        Ok(keypair)
    }
}

impl NodeSigner for NodeKeypair {
    fn public_key(&self) -> PublicKey {
        PublicKey(self.secret.verifying_key().to_bytes().to_vec())
    }

    fn sign(&self, msg: &[u8]) -> Signature {
        Signature(self.secret.sign(msg).to_bytes().to_vec())
    }
}

/// Strict ed25519 verification; rejects malleable encodings.
pub struct Ed25519Oracle;

impl SignatureVerifier for Ed25519Oracle {
    fn verify(pk: &PublicKey, msg: &[u8], sig: &Signature) -> Result<(), SignatureError> {
        let Ok(key_bytes) = <&[u8; 32]>::try_from(pk.0.as_slice()) else {
            return Err(SignatureError::Malformed("public key must be 32 bytes".into()));
        };
        let key = VerifyingKey::from_bytes(key_bytes)
            .map_err(|e| SignatureError::Malformed(e.to_string()))?;
        let Ok(sig_bytes) = <&[u8; 64]>::try_from(sig.0.as_slice()) else {
            return Err(SignatureError::Malformed("signature must be 64 bytes".into()));
        };
        key.verify_strict(msg, &ed25519_dalek::Signature::from_bytes(sig_bytes))
            .map_err(|_| SignatureError::Verification)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_rejects_wrong_message_and_wrong_key() {
        let alice = NodeKeypair::from_seed([7; 32]);
        let bob = NodeKeypair::from_seed([8; 32]);
        let sig = alice.sign(b"payload");
        assert!(Ed25519Oracle::verify(&alice.public_key(), b"payload", &sig).is_ok());
        assert!(Ed25519Oracle::verify(&alice.public_key(), b"other", &sig).is_err());
        assert!(Ed25519Oracle::verify(&bob.public_key(), b"payload", &sig).is_err());
    }

    #[test]
    fn truncated_key_material_is_malformed() {
        let kp = NodeKeypair::from_seed([7; 32]);
        let sig = kp.sign(b"payload");
        let short_key = PublicKey(vec![1; 31]);
        assert!(matches!(
            Ed25519Oracle::verify(&short_key, b"payload", &sig),
            Err(SignatureError::Malformed(_))
        ));
        let short_sig = Signature(vec![1; 63]);
        assert!(matches!(
            Ed25519Oracle::verify(&kp.public_key(), b"payload", &short_sig),
            Err(SignatureError::Malformed(_))
        ));
    }

    #[test]
    fn key_file_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let first = NodeKeypair::load_or_create(dir.path()).unwrap();
        let second = NodeKeypair::load_or_create(dir.path()).unwrap();
        assert_eq!(first.public_key(), second.public_key());
    }
}
