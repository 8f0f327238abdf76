use base58::ToBase58;
use ed25519_dalek::ed25519::signature::Signer;
use ed25519_dalek::{SECRET_KEY_LENGTH, Signature, SigningKey, VerifyingKey};
use engram_facts::protocol::Envelope;

use crate::EngramRemoteError;

/// Cryptographic identifier (an ed25519 public key) representing a principal
/// that produces commands.
pub type Principal = [u8; 32];

/// Represents the principal operating a replica: the holder of the signing
/// key that authorizes its outgoing commands.
#[derive(Clone)]
pub struct Authority {
    id: String,
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl Authority {
    /// Creates a new authority from a passphrase by hashing it to derive a
    /// signing key.
    pub fn from_passphrase(passphrase: &str) -> Self {
        let bytes = passphrase.as_bytes();
        Self::from_secret(blake3_hash(bytes))
    }

    /// Creates a new authority from a secret key.
    pub fn from_secret(secret: [u8; SECRET_KEY_LENGTH]) -> Self {
        Authority::new(SigningKey::from_bytes(&secret))
    }

    /// Creates a new authority from a signing key.
    pub fn new(signing_key: SigningKey) -> Self {
        let verifying_key = signing_key.verifying_key();
        const PREFIX: &str = "z6Mk";
        let id = [
            PREFIX,
            verifying_key.as_bytes().as_ref().to_base58().as_str(),
        ]
        .concat();

        Self {
            id: format!("did:key:{id}"),
            signing_key,
            verifying_key,
        }
    }

    /// Generates a new authority with a random signing key.
    pub fn generate() -> Self {
        Self::new(SigningKey::generate(&mut rand::thread_rng()))
    }

    /// Signs a payload with this authority's signing key.
    pub fn sign(&self, payload: &[u8]) -> Signature {
        self.signing_key.sign(payload)
    }

    /// Produce the signed form of a command envelope. The signature covers
    /// the canonical byte form of the envelope with its signature stripped.
    pub fn seal(&self, envelope: Envelope) -> Result<Envelope, EngramRemoteError> {
        let envelope = Envelope {
            issuer: self.id.clone(),
            ..envelope
        };
        let payload = envelope.unsigned_payload()?;
        let signature = self.sign(&payload);

        Ok(Envelope {
            signature: Some(signature.to_bytes().to_base58()),
            ..envelope
        })
    }

    /// Returns the DID (Decentralized Identifier) for this authority.
    pub fn did(&self) -> &str {
        &self.id
    }

    /// Returns the principal (public key bytes) for this authority.
    pub fn principal(&self) -> &Principal {
        self.verifying_key.as_bytes()
    }
}

fn blake3_hash(bytes: &[u8]) -> [u8; SECRET_KEY_LENGTH] {
    engram_facts::make_reference(bytes)
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use ed25519_dalek::Verifier;
    use engram_facts::protocol::{Command, Envelope, Query};
    use engram_facts::{FactSelector, MediaType, Space};

    use super::Authority;

    #[cfg(all(target_arch = "wasm32", target_os = "unknown"))]
    use wasm_bindgen_test::wasm_bindgen_test;

    #[cfg_attr(all(target_arch = "wasm32", target_os = "unknown"), wasm_bindgen_test)]
    #[cfg_attr(not(target_arch = "wasm32"), test)]
    fn it_derives_a_stable_did_from_a_passphrase() {
        let one = Authority::from_passphrase("correct horse battery staple");
        let other = Authority::from_passphrase("correct horse battery staple");

        assert_eq!(one.did(), other.did());
        assert!(one.did().starts_with("did:key:z6Mk"));
    }

    #[cfg_attr(all(target_arch = "wasm32", target_os = "unknown"), wasm_bindgen_test)]
    #[cfg_attr(not(target_arch = "wasm32"), test)]
    fn it_seals_envelopes_with_a_verifiable_signature() -> Result<()> {
        let authority = Authority::generate();

        let envelope = Envelope {
            id: 1,
            space: Space::generate()?,
            issuer: String::new(),
            command: Command::Query(Query {
                select: FactSelector::new().the(MediaType::json()).into(),
                since: None,
            }),
            signature: None,
        };

        let sealed = authority.seal(envelope)?;

        assert_eq!(sealed.issuer, authority.did());

        let payload = sealed.unsigned_payload()?;
        let signature_bytes = base58::FromBase58::from_base58(
            sealed.signature.as_deref().expect("envelope is signed"),
        )
        .expect("signature is base58");
        let signature = ed25519_dalek::Signature::from_slice(&signature_bytes)?;

        ed25519_dalek::VerifyingKey::from_bytes(authority.principal())?
            .verify(&payload, &signature)?;

        Ok(())
    }
}
