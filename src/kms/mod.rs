//! Key Management Service: generates and stores the RSA key pairs used to
//! sign outgoing network messages, and verifies signatures on incoming
//! ones.
//!
//! The trait mirrors the original service's `Kms` abstract base: a network
//! has one "node" key pair (used to sign/verify ordinary traffic) and one
//! "management" key pair (used during admission handshakes, where the
//! private half may need to be handed to a brand-new member). A `memory`
//! driver is provided for development; `vault` is a contract-only stub —
//! HSM/Vault backends are out of scope as an external collaborator, not as
//! a trait this crate declines to define.

pub mod memory;
pub mod vault;

use async_trait::async_trait;

pub use memory::MemoryKms;
pub use vault::VaultKms;

#[derive(thiserror::Error, Debug)]
pub enum KmsError {
    #[error("key not found: {0}")]
    NotFound(String),
    #[error("rsa error: {0}")]
    Rsa(#[from] rsa::Error),
    #[error("pkcs8 error: {0}")]
    Pkcs8(String),
    #[error("invalid base64 signature: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("vault driver not wired to a backend yet")]
    Unavailable,
}

/// A stored key pair; the private half is optional since some drivers (a
/// hardware-backed KMS) may never export it.
#[derive(Clone)]
pub struct KeyPair {
    pub public_key: String,
    pub private_key: Option<String>,
}

#[async_trait]
pub trait Kms: Send + Sync {
    /// Generate a per-user key pair. Returns the public half; whether the
    /// private half is retrievable again depends on the driver.
    async fn generate_user_key(&self, user_id: &str) -> Result<String, KmsError>;

    /// Generate the node signing key for a network. Returns the public half.
    async fn generate_network_node_key(&self, network_id: &str) -> Result<String, KmsError>;

    /// Generate the management key pair for a network. Returns both halves,
    /// since the private key must be handed to invitees during admission.
    async fn generate_network_management_key(
        &self,
        network_id: &str,
    ) -> Result<(String, String), KmsError>;

    /// Import (or overwrite) a network's management key pair, keeping the
    /// previous version retrievable via `previous_version`.
    async fn store_network_management_key(
        &self,
        network_id: &str,
        public_key: &str,
        private_key: Option<&str>,
    ) -> Result<(), KmsError>;

    async fn get_local_user_public_key(
        &self,
        user_id: &str,
        previous_version: bool,
    ) -> Result<String, KmsError>;

    async fn get_network_node_public_key(
        &self,
        network_id: &str,
        previous_version: bool,
    ) -> Result<String, KmsError>;

    async fn get_network_management_public_key(
        &self,
        network_id: &str,
        previous_version: bool,
    ) -> Result<String, KmsError>;

    async fn get_network_management_private_key(
        &self,
        network_id: &str,
    ) -> Result<String, KmsError>;

    /// Sign `payload` with the network's node key, returning a base64
    /// RSA-PSS/SHA-256 signature.
    async fn sign_payload(&self, payload: &str, network_id: &str) -> Result<String, KmsError>;

    /// Verify a base64 RSA-PSS/SHA-256 `signature` of `payload` against
    /// `public_pem`.
    async fn verify_signature(
        &self,
        payload: &str,
        public_pem: &str,
        signature: &str,
    ) -> Result<bool, KmsError>;
}

pub(crate) mod rsa_util {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
    use rsa::traits::PublicKeyParts;
    use rsa::{Pss, RsaPrivateKey, RsaPublicKey};
    use sha2::{Digest, Sha256};

    use super::KmsError;

    const SHA256_DIGEST_LEN: usize = 32;

    pub fn generate_key_pair() -> Result<(String, String), KmsError> {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 4096)?;
        let public_key = RsaPublicKey::from(&private_key);

        let private_pem = private_key
            .to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
            .map_err(|e| KmsError::Pkcs8(e.to_string()))?
            .to_string();
        let public_pem = public_key
            .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
            .map_err(|e| KmsError::Pkcs8(e.to_string()))?;

        Ok((private_pem, public_pem))
    }

    /// Max-length salt, matching `padding.PSS.MAX_LENGTH` on the Python
    /// side: `key_size_in_bytes - hash_len - 2`.
    fn max_salt_len(key_size_bytes: usize) -> usize {
        key_size_bytes - SHA256_DIGEST_LEN - 2
    }

    pub fn sign(private_pem: &str, payload: &str) -> Result<String, KmsError> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(private_pem)
            .map_err(|e| KmsError::Pkcs8(e.to_string()))?;
        let digest = Sha256::digest(payload.as_bytes());
        let padding = Pss::new_with_salt::<Sha256>(max_salt_len(private_key.size()));
        let mut rng = rand::thread_rng();

        let signature = private_key.sign_with_rng(&mut rng, padding, &digest)?;

        Ok(STANDARD.encode(signature))
    }

    pub fn verify(public_pem: &str, payload: &str, signature_b64: &str) -> Result<bool, KmsError> {
        let public_key = RsaPublicKey::from_public_key_pem(public_pem)
            .map_err(|e| KmsError::Pkcs8(e.to_string()))?;
        let signature_bytes = STANDARD.decode(signature_b64)?;
        let digest = Sha256::digest(payload.as_bytes());
        let padding = Pss::new_with_salt::<Sha256>(max_salt_len(public_key.size()));

        Ok(public_key.verify(padding, &digest, &signature_bytes).is_ok())
    }
}
