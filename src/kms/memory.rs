//! In-memory KMS driver. Intended for development and tests; keys vanish
//! when the process exits.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use super::{rsa_util, Kms, KmsError};

#[derive(Clone)]
struct StoredKey {
    public_key: String,
    private_key: Option<String>,
    previous: Option<Box<StoredKey>>,
}

#[derive(Default)]
pub struct MemoryKms {
    user_keys: RwLock<HashMap<String, StoredKey>>,
    network_node_keys: RwLock<HashMap<String, StoredKey>>,
    network_management_keys: RwLock<HashMap<String, StoredKey>>,
}

impl MemoryKms {
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup(
        map: &RwLock<HashMap<String, StoredKey>>,
        id: &str,
        previous_version: bool,
    ) -> Result<StoredKey, KmsError> {
        let guard = map.read().expect("kms lock poisoned");
        let entry = guard
            .get(id)
            .ok_or_else(|| KmsError::NotFound(id.to_string()))?;

        if previous_version {
            return entry
                .previous
                .as_ref()
                .map(|k| (**k).clone())
                .ok_or_else(|| KmsError::NotFound(format!("no previous key for {id}")));
        }

        Ok(entry.clone())
    }
}

#[async_trait]
impl Kms for MemoryKms {
    async fn generate_user_key(&self, user_id: &str) -> Result<String, KmsError> {
        let (private_key, public_key) = rsa_util::generate_key_pair()?;
        self.user_keys.write().expect("kms lock poisoned").insert(
            user_id.to_string(),
            StoredKey {
                public_key: public_key.clone(),
                private_key: Some(private_key),
                previous: None,
            },
        );
        Ok(public_key)
    }

    async fn generate_network_node_key(&self, network_id: &str) -> Result<String, KmsError> {
        let (private_key, public_key) = rsa_util::generate_key_pair()?;
        let mut guard = self.network_node_keys.write().expect("kms lock poisoned");
        let previous = guard.get(network_id).cloned().map(Box::new);

        guard.insert(
            network_id.to_string(),
            StoredKey {
                public_key: public_key.clone(),
                private_key: Some(private_key),
                previous,
            },
        );
        Ok(public_key)
    }

    async fn generate_network_management_key(
        &self,
        network_id: &str,
    ) -> Result<(String, String), KmsError> {
        let (private_key, public_key) = rsa_util::generate_key_pair()?;
        self.store_network_management_key(network_id, &public_key, Some(&private_key))
            .await?;
        Ok((private_key, public_key))
    }

    async fn store_network_management_key(
        &self,
        network_id: &str,
        public_key: &str,
        private_key: Option<&str>,
    ) -> Result<(), KmsError> {
        let mut guard = self.network_management_keys.write().expect("kms lock poisoned");
        let previous = guard.get(network_id).cloned().map(Box::new);

        guard.insert(
            network_id.to_string(),
            StoredKey {
                public_key: public_key.to_string(),
                private_key: private_key.map(str::to_string),
                previous,
            },
        );

        Ok(())
    }

    async fn get_local_user_public_key(
        &self,
        user_id: &str,
        previous_version: bool,
    ) -> Result<String, KmsError> {
        Ok(Self::lookup(&self.user_keys, user_id, previous_version)?.public_key)
    }

    async fn get_network_node_public_key(
        &self,
        network_id: &str,
        previous_version: bool,
    ) -> Result<String, KmsError> {
        Ok(Self::lookup(&self.network_node_keys, network_id, previous_version)?.public_key)
    }

    async fn get_network_management_public_key(
        &self,
        network_id: &str,
        previous_version: bool,
    ) -> Result<String, KmsError> {
        Ok(Self::lookup(&self.network_management_keys, network_id, previous_version)?.public_key)
    }

    async fn get_network_management_private_key(
        &self,
        network_id: &str,
    ) -> Result<String, KmsError> {
        Self::lookup(&self.network_management_keys, network_id, false)?
            .private_key
            .ok_or_else(|| KmsError::NotFound(format!("no private key for {network_id}")))
    }

    async fn sign_payload(&self, payload: &str, network_id: &str) -> Result<String, KmsError> {
        let key = Self::lookup(&self.network_node_keys, network_id, false)?;
        let private_key = key
            .private_key
            .ok_or_else(|| KmsError::NotFound(format!("no private key for {network_id}")))?;
        rsa_util::sign(&private_key, payload)
    }

    async fn verify_signature(
        &self,
        payload: &str,
        public_pem: &str,
        signature: &str,
    ) -> Result<bool, KmsError> {
        rsa_util::verify(public_pem, payload, signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signs_and_verifies_round_trip() {
        let kms = MemoryKms::new();
        let public_key = kms.generate_network_node_key("net-1").await.unwrap();

        let signature = kms.sign_payload("hello", "net-1").await.unwrap();

        assert!(kms
            .verify_signature("hello", &public_key, &signature)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn rejects_tampered_payload() {
        let kms = MemoryKms::new();
        let public_key = kms.generate_network_node_key("net-1").await.unwrap();
        let signature = kms.sign_payload("hello", "net-1").await.unwrap();

        assert!(!kms
            .verify_signature("goodbye", &public_key, &signature)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn missing_key_is_not_found() {
        let kms = MemoryKms::new();
        let err = kms
            .get_network_node_public_key("missing", false)
            .await
            .unwrap_err();
        assert!(matches!(err, KmsError::NotFound(_)));
    }

    #[tokio::test]
    async fn keeps_previous_node_key_on_rotation() {
        let kms = MemoryKms::new();
        let first_public = kms.generate_network_node_key("net-1").await.unwrap();
        let second_public = kms.generate_network_node_key("net-1").await.unwrap();

        assert_ne!(first_public, second_public);
        assert_eq!(
            kms.get_network_node_public_key("net-1", false).await.unwrap(),
            second_public
        );
        assert_eq!(
            kms.get_network_node_public_key("net-1", true).await.unwrap(),
            first_public
        );
    }

    #[tokio::test]
    async fn keeps_previous_management_key_on_rotation() {
        let kms = MemoryKms::new();
        let (_, first_public) = kms.generate_network_management_key("net-1").await.unwrap();
        let (_, second_public) = kms.generate_network_management_key("net-1").await.unwrap();

        assert_ne!(first_public, second_public);
        assert_eq!(
            kms.get_network_management_public_key("net-1", false)
                .await
                .unwrap(),
            second_public
        );
        assert_eq!(
            kms.get_network_management_public_key("net-1", true)
                .await
                .unwrap(),
            first_public
        );
    }
}
