//! Contract-only stub for a HashiCorp Vault-backed driver. HSM/Vault
//! integration is an external collaborator, referenced here only by its
//! trait contract, per `DG_KMS_DRIVER=vault`'s configuration shape.

use async_trait::async_trait;

use super::{Kms, KmsError};

pub struct VaultKms {
    pub vault_url: String,
    pub role_id: String,
    pub secret_id: String,
}

impl VaultKms {
    pub fn new(vault_url: impl Into<String>, role_id: impl Into<String>, secret_id: impl Into<String>) -> Self {
        Self {
            vault_url: vault_url.into(),
            role_id: role_id.into(),
            secret_id: secret_id.into(),
        }
    }
}

#[async_trait]
impl Kms for VaultKms {
    async fn generate_user_key(&self, _user_id: &str) -> Result<String, KmsError> {
        Err(KmsError::Unavailable)
    }

    async fn generate_network_node_key(&self, _network_id: &str) -> Result<String, KmsError> {
        Err(KmsError::Unavailable)
    }

    async fn generate_network_management_key(&self, _network_id: &str) -> Result<(String, String), KmsError> {
        Err(KmsError::Unavailable)
    }

    async fn store_network_management_key(
        &self,
        _network_id: &str,
        _public_key: &str,
        _private_key: Option<&str>,
    ) -> Result<(), KmsError> {
        Err(KmsError::Unavailable)
    }

    async fn get_local_user_public_key(&self, _user_id: &str, _previous_version: bool) -> Result<String, KmsError> {
        Err(KmsError::Unavailable)
    }

    async fn get_network_node_public_key(
        &self,
        _network_id: &str,
        _previous_version: bool,
    ) -> Result<String, KmsError> {
        Err(KmsError::Unavailable)
    }

    async fn get_network_management_public_key(
        &self,
        _network_id: &str,
        _previous_version: bool,
    ) -> Result<String, KmsError> {
        Err(KmsError::Unavailable)
    }

    async fn get_network_management_private_key(&self, _network_id: &str) -> Result<String, KmsError> {
        Err(KmsError::Unavailable)
    }

    async fn sign_payload(&self, _payload: &str, _network_id: &str) -> Result<String, KmsError> {
        Err(KmsError::Unavailable)
    }

    async fn verify_signature(
        &self,
        _payload: &str,
        _public_pem: &str,
        _signature: &str,
    ) -> Result<bool, KmsError> {
        Err(KmsError::Unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_operation_reports_unavailable() {
        let kms = VaultKms::new("https://vault.local", "role", "secret");
        assert!(matches!(
            kms.generate_user_key("u-1").await,
            Err(KmsError::Unavailable)
        ));
    }
}
