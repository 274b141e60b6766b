//! User identities and mapping, a minor self-contained subsystem carried
//! over from the original `model/user.py` / `model/user_mapping.py`. Not
//! wired to the HTTP surface yet (see `SPEC_FULL.md` §3) — the admission
//! protocol operates on nodes, not end users.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIdentity {
    pub idp: String,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub user_id: String,
    #[serde(default)]
    pub identities: Vec<UserIdentity>,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum UserMappingError {
    #[error("no user id provided")]
    MissingUserId,
    #[error("user id {0} not found in mapping")]
    Unmapped(String),
}

/// Controls how an externally supplied user id is translated to a local
/// id: passed through unchanged, pinned to one fixed id, or looked up in a
/// table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mappingType", rename_all = "camelCase")]
pub enum UserMapping {
    #[serde(rename = "noMapping")]
    NoMapping,
    #[serde(rename = "static")]
    Static { static_id: String },
    #[serde(rename = "dynamic")]
    Dynamic {
        dynamic_mapping: std::collections::HashMap<String, String>,
    },
}

impl UserMapping {
    pub fn map(&self, user_id: Option<&str>) -> Result<String, UserMappingError> {
        match self {
            UserMapping::NoMapping => {
                user_id.map(str::to_string).ok_or(UserMappingError::MissingUserId)
            }
            UserMapping::Static { static_id } => Ok(static_id.clone()),
            UserMapping::Dynamic { dynamic_mapping } => {
                let user_id = user_id.ok_or(UserMappingError::MissingUserId)?;
                dynamic_mapping
                    .get(user_id)
                    .cloned()
                    .ok_or_else(|| UserMappingError::Unmapped(user_id.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_mapping_passes_through() {
        let mapping = UserMapping::NoMapping;
        assert_eq!(mapping.map(Some("alice")).unwrap(), "alice");
        assert_eq!(mapping.map(None).unwrap_err(), UserMappingError::MissingUserId);
    }

    #[test]
    fn static_mapping_ignores_input() {
        let mapping = UserMapping::Static {
            static_id: "shared-user".to_string(),
        };
        assert_eq!(mapping.map(None).unwrap(), "shared-user");
        assert_eq!(mapping.map(Some("anything")).unwrap(), "shared-user");
    }

    #[test]
    fn dynamic_mapping_looks_up_table() {
        let mut table = std::collections::HashMap::new();
        table.insert("alice".to_string(), "a-local".to_string());
        let mapping = UserMapping::Dynamic { dynamic_mapping: table };

        assert_eq!(mapping.map(Some("alice")).unwrap(), "a-local");
        assert_eq!(
            mapping.map(Some("bob")).unwrap_err(),
            UserMappingError::Unmapped("bob".to_string())
        );
    }
}
