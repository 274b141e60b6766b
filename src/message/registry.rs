//! Custom-message catalog: response/precedence/async/destination rules,
//! keyed by fully-qualified id (`basePackage.id`), per `model/
//! network_message/registry.py`'s `NetworkMessageRegistry`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::MessageError;

pub const CORE_PACKAGE: &str = "link.dedi.core";

/// One catalog entry. `response_id`/`preceding_id` are fully-qualified ids
/// of the paired message; a message with `preceding_id` set may only ever
/// appear as a response, never be originated directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageConfig {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preceding: Option<String>,
    #[serde(default)]
    pub asynchronous: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PackageFile {
    base_package: String,
    messages: Vec<MessageConfig>,
}

/// Loaded catalog: fully-qualified id -> config. Not a global singleton
/// (see `engine`); one instance lives on the `Engine` and is shared via
/// `Arc`.
#[derive(Debug, Default)]
pub struct MessageRegistry {
    configs: HashMap<String, MessageConfig>,
    loaded_packages: Vec<String>,
}

impl MessageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one package configuration document (as would be read from a
    /// catalog file) and merge its entries in.
    pub fn load_package_str(&mut self, contents: &str) -> Result<(), MessageError> {
        let package: PackageFile = serde_json::from_str(contents)
            .map_err(|e| MessageError::ConfigurationParsing(e.to_string()))?;

        if self.loaded_packages.contains(&package.base_package) {
            return Err(MessageError::ConfigurationParsing(format!(
                "package {} already loaded",
                package.base_package
            )));
        }

        for message in package.messages {
            let fq_id = format!("{}.{}", package.base_package, message.id);
            self.configs.insert(fq_id, message);
        }
        self.loaded_packages.push(package.base_package);

        Ok(())
    }

    pub fn get(&self, fully_qualified_id: &str) -> Result<&MessageConfig, MessageError> {
        self.configs
            .get(fully_qualified_id)
            .ok_or_else(|| MessageError::ConfigurationNotFound(fully_qualified_id.to_string()))
    }

    /// Whether `fully_qualified_id` may only be originated as a response to
    /// another message (i.e. has a `preceding` id set).
    pub fn is_response_only(&self, fully_qualified_id: &str) -> bool {
        self.configs
            .get(fully_qualified_id)
            .map(|c| c.preceding.is_some())
            .unwrap_or(false)
    }

    pub fn destination(&self, fully_qualified_id: &str) -> Option<&str> {
        self.configs
            .get(fully_qualified_id)
            .and_then(|c| c.destination.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_package_and_resolves_fully_qualified_id() {
        let mut registry = MessageRegistry::new();
        registry
            .load_package_str(
                r#"{"basePackage":"com.example","messages":[{"id":"ping"},{"id":"pong","preceding":"com.example.ping"}]}"#,
            )
            .unwrap();

        assert!(registry.get("com.example.ping").is_ok());
        assert!(registry.is_response_only("com.example.pong"));
        assert!(!registry.is_response_only("com.example.ping"));
    }

    #[test]
    fn rejects_duplicate_package() {
        let mut registry = MessageRegistry::new();
        let doc = r#"{"basePackage":"com.example","messages":[]}"#;
        registry.load_package_str(doc).unwrap();

        assert!(registry.load_package_str(doc).is_err());
    }

    #[test]
    fn unknown_id_is_configuration_not_found() {
        let registry = MessageRegistry::new();
        assert!(matches!(
            registry.get("nope"),
            Err(MessageError::ConfigurationNotFound(_))
        ));
    }
}
