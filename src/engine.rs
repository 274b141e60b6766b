//! Explicit engine context, replacing the original's global per-driver
//! singletons (active database/cache/broker/KMS) with a struct built once at
//! startup from [`crate::config::Config`] and threaded through every
//! component (`spec.md` §9 REDESIGN FLAGS guidance).

use std::sync::Arc;

use reqwest::Client;

use crate::broker::Broker;
use crate::config::Config;
use crate::db::memory::MemoryDb;
use crate::kms::memory::MemoryKms;
use crate::kms::vault::VaultKms;
use crate::kms::Kms;
use crate::message::MessageRegistry;
use crate::route::RouteCache;
use crate::transport::Transport;

/// Everything a component needs to do its job, shared behind `Arc` handles.
/// Constructed once in `main` and cloned cheaply into every task.
#[derive(Clone)]
pub struct Engine {
    pub config: Arc<Config>,
    pub db: Arc<MemoryDb>,
    pub kms: Arc<dyn Kms>,
    pub broker: Arc<Broker>,
    pub routes: Arc<RouteCache>,
    pub registry: Arc<MessageRegistry>,
    pub http_client: Client,
    pub transport: Arc<Transport>,
}

impl Engine {
    pub fn new(config: Config) -> Self {
        let mut registry = MessageRegistry::new();
        registry
            .load_package_str(include_str!("../catalog/link.dedi.core.json"))
            .expect("built-in message catalog must parse");

        let http_client = Client::builder()
            .build()
            .expect("default reqwest client always builds");

        let kms: Arc<dyn Kms> = if config.kms_driver == "vault" {
            Arc::new(VaultKms::new(
                config.vault_url.clone().unwrap_or_default(),
                config.vault_role_id.clone().unwrap_or_default(),
                config.vault_secret_id.clone().unwrap_or_default(),
            ))
        } else {
            Arc::new(MemoryKms::new())
        };

        Self {
            config: Arc::new(config),
            db: Arc::new(MemoryDb::new()),
            kms,
            broker: Arc::new(Broker::new()),
            routes: Arc::new(RouteCache::new()),
            registry: Arc::new(registry),
            http_client,
            transport: Arc::new(Transport::new()),
        }
    }

    /// This node's self-description for a network it is a member of,
    /// advertised during admission and connectivity probes.
    pub fn access_url(&self) -> &str {
        &self.config.access_url
    }
}
