use blockflow::context::ContextAssembler;
use blockflow::proxy::ProviderProxy;
use blockflow::store::InMemoryStore;
use blockflow::vault::{CredentialVault, Secret};
use std::sync::Arc;

use crate::configuration::Settings;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<InMemoryStore>,
    pub assembler: ContextAssembler,
    pub vault: CredentialVault,
    pub proxy: ProviderProxy,
    pub webhook_secret: Secret,
    pub default_budget_chars: usize,
}

impl AppState {
    pub fn new(
        store: Arc<InMemoryStore>,
        vault: CredentialVault,
        proxy: ProviderProxy,
        webhook_secret: Secret,
        default_budget_chars: usize,
    ) -> Self {
        Self {
            assembler: ContextAssembler::new(store.clone()),
            store,
            vault,
            proxy,
            webhook_secret,
            default_budget_chars,
        }
    }

    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let proxy = ProviderProxy::new(settings.proxy_config())?;
        Ok(Self::new(
            Arc::new(InMemoryStore::new()),
            settings.vault()?,
            proxy,
            settings.webhook_secret()?,
            settings.context.default_budget_chars,
        ))
    }
}
