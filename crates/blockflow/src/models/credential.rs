use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::providers::factory::ProviderKind;

/// A provider API key at rest. `blob` is the vault's encrypted text, never plaintext.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderCredential {
    pub id: Uuid,
    pub owner: String,
    pub provider: ProviderKind,
    pub blob: String,
    pub created: i64,
}

impl ProviderCredential {
    pub fn new<O: Into<String>>(owner: O, provider: ProviderKind, blob: String) -> Self {
        ProviderCredential {
            id: Uuid::new_v4(),
            owner: owner.into(),
            provider,
            blob,
            created: Utc::now().timestamp(),
        }
    }
}
