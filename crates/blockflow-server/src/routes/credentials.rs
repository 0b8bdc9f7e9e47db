use axum::extract::State;
use axum::routing::put;
use axum::{Json, Router};
use blockflow::errors::ChatError;
use blockflow::models::credential::ProviderCredential;
use blockflow::providers::factory::ProviderKind;
use blockflow::store::GraphStore;
use blockflow::vault::Secret;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Deserialize)]
struct PutCredentialRequest {
    /// Replaces the stored key when set
    id: Option<Uuid>,
    owner: String,
    provider: String,
    api_key: Secret,
}

/// What the API reports about a stored credential. Never the key or its ciphertext.
#[derive(Debug, Serialize)]
struct CredentialSummary {
    id: Uuid,
    owner: String,
    provider: ProviderKind,
    created: i64,
}

async fn put_credential(
    State(state): State<AppState>,
    Json(request): Json<PutCredentialRequest>,
) -> Result<Json<CredentialSummary>, ApiError> {
    let provider = request
        .provider
        .parse::<ProviderKind>()
        .map_err(|_| ChatError::unsupported_provider(&request.provider))?;
    if request.api_key.is_empty() {
        return Err(ApiError::BadRequest("api_key must not be empty".to_string()));
    }

    let blob = state.vault.encrypt(request.api_key.expose())?;
    let mut credential = ProviderCredential::new(request.owner, provider, blob);
    if let Some(id) = request.id {
        credential.id = id;
    }
    let summary = CredentialSummary {
        id: credential.id,
        owner: credential.owner.clone(),
        provider,
        created: credential.created,
    };
    state.store.upsert_credential(credential).await?;
    tracing::info!(credential_id = %summary.id, provider = %provider, "credential stored");
    Ok(Json(summary))
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/credentials", put(put_credential))
        .with_state(state)
}
