// Metis backend: model roster
//
// The ordered list of model candidates the gateway falls back through.
// The order is fixed at startup; nothing at runtime reorders it.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::state::AppState;

// ── Candidate ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ModelCandidate {
    /// Backend identifier as understood by the provider, e.g. `qwen/qwen3-30b-a3b:free`.
    pub id: String,
    pub name: String,
    pub provider: String,
    pub free: bool,
}

impl ModelCandidate {
    pub fn new(id: &str, name: &str, provider: &str, free: bool) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            provider: provider.to_string(),
            free,
        }
    }

    /// Candidate for an id that isn't in the built-in table.
    pub fn from_id(id: &str) -> Self {
        let provider = id
            .split_once('/')
            .map(|(org, _)| org.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        Self {
            id: id.to_string(),
            name: display_name(id),
            provider,
            free: id.ends_with(":free"),
        }
    }
}

/// Built-in free-tier candidates, in fallback order. Every entry must support
/// tool calling, otherwise `queryDatabase` can never be invoked.
fn builtin_candidates() -> Vec<ModelCandidate> {
    vec![
        ModelCandidate::new("google/gemini-2.0-flash-exp:free", "Gemini 2.0 Flash", "Google", true),
        ModelCandidate::new(
            "nvidia/llama-3.1-nemotron-70b-instruct:free",
            "Nemotron 70B",
            "NVIDIA",
            true,
        ),
        ModelCandidate::new("qwen/qwen3-30b-a3b:free", "Qwen3 30B", "Alibaba", true),
        ModelCandidate::new("meta-llama/llama-3.1-8b-instruct:free", "Llama 3.1 8B", "Meta", true),
    ]
}

/// Display name for a model id. Known ids use the table; others fall back to
/// the last path segment without the `:variant` suffix.
pub fn display_name(model_id: &str) -> String {
    if let Some(found) = builtin_candidates().into_iter().find(|m| m.id == model_id) {
        return found.name;
    }
    let last = model_id.rsplit('/').next().unwrap_or(model_id);
    last.split(':').next().unwrap_or(last).to_string()
}

// ── Roster ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
#[error("model roster must contain at least one candidate")]
pub struct EmptyRoster;

/// Immutable, ordered, non-empty list of candidates. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ModelRoster {
    candidates: Arc<[ModelCandidate]>,
}

impl Default for ModelRoster {
    fn default() -> Self {
        Self {
            candidates: builtin_candidates().into(),
        }
    }
}

impl ModelRoster {
    pub fn new(candidates: Vec<ModelCandidate>) -> Result<Self, EmptyRoster> {
        if candidates.is_empty() {
            return Err(EmptyRoster);
        }
        Ok(Self {
            candidates: candidates.into(),
        })
    }

    /// Build from a list of ids, reusing built-in metadata where available.
    pub fn from_ids<'a, I>(ids: I) -> Result<Self, EmptyRoster>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let builtin = builtin_candidates();
        let candidates = ids
            .into_iter()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(|id| {
                builtin
                    .iter()
                    .find(|m| m.id == id)
                    .cloned()
                    .unwrap_or_else(|| ModelCandidate::from_id(id))
            })
            .collect();
        Self::new(candidates)
    }

    pub fn primary(&self) -> &ModelCandidate {
        &self.candidates[0]
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModelCandidate> {
        self.candidates.iter()
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

// ── HTTP ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, ToSchema)]
pub struct ModelListResponse {
    pub primary: ModelCandidate,
    pub models: Vec<ModelCandidate>,
}

/// GET /api/metis/models: the configured fallback order.
#[utoipa::path(get, path = "/api/metis/models", tag = "models",
    responses((status = 200, description = "Configured model candidates in fallback order", body = ModelListResponse))
)]
pub async fn list_models(State(state): State<AppState>) -> Json<ModelListResponse> {
    let roster = &state.config.roster;
    Json(ModelListResponse {
        primary: roster.primary().clone(),
        models: roster.iter().cloned().collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_roster_order() {
        let roster = ModelRoster::default();
        let ids: Vec<&str> = roster.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "google/gemini-2.0-flash-exp:free",
                "nvidia/llama-3.1-nemotron-70b-instruct:free",
                "qwen/qwen3-30b-a3b:free",
                "meta-llama/llama-3.1-8b-instruct:free",
            ]
        );
        assert_eq!(roster.primary().name, "Gemini 2.0 Flash");
        assert!(roster.iter().all(|m| m.free));
    }

    #[test]
    fn display_name_known_and_unknown() {
        assert_eq!(display_name("qwen/qwen3-30b-a3b:free"), "Qwen3 30B");
        assert_eq!(display_name("moonshotai/kimi-k2.5"), "kimi-k2.5");
        assert_eq!(display_name("org/some-model:beta"), "some-model");
        assert_eq!(display_name("bare"), "bare");
    }

    #[test]
    fn from_ids_keeps_order_and_metadata() {
        let roster =
            ModelRoster::from_ids(["acme/zeta:free", " qwen/qwen3-30b-a3b:free ", ""]).unwrap();
        assert_eq!(roster.len(), 2);
        let first = roster.primary();
        assert_eq!(first.id, "acme/zeta:free");
        assert_eq!(first.provider, "acme");
        assert!(first.free);
        let second = roster.iter().nth(1).unwrap();
        assert_eq!(second.provider, "Alibaba");
    }

    #[test]
    fn empty_roster_is_rejected() {
        assert!(ModelRoster::from_ids([" ", ""]).is_err());
        assert!(ModelRoster::new(Vec::new()).is_err());
    }
}
