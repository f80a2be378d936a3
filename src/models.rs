use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::model_registry::ModelCandidate;

// ---------------------------------------------------------------------------
// Chat messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    Tool,
}

/// One content part of a message. Tool invocations carry the call and,
/// once known, its result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePart {
    Text {
        text: String,
    },
    ToolInvocation {
        call_id: String,
        tool_name: String,
        #[schema(value_type = Object)]
        input: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        #[schema(value_type = Option<Object>)]
        output: Option<Value>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ChatMessage {
    pub id: String,
    pub role: MessageRole,
    pub parts: Vec<MessagePart>,
}

impl ChatMessage {
    pub fn text(id: &str, role: MessageRole, text: &str) -> Self {
        Self {
            id: id.to_string(),
            role,
            parts: vec![MessagePart::Text { text: text.to_string() }],
        }
    }

    /// Concatenated text parts.
    pub fn plain_text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                MessagePart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

// ---------------------------------------------------------------------------
// Dashboard context
// ---------------------------------------------------------------------------

/// Filter state of the dashboard at the time of the question.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct DashboardFilters {
    pub from: Option<String>,
    pub to: Option<String>,
    pub branch: Vec<String>,
    pub store: Vec<String>,
    pub entity: Vec<String>,
    pub customer: Vec<String>,
    pub gender: Vec<String>,
    pub series: Vec<String>,
    pub color: Vec<String>,
    pub tier: Vec<String>,
    pub tipe: Vec<String>,
    pub version: Vec<String>,
    pub q: String,
    pub exclude_non_sku: bool,
}

impl DashboardFilters {
    /// Number of independent narrowing filters in effect: non-empty
    /// categorical lists plus a non-empty search string. The date range and
    /// the non-product toggle don't count.
    pub fn active_count(&self) -> usize {
        let lists = [
            &self.branch,
            &self.store,
            &self.entity,
            &self.customer,
            &self.gender,
            &self.series,
            &self.color,
            &self.tier,
            &self.tipe,
            &self.version,
        ];
        let categorical = lists.iter().filter(|l| l.iter().any(|v| !v.trim().is_empty())).count();
        categorical + usize::from(!self.q.trim().is_empty())
    }
}

/// Dashboard view the user is looking at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DashboardView {
    Summary,
    Sku,
    Detail,
    DetailSize,
}

impl DashboardView {
    /// Unknown or missing tab ids fall back to the summary view.
    pub fn from_tab(tab: Option<&str>) -> Self {
        match tab.map(str::trim) {
            Some("sku") => Self::Sku,
            Some("detail") => Self::Detail,
            Some("detail-size") => Self::DetailSize,
            _ => Self::Summary,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Summary => "summary",
            Self::Sku => "sku",
            Self::Detail => "detail",
            Self::DetailSize => "detail-size",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DashboardContext {
    #[serde(default)]
    pub filters: Option<DashboardFilters>,
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub visible_data: Option<Value>,
    #[serde(default)]
    pub active_tab: Option<String>,
}

impl DashboardContext {
    pub fn view(&self) -> DashboardView {
        DashboardView::from_tab(self.active_tab.as_deref())
    }

    pub fn active_filter_count(&self) -> usize {
        self.filters.as_ref().map_or(0, DashboardFilters::active_count)
    }

    pub fn excludes_non_product(&self) -> bool {
        self.filters.as_ref().is_some_and(|f| f.exclude_non_sku)
    }
}

// ---------------------------------------------------------------------------
// Chat request
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub dashboard_context: Option<DashboardContext>,
    /// When set, the finished exchange is saved under this session id.
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub dashboard: Option<String>,
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub app: String,
    pub uptime_seconds: u64,
    pub llm_configured: bool,
    pub models: Vec<ModelCandidate>,
}
