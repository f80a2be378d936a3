//! System prompt composition for the Metis assistant.
//!
//! The prompt is an ordered list of named sections. Most sections are static
//! domain knowledge; three depend on the caller's dashboard snapshot:
//! `dashboard_state` (only present when a snapshot is supplied),
//! `view_guidance` and `result_size`. Composition is pure and cheap, so it
//! runs once per chat request.

use serde_json::Value;

use crate::models::{DashboardContext, DashboardView};

// ---------------------------------------------------------------------------
// Static knowledge
// ---------------------------------------------------------------------------

const IDENTITY: &str = "\
You are Metis, the AI data analyst embedded in the Zuma Indonesia Accurate Sales Dashboard.
You help Zuma employees analyse sales and stock data coming from the Accurate ERP.

## Personality
- Friendly but professional, like a data analyst colleague.
- Be proactive: do not just answer, point out anomalies, trends and recommendations.
- Use emoji sparingly for emphasis (✅ ⚠️ 📊 📈 📉 🔥).
- Reply in Bahasa Indonesia; keep column and metric names in English.";

const WORKFLOW: &str = "\
## How you work
1. When the user asks about data, write one SQL query and run it with the `queryDatabase` tool.
2. If the tool returns `success: false`, read the error, fix the SQL and try again. You have a small budget of turns, so fix the query instead of repeating it.
3. Once you have results, give actionable INSIGHT, not just numbers.
4. If the answer is already in the dashboard state below, answer directly without querying.";

const SCHEMA: &str = "\
## Database schema

### core.sales_with_product (sales, use this for every sales question)
Main sales view, one row per sales line, ~1.5M rows.
- transaction_date (date)
- source_entity (text): 'DDD' (retail/wholesale), 'MBB' (online), 'UBB' (wholesale)
- nomor_invoice (text): invoice number
- kode_mix (text): version-agnostic article code, use for comparisons across time
- article (text): article name, e.g. 'JET BLACK', 'ARUBA WHITE'
- series (text): Classic, Slide, Airmove, Stripe, ...
- gender (text): Men, Ladies, Baby, Boys, Girls, Junior
- tipe (text): Fashion or Jepit
- tier (text): '1' (fast), '2', '3', '4', '5', '8' (new launch)
- color (text), size (text)
- quantity (numeric): pairs sold
- unit_price (numeric), total_amount (numeric): revenue = quantity × unit_price
- harga_beli (numeric): cost of goods, rsp (numeric): recommended selling price
- branch (text): Jatim, Jakarta, Bali, Sumatra, Sulawesi, Batam
- area (text): Jatim, Jakarta, Bali 1, Bali 2, Bali 3, Lombok, ...
- store_category (text): RETAIL, NON-RETAIL, EVENT
- matched_store_name (text): normalized lowercase store name
- is_intercompany (boolean): TRUE = transfer between own entities, never real sales
- nama_pelanggan (text): customer name

### core.stock_with_product (stock)
Current stock snapshot, ~142K rows. There is no time dimension: it is always the latest snapshot.
- nama_gudang (text): warehouse/store name
- quantity (numeric): pairs in stock
- kode_mix, article, series, gender, tipe, tier, color, size: same meaning as in sales
- gudang_branch (text): NOT `branch`
- gudang_area (text): NOT `area`
- gudang_category (text): NOT `store_category`

### ⚠️ Column names differ between the two views
| Sales | Stock |
|-------|-------|
| branch | gudang_branch |
| area | gudang_area |
| store_category | gudang_category |
| matched_store_name | nama_gudang |
| has transaction_date | no date column (always latest) |
Using a sales column name on the stock view (or the reverse) is the most common query error. Check which view you are querying before naming a location column.";

const MANDATORY_RULES: &str = "\
## MANDATORY query rules (never break these)

### Rule 1: always exclude intercompany rows on sales
```sql
WHERE is_intercompany = FALSE
```

### Rule 2: exclude non-product items
Required whenever the dashboard's `excludeNonSku` toggle is on, and for any product, article or size analysis:
```sql
AND UPPER(article) NOT LIKE '%SHOPPING BAG%'
AND UPPER(article) NOT LIKE '%HANGER%'
AND UPPER(article) NOT LIKE '%PAPER BAG%'
AND UPPER(article) NOT LIKE '%THERMAL%'
AND UPPER(article) NOT LIKE '%BOX LUCA%'
```

### Rule 3: default period is the last 3 months
When the user names no period and the dashboard gives no date range:
```sql
AND transaction_date >= CURRENT_DATE - INTERVAL '3 months'
```

### Rule 4: compare across time with kode_mix
Never use kode_besar for period comparisons: product versions change kode_besar but keep kode_mix.

### Rule 5: column aliases
- SUM(quantity) AS total_pairs
- SUM(total_amount) AS total_revenue
- COUNT(DISTINCT nomor_invoice) AS num_transactions
- COUNT(DISTINCT kode_mix) AS num_articles
- ROUND(SUM(total_amount) / NULLIF(SUM(quantity), 0), 0) AS avg_price_per_pair
- Every output column needs a unique name: alias expressions and same-named columns from different tables (s.branch AS sales_branch, t.branch AS stock_branch).

### Rule 6: stock has no date filter
Never add a date condition to stock queries.

### Rule 7: aggregate first, limit detail rows
Both views are large. Aggregate with GROUP BY before returning detail rows, and always put a LIMIT on non-aggregated queries. The tool never returns more than 200 rows; extra rows are dropped and `truncated` is set.

### Rule 8: one read-only statement
Only a single SELECT (or WITH ... SELECT) statement is accepted. Anything else is rejected.";

const RESPONSE_FORMAT: &str = "\
## Response format
- Start with the short answer or key insight.
- Explain patterns or anomalies you found.
- Suggest a follow-up analysis when relevant.
- NEVER show the SQL to the user; give the results directly.";

const NUMBER_FORMAT: &str = "\
## Number formatting
- Revenue in Rupiah: Rp 1.2B, Rp 450M, Rp 89.5K
- Pairs: 12,340 pairs
- Percentages: 23.5%
- Always use thousands separators.";

const BUSINESS_CONTEXT: &str = "\
## Business context
- Zuma is an Indonesian sandal brand.
- DDD is the main entity (retail + wholesale), MBB is the online marketplace entity, UBB is wholesale.
- Bali and Lombok are tourism areas with the highest revenue per store.
- Tier 1 = fast moving, Tier 8 = new launch.
- Gender groups: Men, Ladies, Baby & Kids (Baby, Boys, Girls and Junior combined).";

// ---------------------------------------------------------------------------
// Composer
// ---------------------------------------------------------------------------

/// Static text blocks the composer stitches together.
#[derive(Debug, Clone)]
pub struct PromptKnowledge {
    pub identity: &'static str,
    pub workflow: &'static str,
    pub schema: &'static str,
    pub mandatory_rules: &'static str,
    pub response_format: &'static str,
    pub number_format: &'static str,
    pub business_context: &'static str,
}

impl Default for PromptKnowledge {
    fn default() -> Self {
        Self {
            identity: IDENTITY,
            workflow: WORKFLOW,
            schema: SCHEMA,
            mandatory_rules: MANDATORY_RULES,
            response_format: RESPONSE_FORMAT,
            number_format: NUMBER_FORMAT,
            business_context: BUSINESS_CONTEXT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptSection {
    pub name: &'static str,
    pub body: String,
}

impl PromptSection {
    fn new(name: &'static str, body: impl Into<String>) -> Self {
        Self { name, body: body.into() }
    }
}

#[derive(Debug, Clone)]
pub struct PromptComposer {
    knowledge: PromptKnowledge,
    row_cap: usize,
}

impl Default for PromptComposer {
    fn default() -> Self {
        Self::new(PromptKnowledge::default(), 200)
    }
}

impl PromptComposer {
    pub fn new(knowledge: PromptKnowledge, row_cap: usize) -> Self {
        Self { knowledge, row_cap }
    }

    /// Named sections in prompt order.
    pub fn sections(&self, ctx: Option<&DashboardContext>) -> Vec<PromptSection> {
        let k = &self.knowledge;
        let mut sections = vec![
            PromptSection::new("identity", k.identity),
            PromptSection::new("workflow", k.workflow),
        ];
        if let Some(ctx) = ctx {
            sections.push(PromptSection::new("dashboard_state", dashboard_state(ctx)));
        }
        let view = ctx.map_or(DashboardView::Summary, DashboardContext::view);
        sections.push(PromptSection::new("view_guidance", view_guidance(view)));
        let active = ctx.map_or(0, DashboardContext::active_filter_count);
        sections.push(PromptSection::new("result_size", result_size(active, self.row_cap)));
        sections.extend([
            PromptSection::new("schema", k.schema),
            PromptSection::new("mandatory_rules", k.mandatory_rules),
            PromptSection::new("response_format", k.response_format),
            PromptSection::new("number_format", k.number_format),
            PromptSection::new("business_context", k.business_context),
        ]);
        sections
    }

    pub fn compose(&self, ctx: Option<&DashboardContext>) -> String {
        self.sections(ctx)
            .into_iter()
            .map(|s| s.body)
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

// ---------------------------------------------------------------------------
// Dynamic sections
// ---------------------------------------------------------------------------

fn compact_json(value: Option<&Value>) -> String {
    value
        .and_then(|v| serde_json::to_string(v).ok())
        .unwrap_or_else(|| "{}".to_string())
}

fn dashboard_state(ctx: &DashboardContext) -> String {
    let filters = ctx
        .filters
        .as_ref()
        .and_then(|f| serde_json::to_string(f).ok())
        .unwrap_or_else(|| "{}".to_string());
    let toggle = if ctx.excludes_non_product() { "ON" } else { "OFF" };
    format!(
        "## Current dashboard state\n\
         The user is looking at the Accurate Sales Dashboard in this state:\n\
         - Active tab: {tab}\n\
         - Active filters: {filters}\n\
         - Non-product exclusion toggle (excludeNonSku): {toggle}\n\
         - Visible data (summary): {visible}\n\n\
         When the user says \"this data\", \"these\" or \"what I'm looking at\", use the state above as context.\n\
         If the answer is already in the visible data, answer directly without querying.\n\
         Query the database only when you need more detail or something different from what is visible, \
         and apply the active filters to your query unless the user asks otherwise.",
        tab = ctx.view().as_str(),
        visible = compact_json(ctx.visible_data.as_ref()),
    )
}

fn view_guidance(view: DashboardView) -> String {
    let (label, depth) = match view {
        DashboardView::Summary => (
            "Executive Summary",
            "Answer at aggregate level: totals, branch/area splits, period trends and top-N rankings. \
             Only go down to article level when the user explicitly asks.",
        ),
        DashboardView::Sku => (
            "SKU Chart",
            "Answer at article level (kode_mix / article): series, gender, tier and price-band mixes, \
             top and bottom articles.",
        ),
        DashboardView::Detail => (
            "Detail (Kode)",
            "Answer at article-code level: per kode_mix and article rows with pairs, revenue and price per pair. \
             Group by article before listing rows.",
        ),
        DashboardView::DetailSize => (
            "Detail Size (Kode Besar)",
            "Answer at size level: per article and size rows, size curves and size gaps. \
             Group by article and size before listing rows.",
        ),
    };
    format!("## View guidance\nThe active view is {label}. {depth}")
}

/// Advisory LIMIT for detail queries. More active filters mean a narrower
/// result set, so a larger LIMIT is safe. Never above the hard cap.
pub fn suggested_limit(active_filters: usize, row_cap: usize) -> usize {
    let suggested = match active_filters {
        0 => 50,
        1 | 2 => 100,
        _ => 200,
    };
    suggested.min(row_cap)
}

fn result_size(active_filters: usize, row_cap: usize) -> String {
    let limit = suggested_limit(active_filters, row_cap);
    format!(
        "## Result size\n\
         {active_filters} dashboard filter(s) are active. For non-aggregated queries use LIMIT {limit}. \
         The tool returns at most {row_cap} rows per query."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DashboardFilters;
    use serde_json::json;

    fn section<'a>(sections: &'a [PromptSection], name: &str) -> Option<&'a PromptSection> {
        sections.iter().find(|s| s.name == name)
    }

    fn build_system_prompt(ctx: Option<&DashboardContext>) -> String {
        PromptComposer::default().compose(ctx)
    }

    #[test]
    fn sku_tab_changes_only_view_guidance() {
        let composer = PromptComposer::default();
        let bare = composer.sections(None);
        let ctx = DashboardContext {
            active_tab: Some("sku".into()),
            ..Default::default()
        };
        let sku = composer.sections(Some(&ctx));

        assert_ne!(
            section(&bare, "view_guidance").unwrap().body,
            section(&sku, "view_guidance").unwrap().body
        );
        for name in [
            "identity",
            "workflow",
            "result_size",
            "schema",
            "mandatory_rules",
            "response_format",
            "number_format",
            "business_context",
        ] {
            assert_eq!(
                section(&bare, name).unwrap().body,
                section(&sku, name).unwrap().body,
                "section {name} should not depend on the tab"
            );
        }
        assert!(section(&bare, "dashboard_state").is_none());
        assert!(section(&sku, "dashboard_state").is_some());
    }

    #[test]
    fn absent_context_is_prompt_minus_state_section() {
        let composer = PromptComposer::default();
        let ctx = DashboardContext::default();
        let with_ctx: Vec<String> = composer
            .sections(Some(&ctx))
            .into_iter()
            .filter(|s| s.name != "dashboard_state")
            .map(|s| s.body)
            .collect();
        assert_eq!(with_ctx.join("\n\n"), composer.compose(None));
    }

    #[test]
    fn composition_is_deterministic() {
        let ctx = DashboardContext {
            visible_data: Some(json!({ "kpis": { "revenue": 1, "pairs": 2 } })),
            ..Default::default()
        };
        assert_eq!(build_system_prompt(Some(&ctx)), build_system_prompt(Some(&ctx)));
        assert_eq!(build_system_prompt(None), build_system_prompt(None));
    }

    #[test]
    fn visible_data_is_compact_json() {
        let ctx = DashboardContext {
            visible_data: Some(json!({ "kpis": { "revenue": 1500000, "pairs": 320 } })),
            ..Default::default()
        };
        let prompt = build_system_prompt(Some(&ctx));
        assert!(prompt.contains(r#"{"kpis":{"revenue":1500000,"pairs":320}}"#));
    }

    #[test]
    fn schema_mismatch_is_spelled_out() {
        let prompt = build_system_prompt(None);
        assert!(prompt.contains("| branch | gudang_branch |"));
        assert!(prompt.contains("| store_category | gudang_category |"));
        assert!(prompt.contains("is_intercompany = FALSE"));
        assert!(prompt.contains("INTERVAL '3 months'"));
    }

    #[test]
    fn limit_suggestion_scales_with_filters() {
        assert_eq!(suggested_limit(0, 200), 50);
        assert_eq!(suggested_limit(2, 200), 100);
        assert_eq!(suggested_limit(5, 200), 200);
        assert_eq!(suggested_limit(5, 120), 120);

        let narrow = DashboardContext {
            filters: Some(DashboardFilters {
                branch: vec!["Bali".into()],
                series: vec!["Classic".into()],
                gender: vec!["Men".into()],
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(build_system_prompt(Some(&narrow)).contains("use LIMIT 200"));
        assert!(build_system_prompt(None).contains("use LIMIT 50"));
    }

    #[test]
    fn toggle_state_is_reported() {
        let ctx = DashboardContext {
            filters: Some(DashboardFilters {
                exclude_non_sku: true,
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(build_system_prompt(Some(&ctx)).contains("(excludeNonSku): ON"));
    }
}
