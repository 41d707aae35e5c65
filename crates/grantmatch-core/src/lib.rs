//! Core domain model for GrantMatch: source records, consolidated opportunities,
//! and the persisted grant/embedding shapes.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "grantmatch-core";

/// Value stored in `grants.source` for everything ingested by the ETL pipeline.
pub const GRANTS_GOV_SOURCE: &str = "Grants.gov";

/// Fallback used for agency and eligibility text when the source omits them.
pub const NOT_SPECIFIED: &str = "Not specified";

/// Vector width of `text-embedding-3-small`; matches the `vector(1536)` column.
pub const EMBEDDING_DIMENSIONS: usize = 1536;

/// Search-result record as returned by the source's paginated search endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct RawOpportunity {
    pub id: String,
    pub number: String,
    pub title: String,
    pub agency_code: String,
    pub agency: String,
    pub open_date: String,
    pub close_date: String,
    pub opp_status: String,
    pub cfda_list: Vec<String>,
}

/// Authoritative per-opportunity detail. `synopsis` is the description section;
/// the source omits it for some records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct OpportunityDetail {
    pub id: String,
    pub title: Option<String>,
    pub agency_code: Option<String>,
    pub synopsis: Option<Synopsis>,
    pub classifications: Vec<Classification>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Synopsis {
    pub description: Option<String>,
    pub agency_name: Option<String>,
    pub eligibility: Option<String>,
    pub award_ceiling: Option<String>,
    pub award_floor: Option<String>,
    pub link_url: Option<String>,
}

/// Program classification (CFDA number + program title). Either half may be missing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Classification {
    pub code: Option<String>,
    pub title: Option<String>,
}

/// A search record joined with at most one detail record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsolidatedOpportunity {
    pub raw: RawOpportunity,
    pub detail: Option<OpportunityDetail>,
}

impl ConsolidatedOpportunity {
    pub fn new(raw: RawOpportunity, detail: Option<OpportunityDetail>) -> Self {
        Self { raw, detail }
    }

    pub fn synopsis(&self) -> Option<&Synopsis> {
        self.detail.as_ref().and_then(|d| d.synopsis.as_ref())
    }

    pub fn description(&self) -> Option<&str> {
        self.synopsis().and_then(|s| s.description.as_deref())
    }

    /// Classification codes from the detail record. Empty when there is no detail.
    pub fn detail_classification_codes(&self) -> impl Iterator<Item = &str> {
        self.detail
            .iter()
            .flat_map(|d| d.classifications.iter())
            .filter_map(|c| c.code.as_deref())
    }
}

/// Canonical grant shape written to the `grants` table. Upsert identity is
/// `(title, source)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrantRecord {
    pub title: String,
    pub description: String,
    pub deadline: Option<NaiveDate>,
    pub funding_amount: Option<f64>,
    pub source: String,
    pub agency: String,
    pub source_url: Option<String>,
    pub focus_areas: Vec<String>,
    pub focus_area_titles: Vec<String>,
    pub posted_date: Option<NaiveDate>,
    pub eligibility_description: String,
    pub created_at: DateTime<Utc>,
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingType {
    FullText,
    Title,
    Description,
}

impl EmbeddingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbeddingType::FullText => "full_text",
            EmbeddingType::Title => "title",
            EmbeddingType::Description => "description",
        }
    }
}

impl std::fmt::Display for EmbeddingType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Embedding vector owned by a grant; unique per (grant, type, model version).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub embedding_type: EmbeddingType,
    pub vector: Vec<f32>,
    pub model_version: String,
    pub created_at: DateTime<Utc>,
}

/// Loader unit of work: one grant plus the embeddings generated for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreparedGrant {
    pub grant: GrantRecord,
    pub embeddings: Vec<EmbeddingRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LoadReport {
    pub inserted: usize,
    pub updated: usize,
    pub embeddings_written: usize,
}

impl LoadReport {
    pub fn grants_written(&self) -> usize {
        self.inserted + self.updated
    }
}

/// Persisted grant row as served by the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredGrant {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub deadline: Option<NaiveDate>,
    pub funding_amount: Option<f64>,
    pub source: String,
    pub agency: Option<String>,
    pub source_url: Option<String>,
    pub focus_areas: Vec<String>,
    pub focus_area_titles: Vec<String>,
    pub posted_date: Option<NaiveDate>,
    pub eligibility_description: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_grants: i64,
    pub total_embeddings: i64,
    pub grants_last_24h: i64,
}

/// Parses currency-formatted award amounts such as `"$1,000,000"`.
///
/// `"none"` and anything that is not a finite number after stripping `$` and `,`
/// yield `None`, never zero.
pub fn parse_currency_amount(input: &str) -> Option<f64> {
    let trimmed = input.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("none") {
        return None;
    }
    let cleaned: String = trimmed.chars().filter(|c| *c != '$' && *c != ',').collect();
    cleaned
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|amount| amount.is_finite())
}

/// Parses source dates. The search endpoint uses `MM/DD/YYYY`; ISO dates are also accepted.
pub fn parse_source_date(input: &str) -> Option<NaiveDate> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    NaiveDate::parse_from_str(trimmed, "%m/%d/%Y")
        .or_else(|_| NaiveDate::parse_from_str(trimmed, "%Y-%m-%d"))
        .ok()
        .or_else(|| {
            DateTime::parse_from_rfc3339(trimmed)
                .ok()
                .map(|dt| dt.with_timezone(&Utc).date_naive())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn currency_parsing_strips_symbols() {
        assert_eq!(parse_currency_amount("$1,000,000"), Some(1_000_000.0));
        assert_eq!(parse_currency_amount("250000"), Some(250_000.0));
        assert_eq!(parse_currency_amount(" $12,500.50 "), Some(12_500.5));
    }

    #[test]
    fn currency_parsing_treats_none_and_garbage_as_absent() {
        assert_eq!(parse_currency_amount("none"), None);
        assert_eq!(parse_currency_amount("None"), None);
        assert_eq!(parse_currency_amount("TBD"), None);
        assert_eq!(parse_currency_amount(""), None);
        assert_eq!(parse_currency_amount("$"), None);
    }

    #[test]
    fn source_dates_accept_us_and_iso_formats() {
        let expected = NaiveDate::from_ymd_opt(2025, 3, 14);
        assert_eq!(parse_source_date("03/14/2025"), expected);
        assert_eq!(parse_source_date("2025-03-14"), expected);
        assert_eq!(parse_source_date("2025-03-14T10:00:00Z"), expected);
        assert_eq!(parse_source_date("soon"), None);
        assert_eq!(parse_source_date(""), None);
    }

    #[test]
    fn raw_opportunity_reads_camel_case_and_tolerates_missing_fields() {
        let raw: RawOpportunity = serde_json::from_str(
            r#"{"id":"355000","title":"AI Research Initiative","agencyCode":"NSF","cfdaList":["47.041"]}"#,
        )
        .unwrap();
        assert_eq!(raw.agency_code, "NSF");
        assert_eq!(raw.cfda_list, vec!["47.041".to_string()]);
        assert!(raw.close_date.is_empty());
    }

    #[test]
    fn missing_detail_has_no_classification_codes() {
        let opp = ConsolidatedOpportunity::new(RawOpportunity::default(), None);
        assert_eq!(opp.detail_classification_codes().count(), 0);
        assert!(opp.description().is_none());
    }

    #[test]
    fn embedding_type_serializes_as_column_value() {
        assert_eq!(
            serde_json::to_string(&EmbeddingType::FullText).unwrap(),
            "\"full_text\""
        );
        assert_eq!(EmbeddingType::Title.as_str(), "title");
    }
}
