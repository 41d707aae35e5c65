//! Grants.gov source client, detail batching, and the source-to-domain mapper.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use grantmatch_core::{
    parse_currency_amount, parse_source_date, Classification, ConsolidatedOpportunity,
    GrantRecord, OpportunityDetail, RawOpportunity, Synopsis, GRANTS_GOV_SOURCE, NOT_SPECIFIED,
};
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "grantmatch-adapters";

pub const GRANTS_GOV_API_BASE: &str = "https://api.grants.gov/v1/api";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            base_url: GRANTS_GOV_API_BASE.to_string(),
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("source error code {code}: {message}")]
    Api { code: i64, message: String },
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

impl SourceError {
    /// True when the source answered but reported a failure, as opposed to a
    /// transport-level problem.
    pub fn is_source_reported(&self) -> bool {
        matches!(self, SourceError::Api { .. })
    }
}

/// Paginated search + per-id detail lookups against an external grants source.
#[async_trait]
pub trait GrantSource: Send + Sync {
    fn source_name(&self) -> &'static str;

    /// One page of posted opportunities starting at `start_record`.
    async fn search_posted(
        &self,
        start_record: usize,
        rows: usize,
    ) -> Result<Vec<RawOpportunity>, SourceError>;

    async fn fetch_detail(&self, opportunity_id: &str) -> Result<OpportunityDetail, SourceError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchRequest<'a> {
    opp_statuses: &'a str,
    rows: usize,
    start_record_num: usize,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    errorcode: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Option<SearchData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchData {
    #[serde(default)]
    hit_count: u64,
    #[serde(default)]
    opp_hits: Vec<RawOpportunity>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DetailRequest<'a> {
    opportunity_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct DetailResponse {
    #[serde(default)]
    errorcode: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Option<DetailData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DetailData {
    #[serde(default, deserialize_with = "stringish")]
    id: Option<String>,
    #[serde(default)]
    opportunity_title: Option<String>,
    #[serde(default)]
    owning_agency_code: Option<String>,
    #[serde(default)]
    synopsis: Option<WireSynopsis>,
    #[serde(default)]
    cfdas: Option<Vec<WireCfda>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireSynopsis {
    #[serde(default)]
    synopsis_desc: Option<String>,
    #[serde(default)]
    agency_name: Option<String>,
    #[serde(default)]
    applicant_eligibility_desc: Option<String>,
    #[serde(default, deserialize_with = "stringish")]
    award_ceiling: Option<String>,
    #[serde(default, deserialize_with = "stringish")]
    award_floor: Option<String>,
    #[serde(default)]
    funding_desc_link_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireCfda {
    #[serde(default)]
    cfda_number: Option<String>,
    #[serde(default)]
    program_title: Option<String>,
}

// The source mixes numbers and strings for ids and award amounts.
fn stringish<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Option::<JsonValue>::deserialize(deserializer)? {
        Some(JsonValue::String(s)) => Some(s),
        Some(JsonValue::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

impl DetailData {
    fn into_detail(self, requested_id: &str) -> OpportunityDetail {
        OpportunityDetail {
            id: self
                .id
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| requested_id.to_string()),
            title: self.opportunity_title,
            agency_code: self.owning_agency_code,
            synopsis: self.synopsis.map(|s| Synopsis {
                description: s.synopsis_desc,
                agency_name: s.agency_name,
                eligibility: s.applicant_eligibility_desc,
                award_ceiling: s.award_ceiling,
                award_floor: s.award_floor,
                link_url: s.funding_desc_link_url,
            }),
            classifications: self
                .cfdas
                .unwrap_or_default()
                .into_iter()
                .map(|c| Classification {
                    code: c.cfda_number,
                    title: c.program_title,
                })
                .collect(),
        }
    }
}

/// reqwest-backed client for the Grants.gov `search2` and `fetchOpportunity` endpoints.
#[derive(Debug, Clone)]
pub struct GrantsGovClient {
    client: reqwest::Client,
    base_url: String,
}

impl GrantsGovClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post_json<B, T>(&self, endpoint: &str, body: &B) -> Result<T, SourceError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}/{}", self.base_url, endpoint);
        let resp = self.client.post(&url).json(body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(SourceError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }
        Ok(resp.json::<T>().await?)
    }
}

#[async_trait]
impl GrantSource for GrantsGovClient {
    fn source_name(&self) -> &'static str {
        GRANTS_GOV_SOURCE
    }

    async fn search_posted(
        &self,
        start_record: usize,
        rows: usize,
    ) -> Result<Vec<RawOpportunity>, SourceError> {
        let request = SearchRequest {
            opp_statuses: "posted",
            rows,
            start_record_num: start_record,
        };
        let response: SearchResponse = self.post_json("search2", &request).await?;
        if response.errorcode != 0 {
            return Err(SourceError::Api {
                code: response.errorcode,
                message: response.msg,
            });
        }
        let data = response.data.map(|d| {
            debug!(hit_count = d.hit_count, returned = d.opp_hits.len(), "search page");
            d.opp_hits
        });
        Ok(data.unwrap_or_default())
    }

    async fn fetch_detail(&self, opportunity_id: &str) -> Result<OpportunityDetail, SourceError> {
        let response: DetailResponse = self
            .post_json(
                "fetchOpportunity",
                &DetailRequest {
                    opportunity_id,
                },
            )
            .await?;
        if response.errorcode != 0 {
            return Err(SourceError::Api {
                code: response.errorcode,
                message: response.msg,
            });
        }
        let Some(data) = response.data else {
            return Err(SourceError::Api {
                code: response.errorcode,
                message: format!("no detail data for opportunity {opportunity_id}"),
            });
        };
        Ok(data.into_detail(opportunity_id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaginationStop {
    /// A page came back empty.
    Exhausted,
    /// The source answered with a non-zero error code.
    SourceError(String),
    /// Network or timeout failure.
    Transport(String),
}

#[derive(Debug, Clone)]
pub struct PaginationOutcome {
    pub opportunities: Vec<RawOpportunity>,
    pub pages_fetched: usize,
    pub duplicates_skipped: usize,
    pub stop: PaginationStop,
}

impl PaginationOutcome {
    pub fn is_partial(&self) -> bool {
        self.stop != PaginationStop::Exhausted
    }
}

/// Pages through every posted opportunity, deduplicating by external id.
///
/// Errors end pagination early and keep whatever was accumulated.
pub async fn fetch_all_posted(source: &dyn GrantSource, page_size: usize) -> PaginationOutcome {
    let page_size = page_size.max(1);
    let span = info_span!("fetch_all_posted", source = source.source_name(), page_size);

    async move {
        let mut opportunities = Vec::new();
        let mut seen = HashSet::new();
        let mut duplicates_skipped = 0usize;
        let mut pages_fetched = 0usize;
        let mut start_record = 0usize;

        let stop = loop {
            match source.search_posted(start_record, page_size).await {
                Ok(page) if page.is_empty() => {
                    info!(pages_fetched, "no more opportunities; pagination finished");
                    break PaginationStop::Exhausted;
                }
                Ok(page) => {
                    pages_fetched += 1;
                    info!(returned = page.len(), start_record, "fetched search page");
                    for opp in page {
                        if seen.insert(opp.id.clone()) {
                            opportunities.push(opp);
                        } else {
                            duplicates_skipped += 1;
                        }
                    }
                    start_record += page_size;
                }
                Err(err) if err.is_source_reported() => {
                    warn!(error = %err, start_record, "source reported an error; stopping pagination");
                    break PaginationStop::SourceError(err.to_string());
                }
                Err(err) => {
                    warn!(error = %err, start_record, "search request failed; stopping pagination");
                    break PaginationStop::Transport(err.to_string());
                }
            }
        };

        info!(
            unique = opportunities.len(),
            duplicates_skipped, "pagination complete"
        );
        PaginationOutcome {
            opportunities,
            pages_fetched,
            duplicates_skipped,
            stop,
        }
    }
    .instrument(span)
    .await
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetailFailure {
    pub opportunity_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct DetailBatchOutcome {
    pub details: Vec<OpportunityDetail>,
    pub failures: Vec<DetailFailure>,
}

impl DetailBatchOutcome {
    pub fn attempted(&self) -> usize {
        self.details.len() + self.failures.len()
    }
}

/// Fetches detail records in small staggered batches to stay under the source's rate limit.
#[derive(Debug, Clone, Copy)]
pub struct DetailBatcher {
    pub batch_size: usize,
    pub stagger: Duration,
    pub batch_pause: Duration,
    pub item_timeout: Duration,
}

impl Default for DetailBatcher {
    fn default() -> Self {
        Self {
            batch_size: 5,
            stagger: Duration::from_millis(100),
            batch_pause: Duration::from_millis(500),
            item_timeout: Duration::from_secs(30),
        }
    }
}

impl DetailBatcher {
    /// Always completes. Individual failures are logged and reported in the outcome.
    pub async fn fetch_details(
        &self,
        source: &dyn GrantSource,
        opportunities: &[RawOpportunity],
    ) -> DetailBatchOutcome {
        let batch_size = self.batch_size.max(1);
        let total_batches = opportunities.len().div_ceil(batch_size);
        let mut outcome = DetailBatchOutcome::default();

        info!(count = opportunities.len(), total_batches, "fetching opportunity details");

        for (batch_index, batch) in opportunities.chunks(batch_size).enumerate() {
            let requests = batch
                .iter()
                .enumerate()
                .map(|(slot, opp)| self.fetch_one(source, &opp.id, slot));
            let results = join_all(requests).await;

            let mut succeeded = 0usize;
            for (opp, result) in batch.iter().zip(results) {
                match result {
                    Ok(detail) => {
                        succeeded += 1;
                        outcome.details.push(detail);
                    }
                    Err(err) => {
                        warn!(opportunity_id = %opp.id, error = %err, "detail fetch failed; skipping");
                        outcome.failures.push(DetailFailure {
                            opportunity_id: opp.id.clone(),
                            reason: err.to_string(),
                        });
                    }
                }
            }
            info!(
                batch = batch_index + 1,
                total_batches,
                succeeded,
                attempted = batch.len(),
                "detail batch complete"
            );

            if batch_index + 1 < total_batches && !self.batch_pause.is_zero() {
                tokio::time::sleep(self.batch_pause).await;
            }
        }

        info!(
            fetched = outcome.details.len(),
            failed = outcome.failures.len(),
            "detail fetch finished"
        );
        outcome
    }

    async fn fetch_one(
        &self,
        source: &dyn GrantSource,
        opportunity_id: &str,
        slot: usize,
    ) -> Result<OpportunityDetail, SourceError> {
        let delay = self.stagger.saturating_mul(slot as u32);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match tokio::time::timeout(self.item_timeout, source.fetch_detail(opportunity_id)).await {
            Ok(result) => result,
            Err(_) => Err(SourceError::Timeout(self.item_timeout)),
        }
    }
}

/// Joins search records with their details by external id. Each raw record gets
/// at most one detail; the first detail seen for an id wins.
pub fn consolidate(
    raws: Vec<RawOpportunity>,
    details: Vec<OpportunityDetail>,
) -> Vec<ConsolidatedOpportunity> {
    let mut by_id: HashMap<String, OpportunityDetail> = HashMap::with_capacity(details.len());
    for detail in details {
        by_id.entry(detail.id.trim().to_string()).or_insert(detail);
    }
    raws.into_iter()
        .map(|raw| {
            let detail = by_id.remove(raw.id.trim());
            ConsolidatedOpportunity::new(raw, detail)
        })
        .collect()
}

fn text_or_none(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

/// Ceiling wins over floor. A present ceiling that fails to parse leaves the amount absent.
fn funding_amount(synopsis: &Synopsis) -> Option<f64> {
    let usable = |value: &Option<String>| {
        value
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("none"))
            .map(ToString::to_string)
    };
    if let Some(ceiling) = usable(&synopsis.award_ceiling) {
        return parse_currency_amount(&ceiling);
    }
    usable(&synopsis.award_floor).and_then(|floor| parse_currency_amount(&floor))
}

/// Maps a consolidated opportunity into the persisted grant shape.
///
/// Records without a detail synopsis still produce a minimal grant so a single
/// bad record never halts ingestion.
pub fn map_to_grant_record(opp: &ConsolidatedOpportunity, now: DateTime<Utc>) -> GrantRecord {
    let raw = &opp.raw;
    let posted_date = parse_source_date(&raw.open_date);

    let Some(synopsis) = opp.synopsis() else {
        warn!(opportunity_id = %raw.id, "missing detail synopsis; emitting minimal record");
        return GrantRecord {
            title: raw.title.clone(),
            description: String::new(),
            deadline: None,
            funding_amount: None,
            source: GRANTS_GOV_SOURCE.to_string(),
            agency: text_or_none(Some(&raw.agency)).unwrap_or_else(|| NOT_SPECIFIED.to_string()),
            source_url: None,
            focus_areas: raw.cfda_list.clone(),
            focus_area_titles: Vec::new(),
            posted_date,
            eligibility_description: NOT_SPECIFIED.to_string(),
            created_at: now,
            summary: None,
        };
    };

    let (focus_areas, focus_area_titles): (Vec<String>, Vec<String>) = opp
        .detail
        .iter()
        .flat_map(|d| d.classifications.iter())
        .filter_map(|c| match (text_or_none(c.code.as_deref()), text_or_none(c.title.as_deref())) {
            (Some(code), Some(title)) => Some((code, title)),
            _ => None,
        })
        .unzip();

    GrantRecord {
        title: raw.title.clone(),
        description: synopsis.description.clone().unwrap_or_default(),
        deadline: parse_source_date(&raw.close_date),
        funding_amount: funding_amount(synopsis),
        source: GRANTS_GOV_SOURCE.to_string(),
        agency: text_or_none(synopsis.agency_name.as_deref())
            .unwrap_or_else(|| NOT_SPECIFIED.to_string()),
        source_url: text_or_none(synopsis.link_url.as_deref()),
        focus_areas,
        focus_area_titles,
        posted_date,
        eligibility_description: text_or_none(synopsis.eligibility.as_deref())
            .unwrap_or_else(|| NOT_SPECIFIED.to_string()),
        created_at: now,
        summary: None,
    }
}
