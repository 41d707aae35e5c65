//! ETL orchestration: rules, filtering, relevancy scoring, embeddings, loading, and run reports.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use futures::stream::{self, StreamExt};
use grantmatch_adapters::{
    classify_reqwest_error, classify_status, consolidate, fetch_all_posted, map_to_grant_record,
    BackoffPolicy, DetailBatcher, GrantSource, GrantsGovClient, HttpClientConfig, RetryDisposition,
    GRANTS_GOV_API_BASE,
};
use grantmatch_core::{
    parse_currency_amount, parse_source_date, ConsolidatedOpportunity, EmbeddingRecord,
    EmbeddingType, GrantRecord, LoadReport, PreparedGrant, StoreStats, StoredGrant,
};
use grantmatch_storage::GrantStore;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "grantmatch-sync";

pub const DEFAULT_PAGE_SIZE: usize = 250;
pub const DEFAULT_TOP_N: usize = 100;
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";
pub const DEFAULT_SUMMARY_MODEL: &str = "gpt-4o-mini";
pub const OPENAI_API_BASE: &str = "https://api.openai.com/v1";

/// Inputs longer than this are cut before being sent to the embeddings endpoint.
pub const MAX_EMBEDDING_INPUT_CHARS: usize = 8000;

#[derive(Debug, Clone)]
pub struct EtlSettings {
    pub database_url: Option<String>,
    pub grants_gov_base_url: String,
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub embedding_model: String,
    pub summary_model: String,
    pub http_timeout_secs: u64,
    pub rules_path: PathBuf,
    pub reports_dir: Option<PathBuf>,
    pub scheduler_enabled: bool,
    pub etl_cron: String,
    pub web_port: u16,
    pub user_agent: String,
}

impl EtlSettings {
    pub fn from_env() -> Self {
        Self {
            database_url: non_empty_env("DATABASE_URL"),
            grants_gov_base_url: std::env::var("GRANTS_GOV_BASE_URL")
                .unwrap_or_else(|_| GRANTS_GOV_API_BASE.to_string()),
            openai_api_key: non_empty_env("OPENAI_API_KEY"),
            openai_base_url: std::env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| OPENAI_API_BASE.to_string()),
            embedding_model: std::env::var("EMBEDDING_MODEL")
                .unwrap_or_else(|_| DEFAULT_EMBEDDING_MODEL.to_string()),
            summary_model: std::env::var("SUMMARY_MODEL")
                .unwrap_or_else(|_| DEFAULT_SUMMARY_MODEL.to_string()),
            http_timeout_secs: std::env::var("GRANTMATCH_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            rules_path: std::env::var("GRANTMATCH_RULES_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./rules/etl.yaml")),
            reports_dir: match std::env::var("GRANTMATCH_REPORTS_DIR") {
                Ok(v) if v.trim().is_empty() => None,
                Ok(v) => Some(PathBuf::from(v)),
                Err(_) => Some(PathBuf::from("./reports")),
            },
            scheduler_enabled: std::env::var("GRANTMATCH_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            etl_cron: std::env::var("GRANTMATCH_ETL_CRON")
                .unwrap_or_else(|_| "0 0 6 * * *".to_string()),
            web_port: std::env::var("GRANTMATCH_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3001),
            user_agent: std::env::var("GRANTMATCH_USER_AGENT")
                .unwrap_or_else(|_| "grantmatch-etl/0.1".to_string()),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn source_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            base_url: self.grants_gov_base_url.clone(),
            timeout: self.http_timeout(),
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Allowlists and defaults for a run, normally loaded from `rules/etl.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EtlRules {
    pub page_size: usize,
    pub priority_agencies: Vec<String>,
    pub classification_codes: Vec<String>,
    pub high_value_keywords: Vec<String>,
}

impl Default for EtlRules {
    fn default() -> Self {
        let owned = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            priority_agencies: owned(&["NSF", "NIH", "DOE", "NASA", "NIST", "EPA", "DOD", "USDA"]),
            classification_codes: owned(&[
                "47.041", "47.049", "93.837", "93.213", "81.087", "15.931", "66.508", "43.001",
            ]),
            high_value_keywords: owned(&[
                "research",
                "innovation",
                "development",
                "technology",
                "engineering",
                "prototype",
                "design",
                "science",
                "STEM",
                "mathematics",
                "physics",
                "chemistry",
                "biology",
                "astronomy",
                "health",
                "public health",
                "medicine",
                "biomedical",
                "epidemiology",
                "mental health",
                "healthcare",
                "environment",
                "climate",
                "sustainability",
                "renewable energy",
                "conservation",
                "biodiversity",
                "education",
                "training",
                "workforce development",
                "teacher",
                "curriculum",
                "community",
                "nonprofit",
                "arts",
                "culture",
                "human rights",
                "justice",
                "equity",
                "artificial intelligence",
                "machine learning",
                "data science",
                "cybersecurity",
                "robotics",
            ]),
        }
    }
}

impl EtlRules {
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw).context("parsing etl rules yaml")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&raw).with_context(|| format!("loading rules from {}", path.display()))
    }

    /// Falls back to the built-in lists when the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "rules file not found; using built-in defaults");
            return Ok(Self::default());
        }
        Self::load(path)
    }
}

/// Per-run overrides. Unset or empty lists fall back to the loaded [`EtlRules`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EtlOptions {
    pub page_size: Option<usize>,
    pub agencies: Option<Vec<String>>,
    pub keywords: Option<Vec<String>>,
    pub classification_codes: Option<Vec<String>>,
    pub dry_run: bool,
    pub skip_embeddings: bool,
    pub top_n: Option<usize>,
}

impl EtlOptions {
    /// Small dry run against a handful of agencies and AI/research terms.
    pub fn quick_test() -> Self {
        let owned = |items: &[&str]| Some(items.iter().map(|s| s.to_string()).collect());
        Self {
            page_size: Some(50),
            agencies: owned(&["NSF", "NIH", "DOD"]),
            keywords: owned(&[
                "artificial intelligence",
                "machine learning",
                "robotics",
                "research",
                "innovation",
            ]),
            classification_codes: None,
            dry_run: true,
            skip_embeddings: true,
            top_n: None,
        }
    }

    pub fn resolve(&self, rules: &EtlRules) -> ResolvedRun {
        let pick = |value: &Option<Vec<String>>, fallback: &[String]| -> Vec<String> {
            let cleaned: Vec<String> = value
                .iter()
                .flatten()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if cleaned.is_empty() {
                fallback.to_vec()
            } else {
                cleaned
            }
        };
        let agencies = pick(&self.agencies, &rules.priority_agencies);
        let keywords = pick(&self.keywords, &rules.high_value_keywords);
        let classification_codes = pick(&self.classification_codes, &rules.classification_codes);

        ResolvedRun {
            page_size: self.page_size.unwrap_or(rules.page_size).max(1),
            top_n: self.top_n.unwrap_or(DEFAULT_TOP_N),
            dry_run: self.dry_run,
            skip_embeddings: self.skip_embeddings,
            scoring: ScoringConfig {
                priority_agencies: agencies.clone(),
                high_value_keywords: keywords.clone(),
            },
            filter: FilterRules {
                agencies,
                classification_codes,
                keywords: keywords.clone(),
            },
            keywords,
        }
    }
}

/// Options merged with rules; what a single run actually uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRun {
    pub page_size: usize,
    pub top_n: usize,
    pub dry_run: bool,
    pub skip_embeddings: bool,
    pub keywords: Vec<String>,
    pub filter: FilterRules,
    pub scoring: ScoringConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FilterRules {
    pub agencies: Vec<String>,
    pub classification_codes: Vec<String>,
    pub keywords: Vec<String>,
}

impl FilterRules {
    /// Agency, classification code and keyword must all match. No detail, no match.
    pub fn matches(&self, opp: &ConsolidatedOpportunity) -> bool {
        if opp.detail.is_none() {
            return false;
        }
        let agency_ok = self.agencies.iter().any(|a| *a == opp.raw.agency_code);
        if !agency_ok {
            return false;
        }
        let code_ok = opp
            .detail_classification_codes()
            .any(|code| self.classification_codes.iter().any(|c| c == code));
        if !code_ok {
            return false;
        }
        let title = opp.raw.title.to_lowercase();
        let description = opp.description().unwrap_or_default().to_lowercase();
        self.keywords.iter().any(|k| {
            let needle = k.to_lowercase();
            title.contains(&needle) || description.contains(&needle)
        })
    }
}

pub fn filter_opportunities(
    items: Vec<ConsolidatedOpportunity>,
    rules: &FilterRules,
) -> Vec<ConsolidatedOpportunity> {
    let before = items.len();
    let kept: Vec<_> = items.into_iter().filter(|opp| rules.matches(opp)).collect();
    info!(before, after = kept.len(), "filtered opportunities");
    kept
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScoringConfig {
    pub priority_agencies: Vec<String>,
    pub high_value_keywords: Vec<String>,
}

fn days_until(close: &str, now: DateTime<Utc>) -> Option<i64> {
    let close = parse_source_date(close)?;
    let close_at = close.and_time(NaiveTime::MIN).and_utc();
    let secs = (close_at - now).num_seconds();
    let whole = secs.div_euclid(86_400);
    Some(if secs.rem_euclid(86_400) > 0 { whole + 1 } else { whole })
}

/// Heuristic relevancy of one opportunity for one search keyword. Never negative.
pub fn relevancy_score(
    opp: &ConsolidatedOpportunity,
    keyword: &str,
    config: &ScoringConfig,
    now: DateTime<Utc>,
) -> u32 {
    let raw = &opp.raw;
    let title = raw.title.to_lowercase();
    let keyword = keyword.to_lowercase();
    let mut score: i64 = 0;

    if title.contains(&keyword) {
        score += 10;
    }
    for hv in &config.high_value_keywords {
        if title.contains(&hv.to_lowercase()) {
            score += 5;
        }
    }
    if config
        .priority_agencies
        .iter()
        .any(|a| raw.agency_code.contains(a.as_str()) || raw.agency.contains(a.as_str()))
    {
        score += 3;
    }
    match raw.opp_status.as_str() {
        "posted" => score += 2,
        "forecasted" => score += 1,
        _ => {}
    }
    match days_until(&raw.close_date, now) {
        Some(days) if days > 30 => score += 1,
        Some(days) if days < 7 => score -= 2,
        _ => {}
    }

    if let Some(synopsis) = opp.synopsis() {
        let description = synopsis.description.as_deref().unwrap_or_default().to_lowercase();
        if description.contains(&keyword) {
            score += 3;
        }
        for hv in &config.high_value_keywords {
            if description.contains(&hv.to_lowercase()) {
                score += 2;
            }
        }
        match synopsis.award_ceiling.as_deref().and_then(parse_currency_amount) {
            Some(amount) if amount >= 1_000_000.0 => score += 2,
            Some(amount) if amount >= 100_000.0 => score += 1,
            _ => {}
        }
    }

    score.max(0) as u32
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredOpportunity {
    pub opportunity: ConsolidatedOpportunity,
    pub max_score: u32,
    pub mean_score: f64,
    pub combined_score: f64,
}

/// Scores every opportunity against every keyword (`0.7 * max + 0.3 * mean`),
/// then keeps the `top_n` best. Equal scores keep their input order.
pub fn rank_opportunities(
    items: Vec<ConsolidatedOpportunity>,
    keywords: &[String],
    config: &ScoringConfig,
    top_n: usize,
    now: DateTime<Utc>,
) -> Vec<ScoredOpportunity> {
    let scored = items
        .into_iter()
        .map(|opportunity| {
            let scores: Vec<u32> = keywords
                .iter()
                .map(|k| relevancy_score(&opportunity, k, config, now))
                .collect();
            let max_score = scores.iter().copied().max().unwrap_or(0);
            let mean_score = if scores.is_empty() {
                0.0
            } else {
                scores.iter().map(|s| f64::from(*s)).sum::<f64>() / scores.len() as f64
            };
            ScoredOpportunity {
                opportunity,
                max_score,
                mean_score,
                combined_score: 0.7 * f64::from(max_score) + 0.3 * mean_score,
            }
        })
        .collect();
    select_top(scored, top_n)
}

pub fn select_top(mut scored: Vec<ScoredOpportunity>, n: usize) -> Vec<ScoredOpportunity> {
    scored.sort_by(|a, b| b.combined_score.total_cmp(&a.combined_score));
    scored.truncate(n);
    scored
}

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("http status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("response contained no result")]
    EmptyResponse,
    #[error("input text is empty")]
    EmptyInput,
}

#[async_trait]
pub trait Embedder: Send + Sync {
    fn model_name(&self) -> &str;

    async fn embed(&self, input: &str) -> Result<Vec<f32>, EmbeddingError>;
}

/// Cuts `text` to at most [`MAX_EMBEDDING_INPUT_CHARS`] characters.
pub fn truncate_for_embedding(text: &str) -> &str {
    match text.char_indices().nth(MAX_EMBEDDING_INPUT_CHARS) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Minimal OpenAI-compatible JSON client with retry on 429/5xx and transport errors.
#[derive(Debug, Clone)]
struct OpenAiClient {
    client: reqwest::Client,
    base_url: String,
    backoff: BackoffPolicy,
}

impl OpenAiClient {
    fn new(api_key: &str, base_url: &str, timeout: Duration) -> Result<Self> {
        anyhow::ensure!(!api_key.trim().is_empty(), "missing OpenAI API key");
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", api_key.trim()))
                .context("invalid OpenAI API key")?,
        );
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("building OpenAI client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            backoff: BackoffPolicy::default(),
        })
    }

    async fn post_json<B, T>(&self, endpoint: &str, body: &B) -> Result<T, EmbeddingError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}/{}", self.base_url, endpoint);
        let mut attempt = 0usize;
        loop {
            let result = self.client.post(&url).json(body).send().await;
            let retryable = match result {
                Ok(resp) if resp.status().is_success() => return Ok(resp.json::<T>().await?),
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp
                        .text()
                        .await
                        .unwrap_or_else(|_| "<body unavailable>".to_string());
                    let err = EmbeddingError::HttpStatus {
                        status: status.as_u16(),
                        body,
                    };
                    (classify_status(status) == RetryDisposition::Retryable, err)
                }
                Err(err) => (
                    classify_reqwest_error(&err) == RetryDisposition::Retryable,
                    EmbeddingError::Transport(err),
                ),
            };
            match retryable {
                (true, err) if attempt < self.backoff.max_retries => {
                    let delay = self.backoff.delay_for_attempt(attempt);
                    warn!(%url, attempt, error = %err, ?delay, "retrying OpenAI request");
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                (_, err) => return Err(err),
            }
        }
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
    encoding_format: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct OpenAiEmbedder {
    client: OpenAiClient,
    model: String,
}

impl OpenAiEmbedder {
    pub fn new(api_key: &str, base_url: &str, model: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: OpenAiClient::new(api_key, base_url, timeout)?,
            model: model.to_string(),
        })
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.client.backoff = backoff;
        self
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed(&self, input: &str) -> Result<Vec<f32>, EmbeddingError> {
        let input = truncate_for_embedding(input.trim());
        if input.is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }
        let request = EmbeddingRequest {
            model: &self.model,
            input,
            encoding_format: "float",
        };
        let response: EmbeddingResponse = self.client.post_json("embeddings", &request).await?;
        response
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or(EmbeddingError::EmptyResponse)
    }
}

/// Produces a short human-readable summary for a stored grant.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, grant: &StoredGrant) -> Result<String>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
}

#[derive(Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

pub fn summary_prompt(grant: &StoredGrant) -> String {
    let funding = grant
        .funding_amount
        .map(|a| format!("${a:.0}"))
        .unwrap_or_else(|| "not listed".to_string());
    let deadline = grant
        .deadline
        .map(|d| d.to_string())
        .unwrap_or_else(|| "not listed".to_string());
    format!(
        "Summarize this federal grant in 2-3 plain sentences for a prospective applicant. \
         Mention who it funds, what it supports, and any notable amount or deadline.\n\n\
         Title: {}\nAgency: {}\nFunding: {}\nDeadline: {}\nEligibility: {}\n\nDescription:\n{}",
        grant.title,
        grant.agency.as_deref().unwrap_or("not listed"),
        funding,
        deadline,
        grant.eligibility_description.as_deref().unwrap_or("not listed"),
        truncate_for_embedding(&grant.description),
    )
}

#[derive(Debug, Clone)]
pub struct OpenAiSummarizer {
    client: OpenAiClient,
    model: String,
}

impl OpenAiSummarizer {
    pub fn new(api_key: &str, base_url: &str, model: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: OpenAiClient::new(api_key, base_url, timeout)?,
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl Summarizer for OpenAiSummarizer {
    async fn summarize(&self, grant: &StoredGrant) -> Result<String> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system".into(),
                    content: "You write concise, factual grant summaries.".into(),
                },
                ChatMessage {
                    role: "user".into(),
                    content: summary_prompt(grant),
                },
            ],
            temperature: 0.3,
        };
        let response: ChatResponse = self
            .client
            .post_json("chat/completions", &request)
            .await
            .with_context(|| format!("requesting summary for grant {}", grant.id))?;
        let summary = response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.trim().to_string())
            .filter(|s| !s.is_empty())
            .context("summary response was empty")?;
        Ok(summary)
    }
}

pub fn build_embedder(settings: &EtlSettings) -> Result<Option<Arc<dyn Embedder>>> {
    let Some(key) = &settings.openai_api_key else {
        return Ok(None);
    };
    let embedder = OpenAiEmbedder::new(
        key,
        &settings.openai_base_url,
        &settings.embedding_model,
        settings.http_timeout(),
    )?;
    Ok(Some(Arc::new(embedder)))
}

pub fn build_summarizer(settings: &EtlSettings) -> Result<Option<Arc<dyn Summarizer>>> {
    let Some(key) = &settings.openai_api_key else {
        return Ok(None);
    };
    let summarizer = OpenAiSummarizer::new(
        key,
        &settings.openai_base_url,
        &settings.summary_model,
        settings.http_timeout(),
    )?;
    Ok(Some(Arc::new(summarizer)))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrepareFailure {
    pub title: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct PreparedBatch {
    pub prepared: Vec<PreparedGrant>,
    pub failures: Vec<PrepareFailure>,
}

/// Embeds grants through a bounded pool. A grant whose embedding fails is left
/// out of the batch and reported as a [`PrepareFailure`].
pub struct EmbeddingGenerator {
    embedder: Arc<dyn Embedder>,
    concurrency: usize,
    pause: Duration,
}

impl EmbeddingGenerator {
    pub fn new(embedder: Arc<dyn Embedder>, concurrency: usize, pause: Duration) -> Self {
        Self {
            embedder,
            concurrency: concurrency.max(1),
            pause,
        }
    }

    pub async fn prepare(&self, grants: Vec<GrantRecord>, now: DateTime<Utc>) -> PreparedBatch {
        let results: Vec<_> = stream::iter(grants.into_iter().map(|g| self.embed_grant(g, now)))
            .buffered(self.concurrency)
            .collect()
            .await;

        let mut batch = PreparedBatch::default();
        for result in results {
            match result {
                Ok(prepared) => batch.prepared.push(prepared),
                Err(failure) => {
                    warn!(title = %failure.title, reason = %failure.reason, "embedding failed; omitting grant");
                    batch.failures.push(failure);
                }
            }
        }
        info!(
            prepared = batch.prepared.len(),
            failed = batch.failures.len(),
            "embeddings generated"
        );
        batch
    }

    async fn embed_grant(
        &self,
        grant: GrantRecord,
        now: DateTime<Utc>,
    ) -> Result<PreparedGrant, PrepareFailure> {
        let inputs = [
            (
                EmbeddingType::FullText,
                format!("{} {}", grant.title, grant.description).trim().to_string(),
            ),
            (EmbeddingType::Title, grant.title.trim().to_string()),
        ];
        let mut embeddings = Vec::with_capacity(inputs.len());
        for (embedding_type, text) in inputs {
            if text.is_empty() {
                continue;
            }
            let vector = self.embedder.embed(&text).await.map_err(|err| PrepareFailure {
                title: grant.title.clone(),
                reason: format!("{embedding_type} embedding: {err}"),
            })?;
            embeddings.push(EmbeddingRecord {
                embedding_type,
                vector,
                model_version: self.embedder.model_name().to_string(),
                created_at: now,
            });
        }
        debug!(title = %grant.title, embeddings = embeddings.len(), "embedded grant");
        if !self.pause.is_zero() {
            tokio::time::sleep(self.pause).await;
        }
        Ok(PreparedGrant { grant, embeddings })
    }
}

/// Destination for prepared grants.
#[async_trait]
pub trait GrantSink: Send + Sync {
    async fn load_batch(&self, batch: &[PreparedGrant]) -> Result<LoadReport>;

    async fn stats(&self) -> Result<StoreStats>;
}

#[async_trait]
impl GrantSink for GrantStore {
    async fn load_batch(&self, batch: &[PreparedGrant]) -> Result<LoadReport> {
        self.upsert_batch(batch).await
    }

    async fn stats(&self) -> Result<StoreStats> {
        GrantStore::stats(self).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EtlStage {
    Fetching,
    Enriching,
    Filtering,
    Scoring,
    Loading,
    Reporting,
    Done,
    AbortedEmpty,
}

#[derive(Debug, Clone, Serialize)]
pub struct EtlRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub final_stage: EtlStage,
    pub dry_run: bool,
    pub skip_embeddings: bool,
    pub pages_fetched: usize,
    pub pagination_complete: bool,
    pub fetched: usize,
    pub details_fetched: usize,
    pub detail_failures: usize,
    pub filtered: usize,
    pub selected: usize,
    pub embedding_failures: usize,
    pub load: Option<LoadReport>,
    pub grants_processed: usize,
    pub stats: Option<StoreStats>,
    pub report_path: Option<String>,
}

impl EtlRunSummary {
    fn new(run_id: Uuid, started_at: DateTime<Utc>, run: &ResolvedRun) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            final_stage: EtlStage::Fetching,
            dry_run: run.dry_run,
            skip_embeddings: run.skip_embeddings,
            pages_fetched: 0,
            pagination_complete: true,
            fetched: 0,
            details_fetched: 0,
            detail_failures: 0,
            filtered: 0,
            selected: 0,
            embedding_failures: 0,
            load: None,
            grants_processed: 0,
            stats: None,
            report_path: None,
        }
    }
}

pub struct EtlPipeline {
    source: Arc<dyn GrantSource>,
    batcher: DetailBatcher,
    rules: EtlRules,
    embedder: Option<Arc<dyn Embedder>>,
    sink: Option<Arc<dyn GrantSink>>,
    reports_dir: Option<PathBuf>,
    embedding_concurrency: usize,
    embedding_pause: Duration,
}

impl EtlPipeline {
    pub fn new(source: Arc<dyn GrantSource>, rules: EtlRules) -> Self {
        Self {
            source,
            batcher: DetailBatcher::default(),
            rules,
            embedder: None,
            sink: None,
            reports_dir: None,
            embedding_concurrency: 4,
            embedding_pause: Duration::from_millis(100),
        }
    }

    /// Wires the real Grants.gov client, OpenAI embedder, and an optional store from settings.
    pub fn from_settings(settings: &EtlSettings, store: Option<GrantStore>) -> Result<Self> {
        let rules = EtlRules::load_or_default(&settings.rules_path)?;
        let client = GrantsGovClient::new(settings.source_client_config())?;
        let mut pipeline = Self::new(Arc::new(client), rules);
        pipeline.batcher.item_timeout = settings.http_timeout();
        pipeline.embedder = build_embedder(settings)?;
        pipeline.sink = store.map(|s| Arc::new(s) as Arc<dyn GrantSink>);
        pipeline.reports_dir = settings.reports_dir.clone();
        Ok(pipeline)
    }

    pub fn with_batcher(mut self, batcher: DetailBatcher) -> Self {
        self.batcher = batcher;
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn GrantSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_reports_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.reports_dir = Some(dir.into());
        self
    }

    pub fn with_embedding_pool(mut self, concurrency: usize, pause: Duration) -> Self {
        self.embedding_concurrency = concurrency.max(1);
        self.embedding_pause = pause;
        self
    }

    pub fn rules(&self) -> &EtlRules {
        &self.rules
    }

    pub async fn run(&self, options: &EtlOptions) -> Result<EtlRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("etl_run", %run_id);
        self.run_inner(run_id, options).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, options: &EtlOptions) -> Result<EtlRunSummary> {
        let started_at = Utc::now();
        let run = options.resolve(&self.rules);
        let mut summary = EtlRunSummary::new(run_id, started_at, &run);

        if !run.dry_run {
            anyhow::ensure!(self.sink.is_some(), "no grant store configured for a loading run");
            anyhow::ensure!(
                run.skip_embeddings || self.embedder.is_some(),
                "embeddings requested but no embedder is configured"
            );
        }
        info!(
            page_size = run.page_size,
            agencies = run.filter.agencies.len(),
            keywords = run.keywords.len(),
            dry_run = run.dry_run,
            skip_embeddings = run.skip_embeddings,
            "starting etl run"
        );

        enter(EtlStage::Fetching);
        let pagination = fetch_all_posted(self.source.as_ref(), run.page_size).await;
        summary.pages_fetched = pagination.pages_fetched;
        summary.pagination_complete = !pagination.is_partial();
        summary.fetched = pagination.opportunities.len();
        if pagination.opportunities.is_empty() {
            return self.finish(summary, EtlStage::AbortedEmpty).await;
        }

        enter(EtlStage::Enriching);
        let details = self
            .batcher
            .fetch_details(self.source.as_ref(), &pagination.opportunities)
            .await;
        summary.details_fetched = details.details.len();
        summary.detail_failures = details.failures.len();
        let consolidated = consolidate(pagination.opportunities, details.details);

        enter(EtlStage::Filtering);
        let filtered = filter_opportunities(consolidated, &run.filter);
        summary.filtered = filtered.len();
        if filtered.is_empty() {
            info!("no opportunities passed filtering");
            return self.finish(summary, EtlStage::AbortedEmpty).await;
        }

        enter(EtlStage::Scoring);
        let now = Utc::now();
        let ranked = rank_opportunities(filtered, &run.keywords, &run.scoring, run.top_n, now);
        summary.selected = ranked.len();
        if let Some(top) = ranked.first() {
            info!(
                selected = ranked.len(),
                top_score = top.combined_score,
                top_title = %top.opportunity.raw.title,
                "ranked opportunities"
            );
        }

        if run.dry_run {
            info!(selected = summary.selected, "dry run; skipping load");
            summary.grants_processed = summary.selected;
        } else {
            enter(EtlStage::Loading);
            let grants: Vec<GrantRecord> = ranked
                .iter()
                .map(|scored| map_to_grant_record(&scored.opportunity, now))
                .collect();
            let prepared = self.prepare(grants, run.skip_embeddings, now).await;
            summary.embedding_failures = prepared.failures.len();
            if prepared.prepared.is_empty() {
                warn!(failures = summary.embedding_failures, "no grants survived embedding");
                return self.finish(summary, EtlStage::AbortedEmpty).await;
            }

            if let Some(sink) = &self.sink {
                let report = sink
                    .load_batch(&prepared.prepared)
                    .await
                    .context("loading grant batch")?;
                summary.grants_processed = report.grants_written();
                summary.load = Some(report);
            }
        }

        self.finish(summary, EtlStage::Done).await
    }

    async fn prepare(
        &self,
        grants: Vec<GrantRecord>,
        skip_embeddings: bool,
        now: DateTime<Utc>,
    ) -> PreparedBatch {
        match (&self.embedder, skip_embeddings) {
            (Some(embedder), false) => {
                EmbeddingGenerator::new(
                    embedder.clone(),
                    self.embedding_concurrency,
                    self.embedding_pause,
                )
                .prepare(grants, now)
                .await
            }
            _ => PreparedBatch {
                prepared: grants
                    .into_iter()
                    .map(|grant| PreparedGrant {
                        grant,
                        embeddings: Vec::new(),
                    })
                    .collect(),
                failures: Vec::new(),
            },
        }
    }

    async fn finish(&self, mut summary: EtlRunSummary, final_stage: EtlStage) -> Result<EtlRunSummary> {
        enter(EtlStage::Reporting);
        if !summary.dry_run {
            if let Some(sink) = &self.sink {
                match sink.stats().await {
                    Ok(stats) => summary.stats = Some(stats),
                    Err(err) => warn!(error = %err, "could not collect store stats"),
                }
            }
        }
        summary.final_stage = final_stage;
        summary.finished_at = Utc::now();
        if let Some(dir) = &self.reports_dir {
            let path = write_run_report(dir, &summary).await?;
            summary.report_path = Some(path.display().to_string());
        }
        enter(final_stage);
        info!(
            fetched = summary.fetched,
            filtered = summary.filtered,
            selected = summary.selected,
            processed = summary.grants_processed,
            "etl run finished"
        );
        Ok(summary)
    }

    /// Registers a cron job that runs the pipeline with default options.
    pub async fn maybe_build_scheduler(
        self: &Arc<Self>,
        settings: &EtlSettings,
    ) -> Result<Option<JobScheduler>> {
        if !settings.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let pipeline = Arc::clone(self);
        let cron = settings.etl_cron.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run(&EtlOptions::default()).await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        processed = summary.grants_processed,
                        "scheduled etl run complete"
                    ),
                    Err(err) => error!(error = ?err, "scheduled etl run failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        info!(cron = %settings.etl_cron, "etl scheduler configured");
        Ok(Some(sched))
    }
}

fn enter(stage: EtlStage) {
    info!(stage = ?stage, "etl stage");
}

async fn write_run_report(reports_root: &Path, summary: &EtlRunSummary) -> Result<PathBuf> {
    let run_dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;
    let path = run_dir.join("etl_summary.json");
    let bytes = serde_json::to_vec_pretty(summary).context("serializing etl summary")?;
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

/// One-shot run wired entirely from the environment.
pub async fn run_etl_from_env(options: &EtlOptions) -> Result<EtlRunSummary> {
    let settings = EtlSettings::from_env();
    let store = match (&settings.database_url, options.dry_run) {
        (Some(url), false) => Some(GrantStore::connect(url).await?),
        _ => None,
    };
    EtlPipeline::from_settings(&settings, store)?.run(options).await
}
