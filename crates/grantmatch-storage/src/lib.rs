//! Postgres + pgvector persistence for grants and their embeddings.

use anyhow::Context;
use grantmatch_core::{
    EmbeddingRecord, GrantRecord, LoadReport, PreparedGrant, StoreStats, StoredGrant,
    EMBEDDING_DIMENSIONS,
};
use pgvector::Vector;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "grantmatch-storage";

/// Row cap for the unfiltered grant listing.
pub const DEFAULT_LIST_LIMIT: i64 = 500;

const GRANT_COLUMNS: &str = "g.id, g.title, g.description, g.deadline, g.funding_amount, \
     g.source, g.agency, g.source_url, g.focus_areas, g.focus_area_titles, g.posted_date, \
     g.eligibility_description, g.created_at, g.summary";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("embedding {embedding_type} for {title:?} has {actual} dimensions, expected {expected}")]
    EmbeddingDimension {
        title: String,
        embedding_type: String,
        expected: usize,
        actual: usize,
    },
}

#[derive(Debug, Clone)]
pub struct GrantStore {
    pool: PgPool,
}

impl GrantStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running database migrations")?;
        info!("database migrations applied");
        Ok(())
    }

    pub async fn health(&self) -> anyhow::Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("database health check")?;
        Ok(())
    }

    /// Upserts every grant and its embeddings in a single transaction.
    ///
    /// Any failure rolls back the whole batch; nothing from it is visible afterwards.
    pub async fn upsert_batch(&self, batch: &[PreparedGrant]) -> anyhow::Result<LoadReport> {
        let span = info_span!("upsert_batch", grants = batch.len());
        async move {
            let mut tx = self.pool.begin().await.context("beginning load transaction")?;
            match write_batch(&mut tx, batch).await {
                Ok(report) => {
                    tx.commit().await.context("committing load transaction")?;
                    info!(
                        inserted = report.inserted,
                        updated = report.updated,
                        embeddings = report.embeddings_written,
                        "batch committed"
                    );
                    Ok(report)
                }
                Err(err) => {
                    if let Err(rollback_err) = tx.rollback().await {
                        warn!(error = %rollback_err, "rollback failed");
                    }
                    warn!(error = %err, "batch rolled back");
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Newest first.
    pub async fn list_grants(&self, limit: i64) -> anyhow::Result<Vec<StoredGrant>> {
        let sql = format!(
            "SELECT {GRANT_COLUMNS} FROM grants g \
             ORDER BY g.created_at DESC NULLS LAST, g.id DESC LIMIT $1"
        );
        let rows = sqlx::query(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("listing grants")?;
        rows.iter().map(stored_grant_from_row).collect()
    }

    pub async fn get_grant(&self, id: i64) -> anyhow::Result<Option<StoredGrant>> {
        let sql = format!("SELECT {GRANT_COLUMNS} FROM grants g WHERE g.id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("loading grant {id}"))?;
        row.as_ref().map(stored_grant_from_row).transpose()
    }

    /// Grants ranked by cosine similarity of their `full_text` embedding to `query`.
    pub async fn search_by_embedding(
        &self,
        query: &[f32],
        limit: i64,
    ) -> anyhow::Result<Vec<(StoredGrant, f64)>> {
        let sql = format!(
            "SELECT {GRANT_COLUMNS}, (1 - (e.embedding <=> $1))::float8 AS similarity \
             FROM grants g \
             JOIN grant_embeddings e ON e.grant_id = g.id AND e.embedding_type = 'full_text' \
             ORDER BY e.embedding <=> $1 \
             LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(Vector::from(query.to_vec()))
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("vector search over grants")?;
        rows.iter().map(scored_grant_from_row).collect()
    }

    /// Nearest neighbours of an existing grant, never including the grant itself.
    /// Empty when the grant has no `full_text` embedding.
    pub async fn find_similar(
        &self,
        grant_id: i64,
        limit: i64,
    ) -> anyhow::Result<Vec<(StoredGrant, f64)>> {
        let sql = format!(
            "WITH base AS ( \
                 SELECT embedding FROM grant_embeddings \
                 WHERE grant_id = $1 AND embedding_type = 'full_text' \
                 ORDER BY created_at DESC LIMIT 1 \
             ) \
             SELECT {GRANT_COLUMNS}, (1 - (e.embedding <=> base.embedding))::float8 AS similarity \
             FROM base \
             JOIN grant_embeddings e ON e.embedding_type = 'full_text' \
             JOIN grants g ON g.id = e.grant_id \
             WHERE g.id <> $1 \
             ORDER BY e.embedding <=> base.embedding \
             LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(grant_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("finding grants similar to {grant_id}"))?;
        rows.iter().map(scored_grant_from_row).collect()
    }

    /// Case-insensitive match on title and description.
    pub async fn search_text(&self, query: &str, limit: i64) -> anyhow::Result<Vec<StoredGrant>> {
        let sql = format!(
            "SELECT {GRANT_COLUMNS} FROM grants g \
             WHERE g.title ILIKE $1 OR g.description ILIKE $1 \
             ORDER BY g.created_at DESC NULLS LAST, g.id DESC LIMIT $2"
        );
        let pattern = format!("%{}%", escape_like(query.trim()));
        let rows = sqlx::query(&sql)
            .bind(pattern)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("text search over grants")?;
        rows.iter().map(stored_grant_from_row).collect()
    }

    pub async fn update_summary(
        &self,
        grant_id: i64,
        summary: &str,
    ) -> anyhow::Result<Option<StoredGrant>> {
        let updated = sqlx::query("UPDATE grants SET summary = $2, updated_at = NOW() WHERE id = $1")
            .bind(grant_id)
            .bind(summary)
            .execute(&self.pool)
            .await
            .with_context(|| format!("storing summary for grant {grant_id}"))?;
        if updated.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_grant(grant_id).await
    }

    pub async fn stats(&self) -> anyhow::Result<StoreStats> {
        let row = sqlx::query(
            "SELECT \
                 (SELECT COUNT(*) FROM grants) AS total_grants, \
                 (SELECT COUNT(*) FROM grant_embeddings) AS total_embeddings, \
                 (SELECT COUNT(*) FROM grants WHERE created_at > NOW() - INTERVAL '24 hours') AS grants_last_24h",
        )
        .fetch_one(&self.pool)
        .await
        .context("collecting store stats")?;
        Ok(StoreStats {
            total_grants: row.try_get("total_grants")?,
            total_embeddings: row.try_get("total_embeddings")?,
            grants_last_24h: row.try_get("grants_last_24h")?,
        })
    }
}

async fn write_batch(
    tx: &mut Transaction<'_, Postgres>,
    batch: &[PreparedGrant],
) -> anyhow::Result<LoadReport> {
    let mut report = LoadReport::default();
    for prepared in batch {
        let (grant_id, inserted) = upsert_grant(tx, &prepared.grant)
            .await
            .with_context(|| format!("upserting grant {:?}", prepared.grant.title))?;
        if inserted {
            report.inserted += 1;
        } else {
            report.updated += 1;
        }
        for embedding in &prepared.embeddings {
            check_dimensions(&prepared.grant, embedding)?;
            upsert_embedding(tx, grant_id, embedding).await.with_context(|| {
                format!(
                    "upserting {} embedding for {:?}",
                    embedding.embedding_type, prepared.grant.title
                )
            })?;
            report.embeddings_written += 1;
        }
    }
    Ok(report)
}

fn check_dimensions(grant: &GrantRecord, embedding: &EmbeddingRecord) -> Result<(), StoreError> {
    if embedding.vector.len() == EMBEDDING_DIMENSIONS {
        return Ok(());
    }
    Err(StoreError::EmbeddingDimension {
        title: grant.title.clone(),
        embedding_type: embedding.embedding_type.to_string(),
        expected: EMBEDDING_DIMENSIONS,
        actual: embedding.vector.len(),
    })
}

/// Returns the grant id and whether the row was newly inserted.
async fn upsert_grant(
    tx: &mut Transaction<'_, Postgres>,
    grant: &GrantRecord,
) -> anyhow::Result<(i64, bool)> {
    let existing: Option<i64> =
        sqlx::query_scalar("SELECT id FROM grants WHERE title = $1 AND source = $2")
            .bind(&grant.title)
            .bind(&grant.source)
            .fetch_optional(&mut **tx)
            .await?;

    if let Some(id) = existing {
        sqlx::query(
            "UPDATE grants SET \
                 description = $2, deadline = $3, funding_amount = $4, agency = $5, \
                 source_url = $6, focus_areas = $7, focus_area_titles = $8, posted_date = $9, \
                 eligibility_description = $10, created_at = COALESCE(created_at, $11), \
                 summary = COALESCE($12, summary), updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(&grant.description)
        .bind(grant.deadline)
        .bind(grant.funding_amount)
        .bind(&grant.agency)
        .bind(&grant.source_url)
        .bind(&grant.focus_areas)
        .bind(&grant.focus_area_titles)
        .bind(grant.posted_date)
        .bind(&grant.eligibility_description)
        .bind(grant.created_at)
        .bind(&grant.summary)
        .execute(&mut **tx)
        .await?;
        debug!(grant_id = id, title = %grant.title, "updated grant");
        return Ok((id, false));
    }

    let id: i64 = sqlx::query_scalar(
        "INSERT INTO grants ( \
             title, description, deadline, funding_amount, source, agency, source_url, \
             focus_areas, focus_area_titles, posted_date, eligibility_description, created_at, summary \
         ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
         RETURNING id",
    )
    .bind(&grant.title)
    .bind(&grant.description)
    .bind(grant.deadline)
    .bind(grant.funding_amount)
    .bind(&grant.source)
    .bind(&grant.agency)
    .bind(&grant.source_url)
    .bind(&grant.focus_areas)
    .bind(&grant.focus_area_titles)
    .bind(grant.posted_date)
    .bind(&grant.eligibility_description)
    .bind(grant.created_at)
    .bind(&grant.summary)
    .fetch_one(&mut **tx)
    .await?;
    debug!(grant_id = id, title = %grant.title, "inserted grant");
    Ok((id, true))
}

async fn upsert_embedding(
    tx: &mut Transaction<'_, Postgres>,
    grant_id: i64,
    embedding: &EmbeddingRecord,
) -> anyhow::Result<()> {
    let vector = Vector::from(embedding.vector.clone());
    let existing: Option<i64> = sqlx::query_scalar(
        "SELECT id FROM grant_embeddings \
         WHERE grant_id = $1 AND embedding_type = $2 AND model_version = $3",
    )
    .bind(grant_id)
    .bind(embedding.embedding_type.as_str())
    .bind(&embedding.model_version)
    .fetch_optional(&mut **tx)
    .await?;

    match existing {
        Some(id) => {
            sqlx::query("UPDATE grant_embeddings SET embedding = $2, created_at = $3 WHERE id = $1")
                .bind(id)
                .bind(vector)
                .bind(embedding.created_at)
                .execute(&mut **tx)
                .await?;
        }
        None => {
            sqlx::query(
                "INSERT INTO grant_embeddings (grant_id, embedding_type, embedding, model_version, created_at) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(grant_id)
            .bind(embedding.embedding_type.as_str())
            .bind(vector)
            .bind(&embedding.model_version)
            .bind(embedding.created_at)
            .execute(&mut **tx)
            .await?;
        }
    }
    Ok(())
}

fn stored_grant_from_row(row: &PgRow) -> anyhow::Result<StoredGrant> {
    Ok(StoredGrant {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        deadline: row.try_get("deadline")?,
        funding_amount: row.try_get("funding_amount")?,
        source: row.try_get("source")?,
        agency: row.try_get("agency")?,
        source_url: row.try_get("source_url")?,
        focus_areas: row.try_get("focus_areas")?,
        focus_area_titles: row.try_get("focus_area_titles")?,
        posted_date: row.try_get("posted_date")?,
        eligibility_description: row.try_get("eligibility_description")?,
        created_at: row.try_get("created_at")?,
        summary: row.try_get("summary")?,
    })
}

fn scored_grant_from_row(row: &PgRow) -> anyhow::Result<(StoredGrant, f64)> {
    let similarity: f64 = row.try_get("similarity")?;
    Ok((stored_grant_from_row(row)?, similarity))
}

fn escape_like(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use grantmatch_core::{EmbeddingType, GRANTS_GOV_SOURCE};

    #[test]
    fn like_patterns_are_escaped() {
        assert_eq!(escape_like("100%_ai\\"), "100\\%\\_ai\\\\");
        assert_eq!(escape_like("climate"), "climate");
    }

    #[test]
    fn dimension_check_rejects_short_vectors() {
        let grant = grant("Short vector");
        let err = check_dimensions(&grant, &embedding(EmbeddingType::Title, 3)).unwrap_err();
        assert!(err.to_string().contains("expected 1536"));
        assert!(check_dimensions(&grant, &embedding(EmbeddingType::Title, EMBEDDING_DIMENSIONS)).is_ok());
    }

    fn grant(title: &str) -> GrantRecord {
        GrantRecord {
            title: title.to_string(),
            description: "Supports research.".into(),
            deadline: None,
            funding_amount: Some(500_000.0),
            source: GRANTS_GOV_SOURCE.into(),
            agency: "NSF".into(),
            source_url: None,
            focus_areas: vec!["47.041".into()],
            focus_area_titles: vec!["Engineering".into()],
            posted_date: None,
            eligibility_description: "Universities".into(),
            created_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().unwrap(),
            summary: None,
        }
    }

    fn embedding(kind: EmbeddingType, dims: usize) -> EmbeddingRecord {
        EmbeddingRecord {
            embedding_type: kind,
            vector: vec![0.01; dims],
            model_version: "text-embedding-3-small".into(),
            created_at: Utc::now(),
        }
    }
}
