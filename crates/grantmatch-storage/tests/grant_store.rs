//! Loader and query tests against a real Postgres with pgvector.
//!
//! One container is started for the whole test binary and migrated once.
//! Each test gets its own pool and uses unique titles, so tests can share it.

use anyhow::{Context, Result};
use chrono::{Duration, TimeZone, Utc};
use grantmatch_core::{
    EmbeddingRecord, EmbeddingType, GrantRecord, PreparedGrant, EMBEDDING_DIMENSIONS,
    GRANTS_GOV_SOURCE,
};
use grantmatch_storage::GrantStore;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

struct SharedDatabase {
    url: String,
    _postgres: ContainerAsync<Postgres>,
}

static SHARED_DATABASE: OnceCell<SharedDatabase> = OnceCell::const_new();

impl SharedDatabase {
    async fn init() -> Result<Self> {
        let postgres = Postgres::default()
            .with_name("pgvector/pgvector")
            .with_tag("pg16")
            .start()
            .await
            .context("starting pgvector container")?;
        let host = postgres.get_host().await?;
        let port = postgres.get_host_port_ipv4(5432).await?;
        let url = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

        GrantStore::connect(&url).await?.migrate().await?;
        Ok(Self {
            url,
            _postgres: postgres,
        })
    }
}

async fn test_store() -> GrantStore {
    let shared = SHARED_DATABASE
        .get_or_init(|| async {
            SharedDatabase::init()
                .await
                .expect("failed to start shared test database")
        })
        .await;
    GrantStore::connect(&shared.url)
        .await
        .expect("failed to connect to test database")
}

fn unique(prefix: &str) -> String {
    format!("{prefix} {}", Utc::now().timestamp_nanos_opt().unwrap_or_default())
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

#[tokio::test]
async fn upsert_is_idempotent_and_keeps_created_at() {
    let store = test_store().await;
    let mut first = grant(&unique("Idempotent grant"));
    let original_created = first.created_at;
    let batch = vec![PreparedGrant {
        grant: first.clone(),
        embeddings: vec![
            embedding(EmbeddingType::FullText, EMBEDDING_DIMENSIONS),
            embedding(EmbeddingType::Title, EMBEDDING_DIMENSIONS),
        ],
    }];

    let report = store.upsert_batch(&batch).await.unwrap();
    assert_eq!(report.inserted, 1);
    assert_eq!(report.embeddings_written, 2);

    first.created_at = original_created + Duration::days(30);
    first.description = "Revised description.".into();
    let report = store
        .upsert_batch(&[PreparedGrant {
            grant: first.clone(),
            embeddings: batch[0].embeddings.clone(),
        }])
        .await
        .unwrap();
    assert_eq!(report.inserted, 0);
    assert_eq!(report.updated, 1);

    let rows = store.search_text(&first.title, 10).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].created_at, Some(original_created));
    assert_eq!(rows[0].description, "Revised description.");

    let embeddings: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM grant_embeddings WHERE grant_id = $1")
            .bind(rows[0].id)
            .fetch_one(store.pool())
            .await
            .unwrap();
    assert_eq!(embeddings, 2);
}

#[tokio::test]
async fn failed_batch_leaves_no_partial_rows() {
    let store = test_store().await;
    let good = grant(&unique("Committed only with its batch"));
    let bad = grant(&unique("Bad vector"));
    let batch = vec![
        PreparedGrant {
            grant: good.clone(),
            embeddings: vec![embedding(EmbeddingType::FullText, EMBEDDING_DIMENSIONS)],
        },
        PreparedGrant {
            grant: bad.clone(),
            embeddings: vec![embedding(EmbeddingType::FullText, 8)],
        },
    ];

    let err = store.upsert_batch(&batch).await.unwrap_err();
    assert!(format!("{err:#}").contains("expected 1536"));
    assert!(store.search_text(&good.title, 10).await.unwrap().is_empty());
    assert!(store.search_text(&bad.title, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn similar_grants_exclude_the_base_grant() {
    let store = test_store().await;
    let base_title = unique("Similarity base");
    let batch: Vec<_> = [base_title.clone(), unique("Similarity neighbour")]
        .into_iter()
        .map(|title| PreparedGrant {
            grant: grant(&title),
            embeddings: vec![embedding(EmbeddingType::FullText, EMBEDDING_DIMENSIONS)],
        })
        .collect();
    store.upsert_batch(&batch).await.unwrap();

    let base = store.search_text(&base_title, 1).await.unwrap().remove(0);
    let similar = store.find_similar(base.id, 50).await.unwrap();
    assert!(!similar.is_empty());
    assert!(similar.iter().all(|(g, _)| g.id != base.id));
    assert!(store.get_grant(base.id).await.unwrap().is_some());
}

#[tokio::test]
async fn stats_count_loaded_grants_and_embeddings() {
    let store = test_store().await;
    let before = store.stats().await.unwrap();
    store
        .upsert_batch(&[PreparedGrant {
            grant: grant(&unique("Counted grant")),
            embeddings: vec![embedding(EmbeddingType::FullText, EMBEDDING_DIMENSIONS)],
        }])
        .await
        .unwrap();
    let after = store.stats().await.unwrap();
    assert!(after.total_grants > before.total_grants);
    assert!(after.total_embeddings > before.total_embeddings);
    store.health().await.unwrap();
}
