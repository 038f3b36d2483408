use anyhow::{Context, Result, bail};
use sqlx::{PgPool, Row, postgres::PgPoolOptions};
use tracing::{info, warn};

use super::embed::Embedder;

/// Results at or below this cosine similarity are noise, not context.
pub const SIMILARITY_FLOOR: f64 = 0.3;
/// Two surviving results may not be this similar at the string level.
pub const DEDUP_THRESHOLD: f32 = 0.95;
/// Overfetch factor so dedup still leaves `limit` survivors.
const CANDIDATE_MULTIPLIER: i64 = 4;
const POOL_SIZE: u32 = 5;

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub content: String,
    pub similarity: f64,
}

/// pgvector-backed store of documentation chunks. One dimensionality per
/// table; a mismatch against live data migrates to a parallel
/// `knowledge_new` table instead of truncating history.
pub struct KnowledgeIndex {
    pool: PgPool,
    embedder: Embedder,
    migrated: bool,
}

impl KnowledgeIndex {
    pub async fn connect(url: &str, embedder: Embedder) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(POOL_SIZE)
            .connect(url)
            .await
            .context("connecting to the knowledge store")?;
        let migrated = ensure_schema(&pool, embedder.dim()).await?;
        Ok(Self {
            pool,
            embedder,
            migrated,
        })
    }

    /// Top-`limit` chunks above the similarity floor, near-duplicates
    /// suppressed. A failing search is reported as "no context", which
    /// the agent treats as a valid outcome.
    pub async fn search(&self, query: &str, limit: usize) -> Vec<SearchHit> {
        match self.try_search(query, limit).await {
            Ok(hits) => hits,
            Err(e) => {
                warn!(error = %e, "knowledge search failed; returning no context");
                Vec::new()
            }
        }
    }

    async fn try_search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let vector = self.embedder.embed(query).await?;
        let literal = vector_literal(&vector);
        let fetch = (limit as i64 * CANDIDATE_MULTIPLIER).max(1);

        let mut hits = self.query_table(self.active_table(), &literal, fetch).await?;
        if self.migrated && hits.is_empty() {
            // The fresh table may still be filling; historical data is
            // better than nothing.
            hits = self.query_table("knowledge", &literal, fetch).await?;
        }

        hits.retain(|h| h.similarity > SIMILARITY_FLOOR);
        hits.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        Ok(dedup_hits(hits, limit))
    }

    async fn query_table(&self, table: &str, literal: &str, fetch: i64) -> Result<Vec<SearchHit>> {
        let sql = format!(
            "SELECT content, 1 - (embedding <=> $1::vector) AS similarity \
             FROM {table} ORDER BY embedding <=> $1::vector LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(literal)
            .bind(fetch)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                Ok(SearchHit {
                    content: row.try_get("content")?,
                    similarity: row.try_get("similarity")?,
                })
            })
            .collect()
    }

    /// Insert pre-embedded chunks. Unlike search, ingestion errors
    /// surface to the caller.
    pub async fn ingest(&self, chunks: &[(String, Vec<f32>)]) -> Result<()> {
        let dim = self.embedder.dim();
        let sql = format!(
            "INSERT INTO {} (content, embedding) VALUES ($1, $2::vector)",
            self.active_table()
        );
        for (content, embedding) in chunks {
            if embedding.len() != dim {
                bail!(
                    "chunk has dimension {} but the active table expects {dim}",
                    embedding.len()
                );
            }
            sqlx::query(&sql)
                .bind(content)
                .bind(vector_literal(embedding))
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// Embed and insert raw documentation text.
    pub async fn add_document(&self, content: &str) -> Result<()> {
        let vector = self.embedder.embed(content).await?;
        self.ingest(&[(content.to_string(), vector)]).await
    }

    fn active_table(&self) -> &'static str {
        if self.migrated { "knowledge_new" } else { "knowledge" }
    }
}

/// Returns whether reads should prefer the parallel `knowledge_new`
/// table (dimension mismatch against a non-empty `knowledge`).
async fn ensure_schema(pool: &PgPool, dim: usize) -> Result<bool> {
    sqlx::query("CREATE EXTENSION IF NOT EXISTS vector")
        .execute(pool)
        .await?;
    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS knowledge \
         (id bigserial PRIMARY KEY, content text NOT NULL, embedding vector({dim}))"
    ))
    .execute(pool)
    .await?;

    // pgvector records the declared dimension as the column's typmod.
    let stored: i32 = sqlx::query_scalar(
        "SELECT atttypmod FROM pg_attribute \
         WHERE attrelid = 'knowledge'::regclass AND attname = 'embedding'",
    )
    .fetch_one(pool)
    .await?;

    if stored == dim as i32 {
        ensure_cosine_index(pool, "knowledge").await?;
        return Ok(false);
    }

    let count: i64 = sqlx::query_scalar("SELECT count(*) FROM knowledge")
        .fetch_one(pool)
        .await?;

    if count == 0 {
        info!(stored, dim, "empty table with stale dimension; altering in place");
        sqlx::query(&format!(
            "ALTER TABLE knowledge ALTER COLUMN embedding TYPE vector({dim})"
        ))
        .execute(pool)
        .await?;
        ensure_cosine_index(pool, "knowledge").await?;
        return Ok(false);
    }

    warn!(
        stored,
        dim, "dimension mismatch with live data; migrating reads to knowledge_new"
    );
    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS knowledge_new \
         (id bigserial PRIMARY KEY, content text NOT NULL, embedding vector({dim}))"
    ))
    .execute(pool)
    .await?;
    ensure_cosine_index(pool, "knowledge_new").await?;
    Ok(true)
}

async fn ensure_cosine_index(pool: &PgPool, table: &str) -> Result<()> {
    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS {table}_embedding_idx \
         ON {table} USING hnsw (embedding vector_cosine_ops)"
    ))
    .execute(pool)
    .await?;
    Ok(())
}

fn vector_literal(v: &[f32]) -> String {
    let mut out = String::with_capacity(v.len() * 8 + 2);
    out.push('[');
    for (i, x) in v.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&x.to_string());
    }
    out.push(']');
    out
}

/// Walk candidates best-first, dropping any whose string content is a
/// near-duplicate of an already-kept result. The earlier (higher
/// similarity) copy survives.
pub(crate) fn dedup_hits(hits: Vec<SearchHit>, limit: usize) -> Vec<SearchHit> {
    let mut kept: Vec<SearchHit> = Vec::new();
    for hit in hits {
        if kept.len() >= limit {
            break;
        }
        let duplicate = kept
            .iter()
            .any(|k| text_similarity(&k.content, &hit.content) > DEDUP_THRESHOLD);
        if !duplicate {
            kept.push(hit);
        }
    }
    kept
}

pub(crate) fn text_similarity(a: &str, b: &str) -> f32 {
    if a == b {
        return 1.0;
    }
    similar::TextDiff::from_chars(a, b).ratio()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(content: &str, similarity: f64) -> SearchHit {
        SearchHit {
            content: content.to_string(),
            similarity,
        }
    }

    #[test]
    fn near_duplicate_keeps_the_higher_similarity_copy() {
        // One character apart: string similarity well above 0.95.
        let a = "Subdivision surfaces smooth a mesh by splitting each face into smaller faces.";
        let a2 = "Subdivision surfaces smooth a mesh by splitting each face into smaller faces!";
        assert!(text_similarity(a, a2) > DEDUP_THRESHOLD);

        let survivors = dedup_hits(
            vec![hit(a, 0.91), hit(a2, 0.88), hit("Use bpy.ops to add primitives.", 0.6)],
            5,
        );
        assert_eq!(survivors.len(), 2);
        assert_eq!(survivors[0].content, a);
        assert!((survivors[0].similarity - 0.91).abs() < f64::EPSILON);
    }

    #[test]
    fn distinct_content_is_not_deduplicated() {
        let survivors = dedup_hits(
            vec![
                hit("Lights have energy and color.", 0.8),
                hit("Cameras have focal length.", 0.7),
            ],
            5,
        );
        assert_eq!(survivors.len(), 2);
    }

    #[test]
    fn limit_caps_survivors() {
        let survivors = dedup_hits(
            vec![hit("a", 0.9), hit("completely different", 0.8), hit("another thing", 0.7)],
            2,
        );
        assert_eq!(survivors.len(), 2);
        assert_eq!(survivors[0].content, "a");
    }

    #[test]
    fn vector_literal_is_pgvector_shaped() {
        assert_eq!(vector_literal(&[0.5, -1.0, 2.0]), "[0.5,-1,2]");
        assert_eq!(vector_literal(&[]), "[]");
    }
}
