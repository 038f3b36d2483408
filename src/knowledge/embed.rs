use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Client for the embeddings endpoint. Vectors come back unit-normalized
/// so cosine similarity reduces to a dot product on the store side.
pub struct Embedder {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    dim: usize,
}

// ── Wire types ────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: [&'a str; 1],
    dimensions: usize,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

// ── Implementation ────────────────────────────────────────────────────────────

impl Embedder {
    pub fn from_env(client: reqwest::Client, dim: usize) -> Result<Self> {
        let api_key = std::env::var("BIGMODEL_API_KEY")
            .context("BIGMODEL_API_KEY is required for the knowledge index")?;
        let base_url = std::env::var("BIGMODEL_BASE_URL")
            .unwrap_or_else(|_| "https://open.bigmodel.cn/api/paas/v4".to_string());
        let model =
            std::env::var("EMBEDDING_MODEL").unwrap_or_else(|_| "embedding-3".to_string());
        Ok(Self {
            client,
            base_url,
            api_key,
            model,
            dim,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let body = EmbeddingRequest {
            model: &self.model,
            input: [text],
            dimensions: self.dim,
        };

        let resp = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .context("embedding HTTP request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("API error {status}: {text}"));
        }

        let parsed: EmbeddingResponse =
            resp.json().await.context("failed to decode embedding response")?;
        let mut vector = parsed
            .data
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("API returned no embedding"))?
            .embedding;

        if vector.len() != self.dim {
            return Err(anyhow!(
                "embedding has dimension {} but the index expects {}",
                vector.len(),
                self.dim
            ));
        }
        normalize(&mut vector);
        Ok(vector)
    }
}

pub(crate) fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::normalize;

    #[test]
    fn normalize_produces_unit_vectors() {
        let mut v = vec![3.0_f32, 4.0];
        normalize(&mut v);
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
        assert!((v[0] - 0.6).abs() < 1e-6);
    }

    #[test]
    fn normalize_leaves_zero_vector_alone() {
        let mut v = vec![0.0_f32; 4];
        normalize(&mut v);
        assert!(v.iter().all(|x| *x == 0.0));
    }
}
