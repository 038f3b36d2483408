use serde_json::{Value, json};
use tracing::debug;

use crate::knowledge::KnowledgeIndex;

const DEFAULT_LIMIT: usize = 5;

/// Query the knowledge index. This tool never fails: a missing index or
/// a failing search both come back as zero documents, which the agent
/// treats as "no context".
pub async fn search(index: Option<&KnowledgeIndex>, query: &str) -> Value {
    let hits = match index {
        Some(index) => index.search(query, DEFAULT_LIMIT).await,
        None => {
            debug!("knowledge index not configured; returning no context");
            Vec::new()
        }
    };

    let documents: Vec<&str> = hits.iter().map(|h| h.content.as_str()).collect();
    let detailed: Vec<Value> = hits
        .iter()
        .map(|h| json!({ "content": h.content, "similarity": h.similarity }))
        .collect();
    json!({
        "documents": documents,
        "detailedResults": detailed,
        "count": hits.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_index_yields_an_empty_result_not_an_error() {
        let value = search(None, "how do I add a subsurf modifier").await;
        assert_eq!(value["count"], 0);
        assert_eq!(value["documents"].as_array().unwrap().len(), 0);
    }
}
