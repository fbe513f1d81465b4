//! Retrieval subsystem client for the `search_knowledge_base` tool.
//! Chunking, embedding, and vector search themselves are out of scope —
//! this only calls the consumed `semantic_search` interface (spec.md §6).

use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};

const TOP_K: u32 = 5;
const MIN_SIMILARITY: f64 = 0.3;
/// A hung retrieval backend must not hang the call.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(8);

pub struct KnowledgeBaseClient {
    client: reqwest::Client,
    base_url: String,
}

impl KnowledgeBaseClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            base_url: base_url.into(),
        }
    }

    /// Search and shape the result the way the LLM expects it back: a
    /// found/not-found envelope, never a bare error the model can't parse.
    pub async fn search(&self, agent_id: i64, query: &str) -> Value {
        match self.semantic_search(agent_id, query).await {
            Ok(matches) if matches.is_empty() => json!({
                "found": false,
                "message": "No relevant information found in knowledge base."
            }),
            Ok(matches) => {
                let results: Vec<Value> = matches
                    .iter()
                    .map(|m| {
                        json!({
                            "text": m.chunk_text,
                            "similarity": m.score,
                            "filename": m.filename,
                        })
                    })
                    .collect();
                json!({
                    "found": true,
                    "summary": format!("Found {} relevant chunks from knowledge base.", results.len()),
                    "results": results,
                })
            }
            Err(e) => json!({"found": false, "error": e.to_string()}),
        }
    }

    async fn semantic_search(
        &self,
        agent_id: i64,
        query: &str,
    ) -> Result<Vec<SearchMatch>, KnowledgeBaseError> {
        let resp = self
            .client
            .post(format!("{}/semantic_search", self.base_url))
            .json(&json!({
                "agent_id": agent_id,
                "query": query,
                "k": TOP_K,
                "min_similarity": MIN_SIMILARITY,
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(KnowledgeBaseError::Api(resp.status().to_string()));
        }

        Ok(resp.json().await?)
    }
}

#[derive(Debug, Deserialize)]
struct SearchMatch {
    chunk_text: String,
    filename: String,
    score: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum KnowledgeBaseError {
    #[error("knowledge base request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("knowledge base API error: {0}")]
    Api(String),
}
