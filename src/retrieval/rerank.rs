//! LLM-driven rescoring of the top fused candidates, with a safe fallback
//! to the original fused ordering when the reranker is unavailable.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{instrument, warn};

use crate::error::{RetryPolicy, RagError};
use crate::ports::{Chat, ChatRequest};
use crate::retrieval::Candidate;

#[derive(Debug, Deserialize)]
struct RawScores {
    scores: Vec<f64>,
}

/// Rescores the top-N fused candidates with a single Chat call requesting a
/// JSON array of scores aligned by index to the input order.
pub struct Reranker {
    chat: Arc<dyn Chat>,
    retry_policy: RetryPolicy,
}

impl Reranker {
    pub fn new(chat: Arc<dyn Chat>) -> Self {
        Self { chat, retry_policy: RetryPolicy::default() }
    }

    /// Returns the reranked candidates (truncated to `rerank_top`) and
    /// whether a fallback to the original order occurred.
    #[instrument(skip(self, query, candidates))]
    pub async fn rerank(&self, query: &str, candidates: Vec<Candidate>, rerank_top: usize) -> (Vec<Candidate>, bool) {
        let top_n: Vec<Candidate> = candidates.into_iter().take(rerank_top).collect();
        if top_n.is_empty() {
            return (top_n, false);
        }

        match self.try_rerank(query, &top_n).await {
            Ok(scores) if scores.len() == top_n.len() => {
                let reranked = top_n
                    .into_iter()
                    .zip(scores)
                    .map(|(mut candidate, score)| {
                        candidate.score_change = score - candidate.fused_score;
                        candidate.score = score;
                        candidate
                    })
                    .collect();
                (reranked, false)
            }
            Ok(_) => {
                warn!("reranker returned a score count mismatch, falling back to fused order");
                (fallback(top_n), true)
            }
            Err(err) => {
                warn!(error = %err, "reranker call failed, falling back to fused order");
                (fallback(top_n), true)
            }
        }
    }

    async fn try_rerank(&self, query: &str, candidates: &[Candidate]) -> Result<Vec<f64>, RagError> {
        let listing: String = candidates
            .iter()
            .enumerate()
            .map(|(i, c)| format!("[{i}] {}", c.content))
            .collect::<Vec<_>>()
            .join("\n\n");
        let user = format!("Question: {query}\n\nRate the relevance of each passage from 0.0 to 1.0, returning JSON {{\"scores\": [..]}} in the same order:\n\n{listing}");

        let raw = self
            .retry_policy
            .run(|| {
                let chat = self.chat.clone();
                let user = user.clone();
                async move {
                    chat.complete(ChatRequest { system: "You are a precise relevance-scoring assistant.".into(), user, max_tokens: 300, temperature: 0.0, json_mode: true })
                        .await
                }
            })
            .await?;

        let parsed: RawScores = serde_json::from_str(&raw).map_err(|err| RagError::SchemaViolation { port: "reranker", detail: err.to_string() })?;
        Ok(parsed.scores)
    }
}

fn fallback(candidates: Vec<Candidate>) -> Vec<Candidate> {
    candidates
        .into_iter()
        .map(|mut c| {
            c.score = c.fused_score;
            c.score_change = 0.0;
            c
        })
        .collect()
}
