//! The query-side pipeline: hybrid search, reranking, agentic evaluation,
//! and grounded answer generation.

pub mod answer;
pub mod evaluator;
pub mod hybrid;
pub mod rerank;

pub use answer::{AnswerGenerator, GeneratedAnswer};
pub use evaluator::AgentEvaluator;
pub use hybrid::HybridRetriever;
pub use rerank::Reranker;

use uuid::Uuid;

/// A single retrieved item, already fused and (optionally) reranked.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub chunk_id: Uuid,
    pub doc_id: Uuid,
    pub content: String,
    pub hierarchy_path: Vec<String>,
    pub page_number: Option<u32>,
    pub source: &'static str,
    pub fused_score: f64,
    pub score: f64,
    pub score_change: f64,
}
