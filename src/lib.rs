//! Core retrieval and processing engine for a document-grounded
//! question-answering service.
//!
//! ```text
//! IngestJob ─► IngestionOrchestrator ─┬─► TreeBuilder ─► DocumentTree
//!                                     ├─► Summarizer / QAGenerator
//!                                     ├─► Chunker
//!                                     └─► Embedder + VectorIndex (per collection)
//!
//! QueryJob ──► QueryOrchestrator ─┬─► HybridRetriever (RRF fusion)
//!                                 ├─► Reranker
//!                                 ├─► AgentEvaluator
//!                                 └─► AnswerGenerator ─► QueryResult
//! ```
//!
//! Every external collaborator (object storage, LLM, embedder, vector
//! index, metadata store, job queue, language tagger) is expressed as a
//! capability port in [`ports`]; this crate is exercised exclusively
//! against those traits and their in-memory fakes. Wiring a port to a
//! concrete provider is the embedding application's responsibility.

pub mod chunk;
pub mod config;
pub mod error;
pub mod model;
pub mod orchestrate;
pub mod ports;
pub mod retrieval;
pub mod summarize;
pub mod tree;

pub use chunk::Chunker;
pub use config::{Settings, SettingsLoader};
pub use error::{RagError, RetryPolicy};
pub use orchestrate::{IngestionOrchestrator, QueryOrchestrator};
pub use summarize::{QAGenerator, Summarizer};
pub use tree::TreeBuilder;

/// Initializes a human-readable `tracing-subscriber` for binaries and
/// integration tests. The library itself never installs a global
/// subscriber; only the embedding application or a test harness should
/// call this.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
}
