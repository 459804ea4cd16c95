//! Drives the bounded agentic retrieval loop and assembles the persisted
//! QueryResult plus its optional debug-data record.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::config::{Settings, SettingsLoader};
use crate::error::{RetryPolicy, RagError};
use crate::model::{
    AgentDecision, ChunkResult, DebugData, IterationDebug, QueryJob, QueryResult, SearchSourceCounts, TimingBreakdown,
};
use crate::ports::{Embedder, MetaStore};
use crate::retrieval::{AgentEvaluator, AnswerGenerator, Candidate, GeneratedAnswer, HybridRetriever, Reranker};

const MAX_ERROR_MESSAGE_LEN: usize = 2000;

pub struct QueryOrchestrator {
    embedder: Arc<dyn Embedder>,
    retriever: HybridRetriever,
    reranker: Reranker,
    evaluator: AgentEvaluator,
    answer_generator: AnswerGenerator,
    meta_store: Arc<dyn MetaStore>,
    settings_loader: Arc<SettingsLoader>,
    retry_policy: RetryPolicy,
}

impl QueryOrchestrator {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        retriever: HybridRetriever,
        reranker: Reranker,
        evaluator: AgentEvaluator,
        answer_generator: AnswerGenerator,
        meta_store: Arc<dyn MetaStore>,
        settings_loader: Arc<SettingsLoader>,
    ) -> Self {
        Self { embedder, retriever, reranker, evaluator, answer_generator, meta_store, settings_loader, retry_policy: RetryPolicy::default() }
    }

    #[instrument(skip(self, job), fields(query_id = %job.query_id, correlation_id = %job.correlation_id))]
    pub async fn answer(&self, job: &QueryJob) -> Result<QueryResult, RagError> {
        let started = Instant::now();
        let settings = self.settings_loader.resolve();

        let mut timing = TimingBreakdown::default();
        let mut iterations = Vec::new();

        match self.run(job, &settings, &mut iterations, &mut timing).await {
            Ok(generated) => {
                timing.total_ms = started.elapsed().as_millis() as u64;
                let confidence_score = iterations.last().map(|it| it.agent_evaluation.confidence).unwrap_or(0.0);
                let result = QueryResult {
                    query_id: job.query_id,
                    answer: Some(generated.answer),
                    citations: generated.citations,
                    confidence_score,
                    total_time_ms: timing.total_ms,
                    iteration_count: iterations.len() as u32,
                    debug_data: job.debug_mode.then_some(DebugData { iterations, timing }),
                    error_message: None,
                };
                self.meta_store.put_query_result(result.clone()).await?;
                info!(iterations = result.iteration_count, total_ms = result.total_time_ms, "query answered");
                Ok(result)
            }
            Err(err) => {
                error!(error = %err, "query pipeline failed, persisting degraded result");
                timing.total_ms = started.elapsed().as_millis() as u64;
                let confidence_score = iterations.last().map(|it| it.agent_evaluation.confidence).unwrap_or(0.0);
                let result = QueryResult {
                    query_id: job.query_id,
                    answer: None,
                    citations: Vec::new(),
                    confidence_score,
                    total_time_ms: timing.total_ms,
                    iteration_count: iterations.len() as u32,
                    debug_data: job.debug_mode.then_some(DebugData { iterations, timing }),
                    error_message: Some(truncate(&err.to_string(), MAX_ERROR_MESSAGE_LEN)),
                };
                self.meta_store.put_query_result(result).await?;
                Err(err)
            }
        }
    }

    /// Runs the bounded agentic retrieval loop followed by answer
    /// generation, recording each completed iteration into `iterations` as
    /// it goes so a failure partway through still leaves the caller with
    /// every iteration completed so far.
    async fn run(&self, job: &QueryJob, settings: &Settings, iterations: &mut Vec<IterationDebug>, timing: &mut TimingBreakdown) -> Result<GeneratedAnswer, RagError> {
        let mut query_text = job.query_text.clone();
        let mut top_k = settings.default_top_k;
        let mut document_filter = job.document_filter.clone();
        let max_top_k = settings.default_top_k * 4;

        let mut last_context: Vec<Candidate> = Vec::new();

        for iteration_number in 1..=settings.max_agent_iterations {
            let iteration_started = Instant::now();

            let embed_started = Instant::now();
            let embeddings = self
                .retry_policy
                .run(|| {
                    let embedder = self.embedder.clone();
                    let query_text = query_text.clone();
                    async move { embedder.embed(std::slice::from_ref(&query_text)).await }
                })
                .await?;
            let query_embedding = embeddings.into_iter().next().unwrap_or_default();
            timing.embedding_ms += embed_started.elapsed().as_millis() as u64;

            let search_started = Instant::now();
            let (candidates, counts) = self
                .retriever
                .search(&query_text, &query_embedding, top_k, settings.rrf_k, document_filter.as_deref())
                .await?;
            timing.search_ms += search_started.elapsed().as_millis() as u64;
            let chunks_before_rerank = to_chunk_results(&candidates, false);

            let rerank_started = Instant::now();
            let (reranked, fallback_used) = self.reranker.rerank(&query_text, candidates, settings.default_rerank_top).await;
            timing.rerank_ms += rerank_started.elapsed().as_millis() as u64;
            let chunks_after_rerank = to_chunk_results(&reranked, true);

            let agent_started = Instant::now();
            let mut evaluation = self.evaluator.evaluate(&query_text, &reranked).await?;
            if fallback_used {
                evaluation.reasoning.push_str(" [rerank_fallback]");
            }
            timing.agent_ms += agent_started.elapsed().as_millis() as u64;

            let decision = evaluation.decision;
            last_context = reranked;

            iterations.push(IterationDebug {
                iteration_number,
                query_used: query_text.clone(),
                search_sources: counts,
                chunks_before_rerank,
                chunks_after_rerank,
                agent_evaluation: evaluation.clone(),
                duration_ms: iteration_started.elapsed().as_millis() as u64,
            });

            let is_last_allowed = iteration_number == settings.max_agent_iterations;
            if decision == AgentDecision::Proceed || is_last_allowed {
                break;
            }

            match decision {
                AgentDecision::RefineQuery => {
                    if let Some(refined) = evaluation.refined_query.filter(|q| !q.trim().is_empty()) {
                        query_text = refined;
                    } else {
                        break;
                    }
                }
                AgentDecision::ExpandSearch => {
                    top_k = (top_k * 2).min(max_top_k);
                    document_filter = None;
                }
                AgentDecision::Proceed => unreachable!("handled above"),
            }
        }

        let generation_started = Instant::now();
        let document_names = self.document_names(&last_context).await?;
        let generated = self.answer_generator.generate(&job.query_text, &last_context, &document_names).await?;
        timing.generation_ms = generation_started.elapsed().as_millis() as u64;

        Ok(generated)
    }

    async fn document_names(&self, context: &[Candidate]) -> Result<HashMap<Uuid, String>, RagError> {
        let mut names = HashMap::new();
        for candidate in context {
            if names.contains_key(&candidate.doc_id) {
                continue;
            }
            if let Some(document) = self.meta_store.get_document(candidate.doc_id).await? {
                names.insert(candidate.doc_id, document.filename);
            }
        }
        Ok(names)
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        s.chars().take(max_len).collect()
    }
}

fn to_chunk_results(candidates: &[Candidate], after_rerank: bool) -> Vec<ChunkResult> {
    candidates
        .iter()
        .map(|c| ChunkResult {
            id: c.chunk_id,
            score: c.score,
            source: c.source.to_string(),
            section: c.hierarchy_path.last().cloned().unwrap_or_default(),
            preview: c.content.chars().take(160).collect(),
            score_change: after_rerank.then_some(c.score_change),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Chunk, ChunkMetadata, ChunkVariant, Collection, Document, VectorRecord};
    use crate::ports::{Chat, ChatRequest, FakeChat, FakeEmbedder, FakeMetaStore, FakeVectorIndex};
    use async_trait::async_trait;
    use chrono::Utc;

    struct EmbedderAdapter(Arc<FakeEmbedder>);

    #[async_trait]
    impl Embedder for EmbedderAdapter {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
            self.0.embed(texts).await
        }
    }

    async fn seed_chunk(index: &Arc<FakeVectorIndex>, doc_id: Uuid, content: &str, embedder: &FakeEmbedder) {
        let chunk_id = Uuid::new_v4();
        let embedding = embedder.embed_one(content);
        let record = VectorRecord {
            chunk_id,
            doc_id,
            embedding,
            payload: Chunk {
                chunk_id,
                doc_id,
                variant: ChunkVariant::TextChunk,
                content: content.to_string(),
                hierarchy_path: vec!["Intro".to_string()],
                page_number: None,
                language: "en".into(),
                is_multilingual: false,
                languages: vec!["en".into()],
                language_distribution: HashMap::new(),
                metadata: ChunkMetadata::default(),
            },
        };
        index.upsert(Collection::DocumentsChunks, vec![record]).await.unwrap();
    }

    #[tokio::test]
    async fn answer_persists_query_result_with_citations() {
        let embedder = Arc::new(FakeEmbedder::default());
        let vector_index = Arc::new(FakeVectorIndex::new());
        let doc_id = Uuid::new_v4();
        seed_chunk(&vector_index, doc_id, "The sky appears blue due to Rayleigh scattering.", &embedder).await;

        let meta_store = Arc::new(FakeMetaStore::new());
        meta_store.put_document(Document::new(doc_id, "sky.txt", "blob/sky", "text/plain", 10, Utc::now())).await.unwrap();

        let chat = Arc::new(FakeChat::new());
        chat.push_response(r#"{"decision":"proceed","confidence":0.9,"reasoning":"enough context"}"#);
        chat.push_response("The sky is blue because of Rayleigh scattering [1].");

        let retriever = HybridRetriever::new(vector_index.clone());
        let reranker = Reranker::new(chat.clone());
        let evaluator = AgentEvaluator::new(chat.clone());
        let answer_generator = AnswerGenerator::new(chat.clone());
        let settings_loader = Arc::new(SettingsLoader::new());

        let orchestrator = QueryOrchestrator::new(
            Arc::new(EmbedderAdapter(embedder)),
            retriever,
            reranker,
            evaluator,
            answer_generator,
            meta_store.clone(),
            settings_loader,
        );

        let job = QueryJob { query_id: Uuid::new_v4(), query_text: "why is the sky blue".into(), debug_mode: true, document_filter: None, correlation_id: "corr".into() };
        let result = orchestrator.answer(&job).await.unwrap();

        assert_eq!(result.iteration_count, 1);
        assert!(result.answer.is_some());
        assert_eq!(result.citations.len(), 1);
        assert!(result.debug_data.is_some());
        assert_eq!(meta_store.query_results().len(), 1);
    }

    #[test]
    fn chat_trait_object_is_object_safe() {
        fn assert_dyn(_: &dyn Chat) {}
        let chat = FakeChat::new();
        assert_dyn(&chat);
        let _ = ChatRequest { system: String::new(), user: String::new(), max_tokens: 0, temperature: 0.0, json_mode: false };
    }
}
