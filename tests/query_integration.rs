//! End-to-end query runs against in-memory fake ports.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use docsmith_core::config::SettingsLoader;
use docsmith_core::error::RagError;
use docsmith_core::model::{Chunk, ChunkMetadata, ChunkVariant, Collection, Document, QueryJob, VectorRecord};
use docsmith_core::orchestrate::QueryOrchestrator;
use docsmith_core::ports::{Embedder, FakeChat, FakeEmbedder, FakeMetaStore, FakeVectorIndex, VectorIndex};
use docsmith_core::retrieval::{AgentEvaluator, AnswerGenerator, HybridRetriever, Reranker};
use uuid::Uuid;

struct EmbedderAdapter(Arc<FakeEmbedder>);

#[async_trait]
impl Embedder for EmbedderAdapter {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        self.0.embed(texts).await
    }
}

struct FailingEmbedder;

#[async_trait]
impl Embedder for FailingEmbedder {
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        Err(RagError::TransientExternal { port: "embedder", detail: "simulated outage".into() })
    }
}

async fn seed_chunk(index: &FakeVectorIndex, doc_id: Uuid, content: &str, embedder: &FakeEmbedder) -> Uuid {
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
            hierarchy_path: vec!["Overview".to_string()],
            page_number: None,
            language: "en".into(),
            is_multilingual: false,
            languages: vec!["en".into()],
            language_distribution: HashMap::new(),
            metadata: ChunkMetadata::default(),
        },
    };
    index.upsert(Collection::DocumentsChunks, vec![record]).await.unwrap();
    chunk_id
}

#[tokio::test]
async fn single_iteration_query_proceeds_with_citation() {
    let embedder = Arc::new(FakeEmbedder::default());
    let vector_index = Arc::new(FakeVectorIndex::new());
    let doc_id = Uuid::new_v4();
    seed_chunk(&vector_index, doc_id, "The capital of France is Paris.", &embedder).await;

    let meta_store = Arc::new(FakeMetaStore::new());
    meta_store.put_document(Document::new(doc_id, "geo.txt", "blob/geo", "text/plain", 20, Utc::now())).await.unwrap();

    let chat = Arc::new(FakeChat::new());
    chat.push_response(r#"{"decision":"proceed","confidence":0.95,"reasoning":"context is sufficient"}"#);
    chat.push_response("The capital of France is Paris [1].");

    let orchestrator = QueryOrchestrator::new(
        Arc::new(EmbedderAdapter(embedder)),
        HybridRetriever::new(vector_index.clone()),
        Reranker::new(chat.clone()),
        AgentEvaluator::new(chat.clone()),
        AnswerGenerator::new(chat.clone()),
        meta_store.clone(),
        Arc::new(SettingsLoader::new()),
    );

    let job = QueryJob { query_id: Uuid::new_v4(), query_text: "what is the capital of france".into(), debug_mode: true, document_filter: None, correlation_id: "q1".into() };
    let result = orchestrator.answer(&job).await.unwrap();

    assert_eq!(result.iteration_count, 1);
    assert!(result.answer.as_deref().unwrap().contains("Paris"));
    assert_eq!(result.citations.len(), 1);
    assert_eq!(result.citations[0].document_name, "geo.txt");
    let debug = result.debug_data.unwrap();
    assert_eq!(debug.iterations.len(), 1);
    assert!(debug.iterations[0].search_sources.after_merge >= 1);
}

#[tokio::test]
async fn refine_query_decision_drives_second_iteration() {
    let embedder = Arc::new(FakeEmbedder::default());
    let vector_index = Arc::new(FakeVectorIndex::new());
    let doc_id = Uuid::new_v4();
    seed_chunk(&vector_index, doc_id, "Quarterly revenue grew eight percent year over year.", &embedder).await;

    let meta_store = Arc::new(FakeMetaStore::new());
    meta_store.put_document(Document::new(doc_id, "finance.txt", "blob/fin", "text/plain", 20, Utc::now())).await.unwrap();

    let chat = Arc::new(FakeChat::new());
    chat.push_response(r#"{"decision":"refine_query","confidence":0.3,"reasoning":"too vague","refined_query":"quarterly revenue growth percentage"}"#);
    chat.push_response(r#"{"decision":"proceed","confidence":0.9,"reasoning":"now specific enough"}"#);
    chat.push_response("Revenue grew eight percent year over year [1].");

    let orchestrator = QueryOrchestrator::new(
        Arc::new(EmbedderAdapter(embedder)),
        HybridRetriever::new(vector_index.clone()),
        Reranker::new(chat.clone()),
        AgentEvaluator::new(chat.clone()),
        AnswerGenerator::new(chat.clone()),
        meta_store.clone(),
        Arc::new(SettingsLoader::new()),
    );

    let job = QueryJob { query_id: Uuid::new_v4(), query_text: "what is the strategy".into(), debug_mode: true, document_filter: None, correlation_id: "q2".into() };
    let result = orchestrator.answer(&job).await.unwrap();

    assert_eq!(result.iteration_count, 2);
    let debug = result.debug_data.unwrap();
    assert_eq!(debug.iterations[0].query_used, "what is the strategy");
    assert_eq!(debug.iterations[1].query_used, "quarterly revenue growth percentage");
    assert!(result.iteration_count <= 3);
}

#[tokio::test]
async fn query_never_exceeds_max_iterations_even_when_never_satisfied() {
    let embedder = Arc::new(FakeEmbedder::default());
    let vector_index = Arc::new(FakeVectorIndex::new());
    let doc_id = Uuid::new_v4();
    seed_chunk(&vector_index, doc_id, "Some weakly relevant passage.", &embedder).await;

    let meta_store = Arc::new(FakeMetaStore::new());
    meta_store.put_document(Document::new(doc_id, "weak.txt", "blob/weak", "text/plain", 20, Utc::now())).await.unwrap();

    let chat = Arc::new(FakeChat::new());
    for _ in 0..3 {
        chat.push_response(r#"{"decision":"expand_search","confidence":0.2,"reasoning":"still not enough"}"#);
    }
    chat.push_response("Best effort answer with weak grounding [1].");

    let orchestrator = QueryOrchestrator::new(
        Arc::new(EmbedderAdapter(embedder)),
        HybridRetriever::new(vector_index.clone()),
        Reranker::new(chat.clone()),
        AgentEvaluator::new(chat.clone()),
        AnswerGenerator::new(chat.clone()),
        meta_store.clone(),
        Arc::new(SettingsLoader::new()),
    );

    let job = QueryJob { query_id: Uuid::new_v4(), query_text: "obscure question".into(), debug_mode: true, document_filter: None, correlation_id: "q3".into() };
    let result = orchestrator.answer(&job).await.unwrap();

    assert!(result.iteration_count <= 3);
    assert_eq!(result.iteration_count as usize, result.debug_data.as_ref().unwrap().iterations.len());
}

#[tokio::test]
async fn failing_embedder_persists_degraded_result_and_propagates_error() {
    let vector_index = Arc::new(FakeVectorIndex::new());
    let meta_store = Arc::new(FakeMetaStore::new());
    let chat = Arc::new(FakeChat::new());

    let orchestrator = QueryOrchestrator::new(
        Arc::new(FailingEmbedder),
        HybridRetriever::new(vector_index),
        Reranker::new(chat.clone()),
        AgentEvaluator::new(chat.clone()),
        AnswerGenerator::new(chat.clone()),
        meta_store.clone(),
        Arc::new(SettingsLoader::new()),
    );

    let job = QueryJob { query_id: Uuid::new_v4(), query_text: "anything".into(), debug_mode: true, document_filter: None, correlation_id: "q5".into() };
    let outcome = orchestrator.answer(&job).await;
    assert!(outcome.is_err());

    let persisted = meta_store.query_results();
    assert_eq!(persisted.len(), 1);
    let result = &persisted[0];
    assert_eq!(result.query_id, job.query_id);
    assert!(result.answer.is_none());
    assert_eq!(result.iteration_count, 0);
    assert!(result.error_message.is_some());
    assert!(result.debug_data.is_some());
}

#[tokio::test]
async fn non_debug_query_persists_without_debug_data() {
    let embedder = Arc::new(FakeEmbedder::default());
    let vector_index = Arc::new(FakeVectorIndex::new());
    let doc_id = Uuid::new_v4();
    seed_chunk(&vector_index, doc_id, "A fact about plants and photosynthesis.", &embedder).await;

    let meta_store = Arc::new(FakeMetaStore::new());
    meta_store.put_document(Document::new(doc_id, "bio.txt", "blob/bio", "text/plain", 20, Utc::now())).await.unwrap();

    let chat = Arc::new(FakeChat::new());
    chat.push_response(r#"{"decision":"proceed","confidence":0.9,"reasoning":"enough"}"#);
    chat.push_response("Plants convert sunlight into energy [1].");

    let orchestrator = QueryOrchestrator::new(
        Arc::new(EmbedderAdapter(embedder)),
        HybridRetriever::new(vector_index.clone()),
        Reranker::new(chat.clone()),
        AgentEvaluator::new(chat.clone()),
        AnswerGenerator::new(chat.clone()),
        meta_store.clone(),
        Arc::new(SettingsLoader::new()),
    );

    let job = QueryJob { query_id: Uuid::new_v4(), query_text: "how do plants make energy".into(), debug_mode: false, document_filter: None, correlation_id: "q4".into() };
    let result = orchestrator.answer(&job).await.unwrap();
    assert!(result.debug_data.is_none());
}
