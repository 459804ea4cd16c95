//! CapabilityPorts: narrow async interfaces to every external collaborator.
//! Implementations (HTTP clients, vector databases, message brokers) are
//! out of scope; this module also provides deterministic in-memory fakes
//! used by the test suite.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::RagError;
use crate::model::{Collection, Document, VectorRecord};

/// Raw extracted structure handed from `DocumentExtractor` to `TreeBuilder`.
#[derive(Debug, Clone)]
pub struct ExtractedBlock {
    pub role: BlockRole,
    pub depth: u32,
    pub page_number: Option<u32>,
    pub text: String,
    /// Reading-order position, used to interleave image regions correctly.
    pub order: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRole {
    Heading,
    Paragraph,
    Table,
}

#[derive(Debug, Clone)]
pub struct ImageRegion {
    pub order: usize,
    pub page_number: Option<u32>,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct ExtractedDocument {
    pub blocks: Vec<ExtractedBlock>,
    pub image_regions: Vec<ImageRegion>,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Vec<u8>, RagError>;
}

#[async_trait]
pub trait DocumentExtractor: Send + Sync {
    async fn extract(&self, bytes: &[u8], mime: &str) -> Result<ExtractedDocument, RagError>;
}

#[async_trait]
pub trait VisionDescriber: Send + Sync {
    async fn describe(&self, image_bytes: &[u8]) -> Result<String, RagError>;
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub system: String,
    pub user: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub json_mode: bool,
}

#[async_trait]
pub trait Chat: Send + Sync {
    async fn complete(&self, request: ChatRequest) -> Result<String, RagError>;
}

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError>;
}

/// A single hit returned from either the dense or lexical arm of a
/// collection search, ranked within that arm (1-based rank implied by index).
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub chunk_id: Uuid,
    pub doc_id: Uuid,
    pub score: f64,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert(&self, collection: Collection, records: Vec<VectorRecord>) -> Result<(), RagError>;
    async fn delete_by_doc(&self, collection: Collection, doc_id: Uuid) -> Result<(), RagError>;
    async fn dense_search(&self, collection: Collection, vector: &[f32], top_k: usize, filter: Option<&[Uuid]>) -> Result<Vec<SearchHit>, RagError>;
    async fn lexical_search(&self, collection: Collection, text: &str, top_k: usize, filter: Option<&[Uuid]>) -> Result<Vec<SearchHit>, RagError>;
    /// Fetches the stored payload for a set of chunk ids (used by the
    /// reranker/answer generator once fusion has picked winners).
    async fn get_records(&self, collection: Collection, chunk_ids: &[Uuid]) -> Result<Vec<VectorRecord>, RagError>;
}

#[async_trait]
pub trait MetaStore: Send + Sync {
    async fn get_document(&self, id: Uuid) -> Result<Option<Document>, RagError>;
    async fn put_document(&self, document: Document) -> Result<(), RagError>;
    async fn get_setting(&self, key: &str) -> Result<Option<String>, RagError>;
    async fn put_setting(&self, key: &str, value: &str) -> Result<(), RagError>;
    async fn put_query_result(&self, result: crate::model::QueryResult) -> Result<(), RagError>;
}

#[async_trait]
pub trait LanguageTagger: Send + Sync {
    async fn analyze(&self, text: &str) -> Result<LanguageAnalysis, RagError>;
}

#[derive(Debug, Clone)]
pub struct LanguageAnalysis {
    pub primary_language: String,
    pub is_multilingual: bool,
    pub languages: Vec<String>,
    pub distribution: HashMap<String, f64>,
}

/// Marker port for the durable-queue abstraction; the core never constructs
/// one directly (the Control Plane owns dispatch) but exposes the trait so
/// adapters have a contract to implement.
#[async_trait]
pub trait JobBus: Send + Sync {
    async fn ack_ingest(&self, document_id: Uuid) -> Result<(), RagError>;
    async fn ack_query(&self, query_id: Uuid) -> Result<(), RagError>;
}

// =======================================================================
// In-memory fakes for tests.
// =======================================================================

#[derive(Default)]
pub struct FakeBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl FakeBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: impl Into<String>, bytes: Vec<u8>) {
        self.blobs.write().insert(key.into(), bytes);
    }
}

#[async_trait]
impl BlobStore for FakeBlobStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, RagError> {
        self.blobs
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| RagError::InputRejected(format!("blob missing: {key}")))
    }
}

/// A scripted Chat fake: returns queued responses in order, falling back to
/// an echo of the user prompt once the queue is exhausted.
pub struct FakeChat {
    responses: RwLock<std::collections::VecDeque<String>>,
    calls: AtomicU64,
}

impl Default for FakeChat {
    fn default() -> Self {
        Self {
            responses: RwLock::new(std::collections::VecDeque::new()),
            calls: AtomicU64::new(0),
        }
    }
}

impl FakeChat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, response: impl Into<String>) {
        self.responses.write().push_back(response.into());
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Chat for FakeChat {
    async fn complete(&self, request: ChatRequest) -> Result<String, RagError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(resp) = self.responses.write().pop_front() {
            Ok(resp)
        } else {
            Ok(format!("summary of: {}", truncate(&request.user, 80)))
        }
    }
}

fn truncate(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}

/// A deterministic fake embedder: hashes each text into a small fixed-dim
/// vector so cosine similarity is stable across runs without a real model.
pub struct FakeEmbedder {
    pub dim: usize,
}

impl Default for FakeEmbedder {
    fn default() -> Self {
        Self { dim: 16 }
    }
}

impl FakeEmbedder {
    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0f32; self.dim];
        for (i, byte) in text.bytes().enumerate() {
            v[i % self.dim] += (byte as f32 + 1.0) * 0.01;
        }
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

#[derive(Default)]
struct CollectionStore {
    records: HashMap<Uuid, VectorRecord>,
}

/// An in-memory VectorIndex across the three collections, with brute-force
/// cosine dense search and naive substring-count lexical search.
#[derive(Default)]
pub struct FakeVectorIndex {
    chunks: RwLock<CollectionStore>,
    summaries: RwLock<CollectionStore>,
    qa: RwLock<CollectionStore>,
}

impl FakeVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self, collection: Collection) -> &RwLock<CollectionStore> {
        match collection {
            Collection::DocumentsChunks => &self.chunks,
            Collection::DocumentsSummaries => &self.summaries,
            Collection::DocumentsQa => &self.qa,
        }
    }

    pub fn count(&self, collection: Collection) -> usize {
        self.store(collection).read().records.len()
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f64 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        (dot / (na * nb)) as f64
    }
}

fn lexical_score(text: &str, query: &str) -> f64 {
    let text_lower = text.to_lowercase();
    let mut score = 0.0;
    for term in query.to_lowercase().split_whitespace() {
        if term.len() < 2 {
            continue;
        }
        score += text_lower.matches(term).count() as f64;
    }
    score
}

#[async_trait]
impl VectorIndex for FakeVectorIndex {
    async fn upsert(&self, collection: Collection, records: Vec<VectorRecord>) -> Result<(), RagError> {
        let mut store = self.store(collection).write();
        for record in records {
            store.records.insert(record.chunk_id, record);
        }
        Ok(())
    }

    async fn delete_by_doc(&self, collection: Collection, doc_id: Uuid) -> Result<(), RagError> {
        let mut store = self.store(collection).write();
        store.records.retain(|_, r| r.doc_id != doc_id);
        Ok(())
    }

    async fn dense_search(&self, collection: Collection, vector: &[f32], top_k: usize, filter: Option<&[Uuid]>) -> Result<Vec<SearchHit>, RagError> {
        let store = self.store(collection).read();
        let mut hits: Vec<SearchHit> = store
            .records
            .values()
            .filter(|r| filter.is_none_or(|docs| docs.contains(&r.doc_id)))
            .map(|r| SearchHit {
                chunk_id: r.chunk_id,
                doc_id: r.doc_id,
                score: cosine(vector, &r.embedding),
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn lexical_search(&self, collection: Collection, text: &str, top_k: usize, filter: Option<&[Uuid]>) -> Result<Vec<SearchHit>, RagError> {
        let store = self.store(collection).read();
        let mut hits: Vec<SearchHit> = store
            .records
            .values()
            .filter(|r| filter.is_none_or(|docs| docs.contains(&r.doc_id)))
            .map(|r| SearchHit {
                chunk_id: r.chunk_id,
                doc_id: r.doc_id,
                score: lexical_score(&r.payload.content, text),
            })
            .filter(|h| h.score > 0.0)
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn get_records(&self, collection: Collection, chunk_ids: &[Uuid]) -> Result<Vec<VectorRecord>, RagError> {
        let store = self.store(collection).read();
        Ok(chunk_ids.iter().filter_map(|id| store.records.get(id).cloned()).collect())
    }
}

/// Tags `text` via the given [`LanguageTagger`], short-circuiting to a
/// plain-English default below the tagger's one-word minimum input size.
pub async fn tag_or_default(tagger: &dyn LanguageTagger, text: &str) -> Result<LanguageAnalysis, RagError> {
    if text.split_whitespace().count() < 1 {
        return Ok(LanguageAnalysis {
            primary_language: "en".to_string(),
            is_multilingual: false,
            languages: vec!["en".to_string()],
            distribution: HashMap::new(),
        });
    }
    tagger.analyze(text).await
}

/// Looks a chunk id up across all three collections; used by components that
/// receive a bare `chunk_id` (e.g. the reranker) and need the full payload.
pub async fn find_record_anywhere(index: &dyn VectorIndex, chunk_id: Uuid) -> Option<VectorRecord> {
    for collection in [Collection::DocumentsChunks, Collection::DocumentsSummaries, Collection::DocumentsQa] {
        if let Ok(mut found) = index.get_records(collection, &[chunk_id]).await {
            if let Some(record) = found.pop() {
                return Some(record);
            }
        }
    }
    None
}

#[derive(Default)]
pub struct FakeMetaStore {
    documents: RwLock<HashMap<Uuid, Document>>,
    settings: RwLock<HashMap<String, String>>,
    query_results: RwLock<Vec<crate::model::QueryResult>>,
}

impl FakeMetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_setting(&self, key: impl Into<String>, value: impl Into<String>) {
        self.settings.write().insert(key.into(), value.into());
    }

    pub fn query_results(&self) -> Vec<crate::model::QueryResult> {
        self.query_results.read().clone()
    }
}

#[async_trait]
impl MetaStore for FakeMetaStore {
    async fn get_document(&self, id: Uuid) -> Result<Option<Document>, RagError> {
        Ok(self.documents.read().get(&id).cloned())
    }

    async fn put_document(&self, document: Document) -> Result<(), RagError> {
        self.documents.write().insert(document.id, document);
        Ok(())
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>, RagError> {
        Ok(self.settings.read().get(key).cloned())
    }

    async fn put_setting(&self, key: &str, value: &str) -> Result<(), RagError> {
        self.settings.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn put_query_result(&self, result: crate::model::QueryResult) -> Result<(), RagError> {
        self.query_results.write().push(result);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeLanguageTagger;

impl FakeLanguageTagger {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl LanguageTagger for FakeLanguageTagger {
    async fn analyze(&self, text: &str) -> Result<LanguageAnalysis, RagError> {
        // A coarse Hebrew/English split good enough for deterministic tests:
        // any character in the Hebrew Unicode block marks the text as
        // containing "he"; everything else is treated as "en".
        let total_chars = text.chars().filter(|c| c.is_alphabetic()).count().max(1) as f64;
        let he_chars = text.chars().filter(|c| ('\u{0590}'..='\u{05FF}').contains(c)).count() as f64;
        let en_chars = total_chars - he_chars;

        if he_chars == 0.0 {
            let mut distribution = HashMap::new();
            distribution.insert("en".to_string(), 1.0);
            return Ok(LanguageAnalysis {
                primary_language: "en".to_string(),
                is_multilingual: false,
                languages: vec!["en".to_string()],
                distribution,
            });
        }

        let mut distribution = HashMap::new();
        distribution.insert("en".to_string(), en_chars / total_chars);
        distribution.insert("he".to_string(), he_chars / total_chars);
        let primary = if en_chars >= he_chars { "en" } else { "he" };
        Ok(LanguageAnalysis {
            primary_language: primary.to_string(),
            is_multilingual: true,
            languages: vec!["he".to_string(), "en".to_string()],
            distribution,
        })
    }
}

#[derive(Default)]
pub struct FakeJobBus {
    acked_ingest: RwLock<Vec<Uuid>>,
    acked_query: RwLock<Vec<Uuid>>,
}

impl FakeJobBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acked_ingest_jobs(&self) -> Vec<Uuid> {
        self.acked_ingest.read().clone()
    }
}

#[async_trait]
impl JobBus for FakeJobBus {
    async fn ack_ingest(&self, document_id: Uuid) -> Result<(), RagError> {
        self.acked_ingest.write().push(document_id);
        Ok(())
    }

    async fn ack_query(&self, query_id: Uuid) -> Result<(), RagError> {
        self.acked_query.write().push(query_id);
        Ok(())
    }
}
