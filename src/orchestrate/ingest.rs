//! Drives one document end-to-end through the eight ingestion stages,
//! keeping the Document row as the single source of truth for progress.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::chunk::Chunker;
use crate::config::SettingsLoader;
use crate::error::{RetryPolicy, RagError};
use crate::model::{Chunk, ChunkMetadata, ChunkVariant, Collection, Document, DocumentStatus, DocumentTree, IngestJob, QAPair, SummaryLevel, VectorRecord};
use crate::ports::{tag_or_default, BlobStore, DocumentExtractor, Embedder, LanguageTagger, MetaStore, VectorIndex, VisionDescriber};
use crate::summarize::{QAGenerator, Summarizer};
use crate::tree::TreeBuilder;

const DEFAULT_QA_COUNT: usize = 5;
const MAX_ERROR_MESSAGE_LEN: usize = 2000;

/// Bundles every capability the ingestion pipeline depends on.
pub struct IngestionOrchestrator {
    blob_store: Arc<dyn BlobStore>,
    extractor: Arc<dyn DocumentExtractor>,
    vision: Option<Arc<dyn VisionDescriber>>,
    embedder: Arc<dyn Embedder>,
    vector_index: Arc<dyn VectorIndex>,
    meta_store: Arc<dyn MetaStore>,
    language_tagger: Arc<dyn LanguageTagger>,
    summarizer: Summarizer,
    qa_generator: QAGenerator,
    chunker: Chunker,
    settings_loader: Arc<SettingsLoader>,
    blob_retry: RetryPolicy,
    retry_policy: RetryPolicy,
}

impl IngestionOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        blob_store: Arc<dyn BlobStore>,
        extractor: Arc<dyn DocumentExtractor>,
        vision: Option<Arc<dyn VisionDescriber>>,
        chat: Arc<dyn crate::ports::Chat>,
        embedder: Arc<dyn Embedder>,
        vector_index: Arc<dyn VectorIndex>,
        meta_store: Arc<dyn MetaStore>,
        language_tagger: Arc<dyn LanguageTagger>,
        settings_loader: Arc<SettingsLoader>,
    ) -> Self {
        Self {
            blob_store,
            extractor,
            vision,
            embedder,
            vector_index,
            meta_store,
            language_tagger: language_tagger.clone(),
            summarizer: Summarizer::new(chat.clone()),
            qa_generator: QAGenerator::new(chat),
            chunker: Chunker::new(language_tagger),
            settings_loader,
            blob_retry: RetryPolicy::default(),
            retry_policy: RetryPolicy::default(),
        }
    }

    #[instrument(skip(self, job), fields(document_id = %job.document_id, correlation_id = %job.correlation_id))]
    pub async fn ingest(&self, job: &IngestJob) -> Result<(), RagError> {
        let mut document = self
            .meta_store
            .get_document(job.document_id)
            .await?
            .ok_or_else(|| RagError::ConfigurationError(format!("no document row for {}", job.document_id)))?;

        self.transition(&mut document, DocumentStatus::Processing).await?;
        document.processing_started_at = Some(Utc::now());
        self.meta_store.put_document(document.clone()).await?;

        match self.run_stages(job, &document).await {
            Ok(outcome) => {
                document.status = DocumentStatus::Completed;
                document.processing_completed_at = Some(Utc::now());
                document.processing_time_seconds = elapsed_seconds(&document);
                document.chunk_count = outcome.chunk_count as u64;
                document.vector_count = outcome.vector_count as u64;
                document.qa_pairs_count = outcome.qa_pairs_count as u64;
                document.detected_languages = outcome.detected_languages;
                document.primary_language = outcome.primary_language;
                document.summary = Some(outcome.document_summary);
                self.meta_store.put_document(document).await?;
                info!(chunk_count = outcome.chunk_count, vector_count = outcome.vector_count, "ingestion completed");
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "ingestion stage failed, marking document failed");
                document.status = DocumentStatus::Failed;
                document.processing_completed_at = Some(Utc::now());
                document.processing_time_seconds = elapsed_seconds(&document);
                document.error_message = Some(truncate(&err.to_string(), MAX_ERROR_MESSAGE_LEN));
                self.meta_store.put_document(document).await?;
                Err(err)
            }
        }
    }

    async fn transition(&self, document: &mut Document, next: DocumentStatus) -> Result<(), RagError> {
        if !document.status.can_transition_to(next) {
            return Err(RagError::ConfigurationError(format!("illegal status transition {:?} -> {:?}", document.status, next)));
        }
        document.status = next;
        Ok(())
    }

    async fn run_stages(&self, job: &IngestJob, document: &Document) -> Result<IngestOutcome, RagError> {
        let settings = self.settings_loader.resolve();

        let bytes = self.fetch_blob(&job.blob_key).await?;
        let extracted = self.extract(&bytes, &document.mime_type).await?;
        let image_captions = self.describe_images(&extracted).await?;
        let tree = self.build_tree(&extracted, &image_captions);

        let summaries = self.summarize(&tree, &settings).await?;
        let qa_pairs = self.generate_qa(&tree, &settings).await?;
        let mut chunks = self.chunk(&tree, document.id, &settings).await?;
        self.attach_summary_and_qa_chunks(&mut chunks, document.id, &summaries, &qa_pairs).await?;

        let (vector_count, detected_languages, primary_language) = self.embed_and_store(document.id, &chunks).await?;

        Ok(IngestOutcome {
            chunk_count: chunks.len(),
            vector_count,
            qa_pairs_count: qa_pairs.len(),
            detected_languages,
            primary_language,
            document_summary: summaries.document_summary,
        })
    }

    #[instrument(skip(self, blob_key))]
    async fn fetch_blob(&self, blob_key: &str) -> Result<Vec<u8>, RagError> {
        let blob_store = self.blob_store.clone();
        let key = blob_key.to_string();
        let bytes = self.blob_retry.run(|| {
            let blob_store = blob_store.clone();
            let key = key.clone();
            async move { blob_store.get(&key).await }
        }).await?;
        info!(bytes = bytes.len(), "fetched blob");
        Ok(bytes)
    }

    #[instrument(skip(self, bytes))]
    async fn extract(&self, bytes: &[u8], mime: &str) -> Result<crate::ports::ExtractedDocument, RagError> {
        let extracted = self.extractor.extract(bytes, mime).await?;
        info!(blocks = extracted.blocks.len(), image_regions = extracted.image_regions.len(), "extracted structure");
        Ok(extracted)
    }

    #[instrument(skip(self, extracted))]
    async fn describe_images(&self, extracted: &crate::ports::ExtractedDocument) -> Result<HashMap<usize, String>, RagError> {
        let mut captions = HashMap::new();
        let Some(vision) = &self.vision else {
            return Ok(captions);
        };
        for region in &extracted.image_regions {
            let caption = vision.describe(&region.bytes).await?;
            captions.insert(region.order, caption);
        }
        info!(described = captions.len(), "described images");
        Ok(captions)
    }

    #[instrument(skip(self, extracted, image_captions))]
    fn build_tree(&self, extracted: &crate::ports::ExtractedDocument, image_captions: &HashMap<usize, String>) -> DocumentTree {
        let tree = TreeBuilder::new().build(extracted, image_captions);
        info!(nodes = tree.len(), "built document tree");
        tree
    }

    #[instrument(skip(self, tree, settings))]
    async fn summarize(&self, tree: &DocumentTree, settings: &crate::config::Settings) -> Result<crate::model::DocumentSummaries, RagError> {
        let summaries = self.summarizer.summarize(tree, settings).await?;
        info!(method = ?summaries.method, sections = summaries.sections_count, "summarized document");
        Ok(summaries)
    }

    #[instrument(skip(self, tree, settings))]
    async fn generate_qa(&self, tree: &DocumentTree, settings: &crate::config::Settings) -> Result<Vec<QAPair>, RagError> {
        let pairs = self.qa_generator.generate(tree, DEFAULT_QA_COUNT, settings).await?;
        info!(pairs = pairs.len(), "generated qa pairs");
        Ok(pairs)
    }

    #[instrument(skip(self, tree, settings))]
    async fn chunk(&self, tree: &DocumentTree, doc_id: Uuid, settings: &crate::config::Settings) -> Result<Vec<Chunk>, RagError> {
        let chunks = self.chunker.chunk(tree, doc_id, settings).await?;
        info!(chunks = chunks.len(), "chunked document");
        Ok(chunks)
    }

    async fn attach_summary_and_qa_chunks(&self, chunks: &mut Vec<Chunk>, doc_id: Uuid, summaries: &crate::model::DocumentSummaries, qa_pairs: &[QAPair]) -> Result<(), RagError> {
        let document_analysis = tag_or_default(self.language_tagger.as_ref(), &summaries.document_summary).await?;
        chunks.push(Chunk {
            chunk_id: Uuid::new_v4(),
            doc_id,
            variant: ChunkVariant::Summary,
            content: summaries.document_summary.clone(),
            hierarchy_path: Vec::new(),
            page_number: None,
            language: document_analysis.primary_language,
            is_multilingual: document_analysis.is_multilingual,
            languages: document_analysis.languages,
            language_distribution: document_analysis.distribution,
            metadata: ChunkMetadata { level: Some(SummaryLevel::Document), ..Default::default() },
        });

        for section in &summaries.section_summaries {
            let analysis = tag_or_default(self.language_tagger.as_ref(), &section.summary_text).await?;
            chunks.push(Chunk {
                chunk_id: Uuid::new_v4(),
                doc_id,
                variant: ChunkVariant::Summary,
                content: section.summary_text.clone(),
                hierarchy_path: vec![section.title.clone()],
                page_number: None,
                language: analysis.primary_language,
                is_multilingual: analysis.is_multilingual,
                languages: analysis.languages,
                language_distribution: analysis.distribution,
                metadata: ChunkMetadata { level: Some(SummaryLevel::Section), ..Default::default() },
            });
        }

        for pair in qa_pairs {
            let content = format!("Q: {}\nA: {}", pair.question, pair.answer);
            let analysis = tag_or_default(self.language_tagger.as_ref(), &content).await?;
            chunks.push(Chunk {
                chunk_id: Uuid::new_v4(),
                doc_id,
                variant: ChunkVariant::Qa,
                content,
                hierarchy_path: Vec::new(),
                page_number: None,
                language: analysis.primary_language,
                is_multilingual: analysis.is_multilingual,
                languages: analysis.languages,
                language_distribution: analysis.distribution,
                metadata: ChunkMetadata { question: Some(pair.question.clone()), answer: Some(pair.answer.clone()), question_type: Some(pair.qa_type), ..Default::default() },
            });
        }
        Ok(())
    }

    /// Embeds every chunk's content and replaces the document's prior
    /// vector records atomically: delete-by-doc across all three
    /// collections before the new upserts begin, so readers never observe
    /// a mix of old and new records.
    #[instrument(skip(self, chunks))]
    async fn embed_and_store(&self, doc_id: Uuid, chunks: &[Chunk]) -> Result<(usize, Vec<String>, Option<String>), RagError> {
        if chunks.is_empty() {
            return Ok((0, Vec::new(), None));
        }

        let contents: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let embeddings = self
            .retry_policy
            .run(|| {
                let embedder = self.embedder.clone();
                let contents = contents.clone();
                async move { embedder.embed(&contents).await }
            })
            .await?;
        if embeddings.len() != chunks.len() {
            return Err(RagError::StoragePostcondition { expected: chunks.len(), actual: embeddings.len() });
        }

        for collection in [Collection::DocumentsChunks, Collection::DocumentsSummaries, Collection::DocumentsQa] {
            self.retry_policy
                .run(|| {
                    let vector_index = self.vector_index.clone();
                    async move { vector_index.delete_by_doc(collection, doc_id).await }
                })
                .await?;
        }

        let mut by_collection: HashMap<Collection, Vec<VectorRecord>> = HashMap::new();
        let mut languages = std::collections::HashSet::new();
        for (chunk, embedding) in chunks.iter().zip(embeddings) {
            languages.insert(chunk.language.clone());
            let record = VectorRecord { chunk_id: chunk.chunk_id, doc_id, embedding, payload: chunk.clone() };
            by_collection.entry(chunk.collection()).or_default().push(record);
        }

        let mut total = 0usize;
        for (collection, records) in by_collection {
            total += records.len();
            self.retry_policy
                .run(|| {
                    let vector_index = self.vector_index.clone();
                    let records = records.clone();
                    async move { vector_index.upsert(collection, records).await }
                })
                .await?;
        }

        if total != chunks.len() {
            warn!(expected = chunks.len(), actual = total, "vector upsert count mismatch");
            return Err(RagError::StoragePostcondition { expected: chunks.len(), actual: total });
        }

        let primary_language = chunks.first().map(|c| c.language.clone());
        Ok((total, languages.into_iter().collect(), primary_language))
    }
}

struct IngestOutcome {
    chunk_count: usize,
    vector_count: usize,
    qa_pairs_count: usize,
    detected_languages: Vec<String>,
    primary_language: Option<String>,
    document_summary: String,
}

fn elapsed_seconds(document: &Document) -> Option<f64> {
    let started = document.processing_started_at?;
    let completed = document.processing_completed_at.unwrap_or_else(Utc::now);
    Some((completed - started).num_milliseconds() as f64 / 1000.0)
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        s.chars().take(max_len).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SettingsLoader;
    use crate::ports::{FakeBlobStore, FakeChat, FakeEmbedder, FakeLanguageTagger, FakeMetaStore, FakeVectorIndex};
    use async_trait::async_trait;

    struct StubExtractor;

    #[async_trait]
    impl DocumentExtractor for StubExtractor {
        async fn extract(&self, bytes: &[u8], _mime: &str) -> Result<crate::ports::ExtractedDocument, RagError> {
            let text = String::from_utf8_lossy(bytes).to_string();
            Ok(crate::ports::ExtractedDocument {
                blocks: vec![
                    crate::ports::ExtractedBlock { role: crate::ports::BlockRole::Heading, depth: 1, page_number: None, text: "Intro".into(), order: 0 },
                    crate::ports::ExtractedBlock { role: crate::ports::BlockRole::Paragraph, depth: 0, page_number: None, text, order: 1 },
                ],
                image_regions: vec![],
            })
        }
    }

    struct EmbedderAdapter(Arc<FakeEmbedder>);

    #[async_trait]
    impl Embedder for EmbedderAdapter {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
            self.0.embed(texts).await
        }
    }

    #[tokio::test]
    async fn ingest_marks_document_completed_and_stores_vectors() {
        let blob_store = Arc::new(FakeBlobStore::new());
        blob_store.put("blob/1", b"hello world, this is a test document".to_vec());
        let chat = Arc::new(FakeChat::new());
        chat.push_response("a document summary");
        chat.push_response(r#"{"qa_pairs":[{"question":"What is this?","answer":"A test document.","type":"factual"}]}"#);

        let vector_index = Arc::new(FakeVectorIndex::new());
        let meta_store = Arc::new(FakeMetaStore::new());
        let language_tagger = Arc::new(FakeLanguageTagger::new());
        let settings_loader = Arc::new(SettingsLoader::new());

        let doc_id = Uuid::new_v4();
        let document = Document::new(doc_id, "test.txt", "blob/1", "text/plain", 42, Utc::now());
        meta_store.put_document(document).await.unwrap();

        let orchestrator = IngestionOrchestrator::new(
            blob_store,
            Arc::new(StubExtractor),
            None,
            chat,
            Arc::new(EmbedderAdapter(Arc::new(FakeEmbedder::default()))),
            vector_index.clone(),
            meta_store.clone(),
            language_tagger,
            settings_loader,
        );

        let job = IngestJob { document_id: doc_id, blob_key: "blob/1".into(), correlation_id: "corr-1".into(), enqueued_at: Utc::now() };
        orchestrator.ingest(&job).await.unwrap();

        let stored = meta_store.get_document(doc_id).await.unwrap().unwrap();
        assert_eq!(stored.status, DocumentStatus::Completed);
        assert!(stored.chunk_count > 0);
        assert_eq!(stored.qa_pairs_count, 1);
        assert!(vector_index.count(Collection::DocumentsChunks) > 0);
        assert_eq!(vector_index.count(Collection::DocumentsQa), 1);
    }

    #[tokio::test]
    async fn ingest_marks_document_failed_on_missing_blob() {
        let blob_store = Arc::new(FakeBlobStore::new());
        let chat = Arc::new(FakeChat::new());
        let vector_index = Arc::new(FakeVectorIndex::new());
        let meta_store = Arc::new(FakeMetaStore::new());
        let language_tagger = Arc::new(FakeLanguageTagger::new());
        let settings_loader = Arc::new(SettingsLoader::new());

        let doc_id = Uuid::new_v4();
        let document = Document::new(doc_id, "test.txt", "blob/missing", "text/plain", 42, Utc::now());
        meta_store.put_document(document).await.unwrap();

        let orchestrator = IngestionOrchestrator::new(
            blob_store,
            Arc::new(StubExtractor),
            None,
            chat,
            Arc::new(EmbedderAdapter(Arc::new(FakeEmbedder::default()))),
            vector_index,
            meta_store.clone(),
            language_tagger,
            settings_loader,
        );

        let job = IngestJob { document_id: doc_id, blob_key: "blob/missing".into(), correlation_id: "corr-2".into(), enqueued_at: Utc::now() };
        assert!(orchestrator.ingest(&job).await.is_err());

        let stored = meta_store.get_document(doc_id).await.unwrap().unwrap();
        assert_eq!(stored.status, DocumentStatus::Failed);
        assert!(stored.error_message.is_some());
    }
}
