//! Hybrid dense+lexical search across the three collections, fused by
//! Reciprocal Rank Fusion.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use tracing::instrument;
use uuid::Uuid;

use crate::error::RagError;
use crate::model::{Collection, SearchSourceCounts};
use crate::ports::VectorIndex;
use crate::retrieval::Candidate;

const COLLECTIONS: [Collection; 3] = [Collection::DocumentsChunks, Collection::DocumentsQa, Collection::DocumentsSummaries];

fn collection_priority(collection: Collection) -> u8 {
    match collection {
        Collection::DocumentsChunks => 0,
        Collection::DocumentsQa => 1,
        Collection::DocumentsSummaries => 2,
    }
}

fn collection_label(collection: Collection) -> &'static str {
    match collection {
        Collection::DocumentsChunks => "vector_chunks",
        Collection::DocumentsSummaries => "vector_summaries",
        Collection::DocumentsQa => "vector_qa",
    }
}

struct FusedEntry {
    score: f64,
    collection: Collection,
    doc_id: Uuid,
}

/// Performs dense + lexical search per collection and fuses the six ranked
/// lists with Reciprocal Rank Fusion.
pub struct HybridRetriever {
    index: Arc<dyn VectorIndex>,
}

impl HybridRetriever {
    pub fn new(index: Arc<dyn VectorIndex>) -> Self {
        Self { index }
    }

    #[instrument(skip(self, query_embedding, document_filter), fields(top_k))]
    pub async fn search(
        &self,
        query_text: &str,
        query_embedding: &[f32],
        top_k: usize,
        rrf_k: f64,
        document_filter: Option<&[Uuid]>,
    ) -> Result<(Vec<Candidate>, SearchSourceCounts), RagError> {
        let mut counts = SearchSourceCounts::default();
        let mut fused: HashMap<Uuid, FusedEntry> = HashMap::new();

        let dense_futures = COLLECTIONS.iter().map(|&collection| self.index.dense_search(collection, query_embedding, top_k, document_filter));
        let lexical_futures = COLLECTIONS.iter().map(|&collection| self.index.lexical_search(collection, query_text, top_k, document_filter));

        let (dense_results, lexical_results) = futures_util::future::join(join_all(dense_futures), join_all(lexical_futures)).await;

        for (collection, result) in COLLECTIONS.iter().zip(dense_results) {
            let hits = result?;
            match *collection {
                Collection::DocumentsChunks => counts.vector_chunks = hits.len(),
                Collection::DocumentsSummaries => counts.vector_summaries = hits.len(),
                Collection::DocumentsQa => counts.vector_qa = hits.len(),
            }
            accumulate(&mut fused, *collection, &hits, rrf_k);
        }

        for (collection, result) in COLLECTIONS.iter().zip(lexical_results) {
            let hits = result?;
            counts.keyword_bm25 += hits.len();
            accumulate(&mut fused, *collection, &hits, rrf_k);
        }

        counts.after_merge = fused.len();

        let mut ordered: Vec<(Uuid, FusedEntry)> = fused.into_iter().collect();
        ordered.sort_by(|(id_a, a), (id_b, b)| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| collection_priority(a.collection).cmp(&collection_priority(b.collection)))
                .then_with(|| a.doc_id.cmp(&b.doc_id))
                .then_with(|| id_a.cmp(id_b))
        });
        ordered.truncate(top_k);

        let mut candidates = Vec::with_capacity(ordered.len());
        for (chunk_id, entry) in ordered {
            if let Some(record) = self.index.get_records(entry.collection, &[chunk_id]).await?.into_iter().next() {
                candidates.push(Candidate {
                    chunk_id,
                    doc_id: record.doc_id,
                    content: record.payload.content,
                    hierarchy_path: record.payload.hierarchy_path,
                    page_number: record.payload.page_number,
                    source: collection_label(entry.collection),
                    fused_score: entry.score,
                    score: entry.score,
                    score_change: 0.0,
                });
            }
        }

        Ok((candidates, counts))
    }
}

fn accumulate(fused: &mut HashMap<Uuid, FusedEntry>, collection: Collection, hits: &[crate::ports::SearchHit], rrf_k: f64) {
    for (rank, hit) in hits.iter().enumerate() {
        let contribution = 1.0 / (rrf_k + (rank + 1) as f64);
        fused
            .entry(hit.chunk_id)
            .and_modify(|entry| entry.score += contribution)
            .or_insert(FusedEntry { score: contribution, collection, doc_id: hit.doc_id });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Chunk, ChunkMetadata, ChunkVariant, VectorRecord};
    use crate::ports::FakeVectorIndex;

    fn record(doc_id: Uuid, content: &str, embedding: Vec<f32>) -> VectorRecord {
        let chunk_id = Uuid::new_v4();
        VectorRecord {
            chunk_id,
            doc_id,
            embedding,
            payload: Chunk {
                chunk_id,
                doc_id,
                variant: ChunkVariant::TextChunk,
                content: content.to_string(),
                hierarchy_path: vec![],
                page_number: None,
                language: "en".into(),
                is_multilingual: false,
                languages: vec!["en".into()],
                language_distribution: HashMap::new(),
                metadata: ChunkMetadata::default(),
            },
        }
    }

    #[tokio::test]
    async fn search_dedupes_and_orders_by_fused_score() {
        let index = Arc::new(FakeVectorIndex::new());
        let doc_id = Uuid::new_v4();
        let a = record(doc_id, "the quick brown fox", vec![1.0, 0.0, 0.0]);
        let b = record(doc_id, "a completely unrelated sentence", vec![0.0, 1.0, 0.0]);
        index.upsert(Collection::DocumentsChunks, vec![a.clone(), b.clone()]).await.unwrap();

        let retriever = HybridRetriever::new(index);
        let (candidates, counts) = retriever.search("quick brown fox", &[1.0, 0.0, 0.0], 10, 60.0, None).await.unwrap();

        assert!(!candidates.is_empty());
        assert_eq!(candidates[0].chunk_id, a.chunk_id);
        assert!(counts.after_merge >= candidates.len());
    }

    #[tokio::test]
    async fn search_respects_document_filter() {
        let index = Arc::new(FakeVectorIndex::new());
        let doc_a = Uuid::new_v4();
        let doc_b = Uuid::new_v4();
        let a = record(doc_a, "alpha content", vec![1.0, 0.0, 0.0]);
        let b = record(doc_b, "beta content", vec![1.0, 0.0, 0.0]);
        index.upsert(Collection::DocumentsChunks, vec![a.clone(), b.clone()]).await.unwrap();

        let retriever = HybridRetriever::new(index);
        let (candidates, _) = retriever.search("content", &[1.0, 0.0, 0.0], 10, 60.0, Some(&[doc_a])).await.unwrap();
        assert!(candidates.iter().all(|c| c.doc_id == doc_a));
    }
}
