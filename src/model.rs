//! Core data model shared by ingestion and query pipelines.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle states of a [`Document`]. The lattice is
/// `Pending -> Processing -> {Completed | Failed}`; no other transitions
/// are valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl DocumentStatus {
    /// Whether `self -> next` is a legal transition in the lattice.
    pub fn can_transition_to(self, next: DocumentStatus) -> bool {
        matches!(
            (self, next),
            (DocumentStatus::Pending, DocumentStatus::Processing)
                | (DocumentStatus::Processing, DocumentStatus::Completed)
                | (DocumentStatus::Processing, DocumentStatus::Failed)
        )
    }
}

/// A document row as owned by the MetaStore; the IngestionOrchestrator is
/// the single writer of `status` and the derived counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub filename: String,
    pub blob_key: String,
    /// The canonical field name (not `file_type`).
    pub mime_type: String,
    pub file_size_bytes: u64,
    pub status: DocumentStatus,
    pub uploaded_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processing_completed_at: Option<DateTime<Utc>>,
    pub processing_time_seconds: Option<f64>,
    pub chunk_count: u64,
    pub vector_count: u64,
    pub qa_pairs_count: u64,
    pub detected_languages: Vec<String>,
    pub primary_language: Option<String>,
    pub summary: Option<String>,
    pub error_message: Option<String>,
}

impl Document {
    pub fn new(id: Uuid, filename: impl Into<String>, blob_key: impl Into<String>, mime_type: impl Into<String>, file_size_bytes: u64, uploaded_at: DateTime<Utc>) -> Self {
        Self {
            id,
            filename: filename.into(),
            blob_key: blob_key.into(),
            mime_type: mime_type.into(),
            file_size_bytes,
            status: DocumentStatus::Pending,
            uploaded_at,
            processing_started_at: None,
            processing_completed_at: None,
            processing_time_seconds: None,
            chunk_count: 0,
            vector_count: 0,
            qa_pairs_count: 0,
            detected_languages: Vec::new(),
            primary_language: None,
            summary: None,
            error_message: None,
        }
    }
}

// ---------------------------------------------------------------------
// DocumentTree: an arena of nodes, not a pointer-rich recursive structure.
// ---------------------------------------------------------------------

/// The kind of a [`TreeNode`], tagged so consumers can match without
/// downcasting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeKind {
    Document,
    Section { title: String, depth: u32, role: Option<String> },
    Paragraph,
    Table,
    ImageDescription,
    Heading { depth: u32 },
}

/// A single node in the arena-backed [`DocumentTree`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeNode {
    pub kind: NodeKind,
    pub content: String,
    pub hierarchy_path: Vec<String>,
    pub page_number: Option<u32>,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
}

impl TreeNode {
    fn leaf(kind: NodeKind, content: String, hierarchy_path: Vec<String>, page_number: Option<u32>, parent: Option<usize>) -> Self {
        Self {
            kind,
            content,
            hierarchy_path,
            page_number,
            parent,
            children: Vec::new(),
        }
    }
}

/// An ordered, rooted tree of [`TreeNode`]s stored as a flat arena indexed by
/// position. Index 0 is always the `document` root. Immutable once built.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentTree {
    nodes: Vec<TreeNode>,
}

impl DocumentTree {
    /// Creates a tree containing only the root `document` node.
    pub fn with_root() -> Self {
        Self {
            nodes: vec![TreeNode::leaf(NodeKind::Document, String::new(), Vec::new(), None, None)],
        }
    }

    pub const ROOT: usize = 0;

    pub fn nodes(&self) -> &[TreeNode] {
        &self.nodes
    }

    pub fn node(&self, idx: usize) -> &TreeNode {
        &self.nodes[idx]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        // The root is always present; "empty" means no content beyond it.
        self.nodes.len() <= 1
    }

    /// Appends a new child of `parent`, returning the new node's index.
    pub fn push_child(&mut self, parent: usize, kind: NodeKind, content: String, page_number: Option<u32>) -> usize {
        let hierarchy_path = self.child_hierarchy_path(parent);
        let idx = self.nodes.len();
        self.nodes.push(TreeNode::leaf(kind, content, hierarchy_path, page_number, Some(parent)));
        self.nodes[parent].children.push(idx);
        idx
    }

    /// The hierarchy_path a new child of `parent` should carry: the parent's
    /// own path, extended by the parent's title if the parent is a section.
    fn child_hierarchy_path(&self, parent: usize) -> Vec<String> {
        let parent_node = &self.nodes[parent];
        let mut path = parent_node.hierarchy_path.clone();
        if let NodeKind::Section { title, .. } = &parent_node.kind {
            path.push(title.clone());
        }
        path
    }

    /// Depth-first, document-order iterator over every node index except the root.
    pub fn iter_order(&self) -> impl Iterator<Item = usize> + '_ {
        let mut stack = self.nodes[Self::ROOT].children.clone();
        stack.reverse();
        std::iter::from_fn(move || {
            let idx = stack.pop()?;
            let mut children = self.nodes[idx].children.clone();
            children.reverse();
            stack.extend(children);
            Some(idx)
        })
    }

    /// Concatenates the `content` of every leaf (paragraph/table/image_description)
    /// node in document order, separated by blank lines.
    pub fn full_text(&self) -> String {
        let mut out = String::new();
        for idx in self.iter_order() {
            let node = &self.nodes[idx];
            if is_leaf_kind(&node.kind) && !node.content.is_empty() {
                if !out.is_empty() {
                    out.push_str("\n\n");
                }
                out.push_str(&node.content);
            }
        }
        out
    }

    /// Direct-child `section` nodes of the root, in document order.
    pub fn root_sections(&self) -> Vec<usize> {
        self.nodes[Self::ROOT]
            .children
            .iter()
            .copied()
            .filter(|&idx| matches!(self.nodes[idx].kind, NodeKind::Section { .. }))
            .collect()
    }

    /// The full textual content of a section subtree (its own leaves plus
    /// all descendant leaves), in document order.
    pub fn section_text(&self, section_idx: usize) -> String {
        let mut out = String::new();
        let mut stack = vec![section_idx];
        let mut ordered = Vec::new();
        // iterative pre-order collection, then filter to leaves
        while let Some(idx) = stack.pop() {
            ordered.push(idx);
            let mut children = self.nodes[idx].children.clone();
            children.reverse();
            stack.extend(children);
        }
        ordered.sort(); // document order == arena insertion order
        for idx in ordered {
            let node = &self.nodes[idx];
            if is_leaf_kind(&node.kind) && !node.content.is_empty() {
                if !out.is_empty() {
                    out.push_str("\n\n");
                }
                out.push_str(&node.content);
            }
        }
        out
    }

    pub fn section_title(&self, section_idx: usize) -> Option<&str> {
        match &self.nodes[section_idx].kind {
            NodeKind::Section { title, .. } => Some(title.as_str()),
            _ => None,
        }
    }
}

pub fn is_leaf_kind(kind: &NodeKind) -> bool {
    matches!(kind, NodeKind::Paragraph | NodeKind::Table | NodeKind::ImageDescription)
}

// ---------------------------------------------------------------------
// Summarization & Q&A
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionSummary {
    pub title: String,
    pub summary_text: String,
    pub original_length: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryMethod {
    Single,
    MapReduce,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentSummaries {
    pub document_summary: String,
    pub section_summaries: Vec<SectionSummary>,
    pub method: SummaryMethod,
    pub sections_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QAType {
    Factual,
    Overview,
    Procedural,
    Comparison,
    Reasoning,
}

impl QAType {
    /// Parses the allowed enum from a possibly-unknown string, coercing
    /// unrecognized values to `Factual`.
    pub fn parse_or_factual(s: &str) -> Self {
        match s {
            "factual" => QAType::Factual,
            "overview" => QAType::Overview,
            "procedural" => QAType::Procedural,
            "comparison" => QAType::Comparison,
            "reasoning" => QAType::Reasoning,
            _ => QAType::Factual,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QAPair {
    pub question: String,
    pub answer: String,
    #[serde(rename = "type")]
    pub qa_type: QAType,
}

// ---------------------------------------------------------------------
// Chunks
// ---------------------------------------------------------------------

/// How a chunk's token count was determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenCountMethod {
    Exact,
    Estimated,
}

/// The collection a chunk variant is persisted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    DocumentsChunks,
    DocumentsSummaries,
    DocumentsQa,
}

impl Collection {
    pub fn as_str(self) -> &'static str {
        match self {
            Collection::DocumentsChunks => "documents_chunks",
            Collection::DocumentsSummaries => "documents_summaries",
            Collection::DocumentsQa => "documents_qa",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryLevel {
    Document,
    Section,
}

/// Variant-specific metadata, matching the VectorIndex payload schema.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub token_count: Option<usize>,
    pub token_count_method: Option<TokenCountMethod>,
    pub level: Option<SummaryLevel>,
    pub question: Option<String>,
    pub answer: Option<String>,
    pub question_type: Option<QAType>,
    pub children: Vec<uuid::Uuid>,
}

/// A retrievable unit of content: a body-text slice, a summary, or a Q&A pair.
/// Modeled as a tagged envelope rather than an inheritance hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkVariant {
    TextChunk,
    Summary,
    Qa,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: Uuid,
    pub doc_id: Uuid,
    pub variant: ChunkVariant,
    pub content: String,
    pub hierarchy_path: Vec<String>,
    pub page_number: Option<u32>,
    pub language: String,
    pub is_multilingual: bool,
    pub languages: Vec<String>,
    pub language_distribution: HashMap<String, f64>,
    pub metadata: ChunkMetadata,
}

impl Chunk {
    pub fn collection(&self) -> Collection {
        match self.variant {
            ChunkVariant::TextChunk => Collection::DocumentsChunks,
            ChunkVariant::Summary => Collection::DocumentsSummaries,
            ChunkVariant::Qa => Collection::DocumentsQa,
        }
    }
}

/// A persisted vector: the embedding plus every Chunk field except the
/// embedding itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorRecord {
    pub chunk_id: Uuid,
    pub doc_id: Uuid,
    pub embedding: Vec<f32>,
    pub payload: Chunk,
}

// ---------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestJob {
    pub document_id: Uuid,
    pub blob_key: String,
    pub correlation_id: String,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryJob {
    pub query_id: Uuid,
    pub query_text: String,
    pub debug_mode: bool,
    pub document_filter: Option<Vec<Uuid>>,
    pub correlation_id: String,
}

// ---------------------------------------------------------------------
// Query results & debug data
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    pub document_id: Uuid,
    pub document_name: String,
    pub hierarchy_path: Vec<String>,
    pub page_number: Option<u32>,
    pub ordinal: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub query_id: Uuid,
    pub answer: Option<String>,
    pub citations: Vec<Citation>,
    pub confidence_score: f64,
    pub total_time_ms: u64,
    pub iteration_count: u32,
    pub debug_data: Option<DebugData>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchSourceCounts {
    pub vector_chunks: usize,
    pub vector_summaries: usize,
    pub vector_qa: usize,
    pub keyword_bm25: usize,
    pub after_merge: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkResult {
    pub id: Uuid,
    pub score: f64,
    pub source: String,
    pub section: String,
    pub preview: String,
    pub score_change: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentDecision {
    Proceed,
    RefineQuery,
    ExpandSearch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEvaluation {
    pub decision: AgentDecision,
    pub confidence: f64,
    pub reasoning: String,
    pub refined_query: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationDebug {
    pub iteration_number: u32,
    pub query_used: String,
    pub search_sources: SearchSourceCounts,
    pub chunks_before_rerank: Vec<ChunkResult>,
    pub chunks_after_rerank: Vec<ChunkResult>,
    pub agent_evaluation: AgentEvaluation,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimingBreakdown {
    pub embedding_ms: u64,
    pub search_ms: u64,
    pub rerank_ms: u64,
    pub agent_ms: u64,
    pub generation_ms: u64,
    pub total_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugData {
    pub iterations: Vec<IterationDebug>,
    pub timing: TimingBreakdown,
}
