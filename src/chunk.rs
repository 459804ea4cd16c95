//! Token-bounded, sentence-boundary-aware chunking of a [`DocumentTree`]
//! into `text_chunk` records, plus the optional hierarchical parent-chunk
//! variant for large, well-headed documents.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::instrument;
use unicode_segmentation::UnicodeSegmentation;
use uuid::Uuid;

use crate::config::Settings;
use crate::error::RagError;
use crate::model::{Chunk, ChunkMetadata, ChunkVariant, DocumentTree, NodeKind, SummaryLevel, TokenCountMethod, is_leaf_kind};
use crate::ports::{tag_or_default, Chat, ChatRequest, LanguageTagger};

/// Chars-per-token used when no exact tokenizer is wired in; callers that
/// plug in a real tokenizer would report `TokenCountMethod::Exact` instead.
const CHARS_PER_TOKEN: f64 = 4.0;

fn estimate_tokens(text: &str) -> usize {
    ((text.chars().count() as f64) / CHARS_PER_TOKEN).ceil() as usize
}

struct Leaf {
    hierarchy_path: Vec<String>,
    page_number: Option<u32>,
    sentences: Vec<String>,
}

fn flatten_leaves(tree: &DocumentTree) -> Vec<Leaf> {
    let mut leaves = Vec::new();
    for idx in tree.iter_order() {
        let node = tree.node(idx);
        if !is_leaf_kind(&node.kind) || node.content.is_empty() {
            continue;
        }
        let sentences = node
            .content
            .unicode_sentences()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        leaves.push(Leaf { hierarchy_path: node.hierarchy_path.clone(), page_number: node.page_number, sentences });
    }
    leaves
}

fn common_prefix(paths: &[Vec<String>]) -> Vec<String> {
    let Some(first) = paths.first() else {
        return Vec::new();
    };
    let mut prefix = first.clone();
    for path in &paths[1..] {
        let shared = prefix.iter().zip(path.iter()).take_while(|(a, b)| a == b).count();
        prefix.truncate(shared);
    }
    prefix
}

/// Accumulates sentences into a bounded chunk, tracking which leaves
/// contributed so the emitted chunk's hierarchy_path/page_number can be
/// derived once it is flushed.
#[derive(Default)]
struct Accumulator {
    text: String,
    contributing_paths: Vec<Vec<String>>,
    first_page: Option<Option<u32>>,
}

impl Accumulator {
    fn push_sentence(&mut self, sentence: &str, leaf: &Leaf) {
        if !self.text.is_empty() {
            self.text.push(' ');
        }
        self.text.push_str(sentence);
        self.contributing_paths.push(leaf.hierarchy_path.clone());
        if self.first_page.is_none() {
            self.first_page = Some(leaf.page_number);
        }
    }

    fn token_len(&self) -> usize {
        estimate_tokens(&self.text)
    }

    fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

struct RawChunk {
    content: String,
    hierarchy_path: Vec<String>,
    page_number: Option<u32>,
    /// Token count of `content` before the overlap prefix is applied; this,
    /// not the post-overlap content, is what is reported as the chunk's
    /// `token_count` so overlap never pushes a chunk's reported size past
    /// `chunk_size`.
    core_token_count: usize,
}

fn flush(acc: &mut Accumulator) -> RawChunk {
    let hierarchy_path = common_prefix(&acc.contributing_paths);
    let page_number = acc.first_page.flatten();
    let core_token_count = acc.token_len();
    RawChunk { content: std::mem::take(&mut acc.text), hierarchy_path, page_number, core_token_count }
}

/// Splits the document into raw, non-overlapping token-bounded segments
/// respecting sentence boundaries where at least 60% of `chunk_size` has
/// been accumulated.
fn segment(tree: &DocumentTree, settings: &Settings) -> Vec<RawChunk> {
    let leaves = flatten_leaves(tree);
    let chunk_size = settings.chunk_size.max(1);
    let min_close_tokens = ((chunk_size as f64) * 0.6).ceil() as usize;

    let mut chunks = Vec::new();
    let mut acc = Accumulator::default();

    for leaf in &leaves {
        for sentence in &leaf.sentences {
            let mut remaining = sentence.as_str();
            while !remaining.is_empty() {
                let tentative_len = if acc.is_empty() { remaining.len() } else { acc.text.len() + 1 + remaining.len() };
                let projected = estimate_tokens_for_len(tentative_len);

                if projected <= chunk_size {
                    acc.push_sentence(remaining, leaf);
                    remaining = "";
                } else if acc.token_len() >= min_close_tokens {
                    chunks.push(flush(&mut acc));
                    // start new accumulator; overlap is applied in a later pass
                } else {
                    // break mid-sentence at the token boundary: take as many
                    // chars as fit in the remaining token budget.
                    let budget_tokens = chunk_size.saturating_sub(acc.token_len()).max(1);
                    let budget_chars = ((budget_tokens as f64) * CHARS_PER_TOKEN) as usize;
                    let split_at = nearest_char_boundary(remaining, budget_chars.max(1));
                    if split_at == 0 || split_at >= remaining.len() {
                        acc.push_sentence(remaining, leaf);
                        remaining = "";
                    } else {
                        let (head, tail) = remaining.split_at(split_at);
                        acc.push_sentence(head, leaf);
                        chunks.push(flush(&mut acc));
                        remaining = tail.trim_start();
                    }
                }
            }
        }
    }

    if !acc.is_empty() {
        chunks.push(flush(&mut acc));
    }

    chunks
}

fn estimate_tokens_for_len(char_len: usize) -> usize {
    ((char_len as f64) / CHARS_PER_TOKEN).ceil() as usize
}

fn nearest_char_boundary(s: &str, target: usize) -> usize {
    let mut boundary = target.min(s.len());
    while boundary > 0 && !s.is_char_boundary(boundary) {
        boundary -= 1;
    }
    boundary
}

/// Applies the overlap policy to a sequence of raw, non-overlapping
/// segments: every chunk after the first is prefixed with the trailing
/// `chunk_overlap` tokens of its predecessor's content.
fn apply_overlap(raw: Vec<RawChunk>, settings: &Settings) -> Vec<RawChunk> {
    if settings.chunk_overlap == 0 || raw.len() < 2 {
        return raw;
    }
    let overlap_chars = ((settings.chunk_overlap as f64) * CHARS_PER_TOKEN) as usize;
    let mut out = Vec::with_capacity(raw.len());
    let mut previous_tail: Option<String> = None;
    for chunk in raw {
        let content = match &previous_tail {
            Some(tail) if !tail.is_empty() => format!("{tail} {}", chunk.content),
            _ => chunk.content.clone(),
        };
        let tail_start = nearest_char_boundary(&chunk.content, chunk.content.len().saturating_sub(overlap_chars));
        previous_tail = Some(chunk.content[tail_start..].to_string());
        out.push(RawChunk { content, hierarchy_path: chunk.hierarchy_path, page_number: chunk.page_number, core_token_count: chunk.core_token_count });
    }
    out
}

pub struct Chunker {
    language_tagger: Arc<dyn LanguageTagger>,
    chat: Option<Arc<dyn Chat>>,
}

impl Chunker {
    pub fn new(language_tagger: Arc<dyn LanguageTagger>) -> Self {
        Self { language_tagger, chat: None }
    }

    /// Enables the hierarchical parent-chunk variant, which requires a Chat
    /// port to generate the short per-section summary.
    pub fn with_chat(mut self, chat: Arc<dyn Chat>) -> Self {
        self.chat = Some(chat);
        self
    }

    #[instrument(skip(self, tree, settings), fields(doc_id = %doc_id))]
    pub async fn chunk(&self, tree: &DocumentTree, doc_id: Uuid, settings: &Settings) -> Result<Vec<Chunk>, RagError> {
        let raw = segment(tree, settings);
        let raw = apply_overlap(raw, settings);

        let mut chunks = Vec::with_capacity(raw.len());
        for raw_chunk in raw {
            let chunk = self.materialize(doc_id, raw_chunk).await?;
            chunks.push(chunk);
        }

        if self.should_use_hierarchical(tree, settings) {
            let parents = self.build_parent_chunks(tree, doc_id, &chunks, settings).await?;
            chunks.extend(parents);
        }

        Ok(chunks)
    }

    async fn materialize(&self, doc_id: Uuid, raw: RawChunk) -> Result<Chunk, RagError> {
        let analysis = tag_or_default(self.language_tagger.as_ref(), &raw.content).await?;
        let (language, is_multilingual, languages, distribution) = (analysis.primary_language, analysis.is_multilingual, analysis.languages, analysis.distribution);

        Ok(Chunk {
            chunk_id: Uuid::new_v4(),
            doc_id,
            variant: ChunkVariant::TextChunk,
            content: raw.content.clone(),
            hierarchy_path: raw.hierarchy_path,
            page_number: raw.page_number,
            language,
            is_multilingual,
            languages,
            language_distribution: distribution,
            metadata: ChunkMetadata {
                token_count: Some(raw.core_token_count),
                token_count_method: Some(TokenCountMethod::Estimated),
                ..Default::default()
            },
        })
    }

    fn should_use_hierarchical(&self, tree: &DocumentTree, settings: &Settings) -> bool {
        self.chat.is_some()
            && tree.full_text().len() > settings.hierarchical_threshold_chars
            && tree.root_sections().len() >= settings.min_headers_for_semantic
    }

    async fn build_parent_chunks(&self, tree: &DocumentTree, doc_id: Uuid, children: &[Chunk], settings: &Settings) -> Result<Vec<Chunk>, RagError> {
        let Some(chat) = &self.chat else {
            return Ok(Vec::new());
        };
        let mut parents = Vec::new();
        for section_idx in tree.root_sections() {
            let title = tree.section_title(section_idx).unwrap_or("Section").to_string();
            let section_text = tree.section_text(section_idx);
            if section_text.is_empty() {
                continue;
            }
            let child_ids: Vec<Uuid> = children
                .iter()
                .filter(|c| c.hierarchy_path.first() == Some(&title))
                .map(|c| c.chunk_id)
                .collect();
            if child_ids.is_empty() {
                continue;
            }

            let summary = chat
                .complete(ChatRequest {
                    system: "You write a short section summary for navigation purposes.".into(),
                    user: format!("Summarize this section titled \"{title}\" in under {} characters:\n\n{section_text}", settings.parent_summary_max_length),
                    max_tokens: 200,
                    temperature: 0.3,
                    json_mode: false,
                })
                .await?;
            let truncated: String = summary.chars().take(settings.parent_summary_max_length).collect();
            let content = format!("{title}\n\n{truncated}");

            parents.push(Chunk {
                chunk_id: Uuid::new_v4(),
                doc_id,
                variant: ChunkVariant::TextChunk,
                content,
                hierarchy_path: vec![title],
                page_number: None,
                language: "en".to_string(),
                is_multilingual: false,
                languages: vec!["en".to_string()],
                language_distribution: HashMap::new(),
                metadata: ChunkMetadata {
                    level: Some(SummaryLevel::Section),
                    children: child_ids,
                    ..Default::default()
                },
            });
        }
        Ok(parents)
    }
}
