//! Hierarchical map-reduce document summarization and Q&A synthesis.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{instrument, warn};

use crate::config::{render_template, Settings};
use crate::error::{RetryPolicy, RagError};
use crate::model::{DocumentSummaries, DocumentTree, QAPair, QAType, SectionSummary, SummaryMethod};
use crate::ports::{Chat, ChatRequest};

/// A section candidate produced by SPLIT, ready for the MAP phase.
struct SectionCandidate {
    title: String,
    content: String,
}

/// Splits paragraphs on blank lines, used by both the size-based fallback
/// split and the oversized-section splitter.
fn split_paragraphs(text: &str) -> Vec<&str> {
    text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()).collect()
}

fn split_oversized(title: &str, content: &str, max_section_size: usize) -> Vec<SectionCandidate> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut part_no = 1;
    for paragraph in split_paragraphs(content) {
        if !current.is_empty() && current.len() + paragraph.len() + 2 > max_section_size {
            parts.push(SectionCandidate { title: format!("{title} (Part {part_no})"), content: std::mem::take(&mut current) });
            part_no += 1;
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(paragraph);
    }
    if !current.is_empty() {
        parts.push(SectionCandidate { title: format!("{title} (Part {part_no})"), content: current });
    }
    parts
}

fn split_by_size(text: &str, max_section_size: usize) -> Vec<SectionCandidate> {
    let mut sections = Vec::new();
    let mut current = String::new();
    let mut section_no = 1;
    for paragraph in split_paragraphs(text) {
        if !current.is_empty() && current.len() + paragraph.len() + 2 > max_section_size {
            sections.push(SectionCandidate { title: format!("Section {section_no}"), content: std::mem::take(&mut current) });
            section_no += 1;
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(paragraph);
    }
    if !current.is_empty() {
        sections.push(SectionCandidate { title: format!("Section {section_no}"), content: current });
    }
    sections
}

/// SPLIT step: direct-child sections become candidates (oversized ones split
/// further, undersized ones dropped); falls back to size-based paragraph
/// accumulation when the tree has no structured sections.
fn split_candidates(tree: &DocumentTree, settings: &Settings) -> Vec<SectionCandidate> {
    let root_sections = tree.root_sections();
    if root_sections.is_empty() {
        return split_by_size(&tree.full_text(), settings.summarizer_max_section_size);
    }

    let mut candidates = Vec::new();
    for section_idx in root_sections {
        let title = tree.section_title(section_idx).unwrap_or("Section").to_string();
        let content = tree.section_text(section_idx);
        if content.len() < settings.summarizer_min_section_size {
            continue;
        }
        if content.len() > settings.summarizer_max_section_size {
            candidates.extend(split_oversized(&title, &content, settings.summarizer_max_section_size));
        } else {
            candidates.push(SectionCandidate { title, content });
        }
    }
    candidates
}

/// Produces document and section summaries via single-call or bounded
/// map-reduce summarization, selected deterministically by document length.
pub struct Summarizer {
    chat: Arc<dyn Chat>,
    retry_policy: RetryPolicy,
}

impl Summarizer {
    pub fn new(chat: Arc<dyn Chat>) -> Self {
        Self { chat, retry_policy: RetryPolicy::default() }
    }

    #[instrument(skip(self, tree, settings), fields(chars = tree.full_text().len()))]
    pub async fn summarize(&self, tree: &DocumentTree, settings: &Settings) -> Result<DocumentSummaries, RagError> {
        let text = tree.full_text();
        if text.len() <= settings.summarizer_short_doc_threshold {
            let document_summary = self.call_summary(&text, settings).await?;
            return Ok(DocumentSummaries {
                document_summary,
                section_summaries: Vec::new(),
                method: SummaryMethod::Single,
                sections_count: 0,
            });
        }

        let candidates = split_candidates(tree, settings);
        let section_summaries = self.map_phase(&candidates, settings).await?;
        let document_summary = self.reduce_phase(&section_summaries, settings).await?;
        Ok(DocumentSummaries {
            sections_count: section_summaries.len(),
            document_summary,
            section_summaries,
            method: SummaryMethod::MapReduce,
        })
    }

    async fn call_summary(&self, content: &str, settings: &Settings) -> Result<String, RagError> {
        let mut vars = HashMap::new();
        vars.insert("content", content);
        let user = render_template(&settings.prompt_summary, &vars);
        self.retry_policy
            .run(|| {
                let chat = self.chat.clone();
                let user = user.clone();
                async move {
                    chat.complete(ChatRequest { system: "You summarize documents faithfully and concisely.".into(), user, max_tokens: 1000, temperature: 0.3, json_mode: false })
                        .await
                }
            })
            .await
    }

    /// Bounded-concurrency MAP phase: spawns one summary task per candidate
    /// under a semaphore, then reassembles results by input index so the
    /// output order matches input order regardless of completion order.
    async fn map_phase(&self, candidates: &[SectionCandidate], settings: &Settings) -> Result<Vec<SectionSummary>, RagError> {
        let semaphore = Arc::new(Semaphore::new(settings.summarizer_max_concurrent.max(1)));
        let mut tasks = JoinSet::new();

        for (index, candidate) in candidates.iter().enumerate() {
            let chat = self.chat.clone();
            let retry_policy = self.retry_policy.clone();
            let semaphore = semaphore.clone();
            let title = candidate.title.clone();
            let content = candidate.content.clone();
            let template = settings.prompt_section_summary.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
                let mut vars = HashMap::new();
                vars.insert("title", title.as_str());
                vars.insert("content", content.as_str());
                let user = render_template(&template, &vars);
                let result = retry_policy
                    .run(|| {
                        let chat = chat.clone();
                        let user = user.clone();
                        async move {
                            chat.complete(ChatRequest { system: "You summarize one section of a larger document.".into(), user, max_tokens: 400, temperature: 0.3, json_mode: false })
                                .await
                        }
                    })
                    .await;
                (index, title, content.len(), result)
            });
        }

        let mut ordered: Vec<Option<SectionSummary>> = (0..candidates.len()).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            let (index, title, original_length, result) = joined.expect("summary task panicked");
            let summary_text = result?;
            ordered[index] = Some(SectionSummary { title, summary_text, original_length });
        }

        Ok(ordered.into_iter().map(|s| s.expect("every index filled")).collect())
    }

    async fn reduce_phase(&self, sections: &[SectionSummary], settings: &Settings) -> Result<String, RagError> {
        let summaries: String = sections
            .iter()
            .map(|s| format!("{}: {}", s.title, s.summary_text))
            .collect::<Vec<_>>()
            .join("\n\n");
        let mut vars = HashMap::new();
        vars.insert("summaries", summaries.as_str());
        let user = render_template(&settings.prompt_reduce, &vars);
        self.retry_policy
            .run(|| {
                let chat = self.chat.clone();
                let user = user.clone();
                async move {
                    chat.complete(ChatRequest { system: "You combine section summaries into one coherent document summary.".into(), user, max_tokens: 1000, temperature: 0.3, json_mode: false })
                        .await
                }
            })
            .await
    }
}

/// Generates question/answer pairs grounded in a document's full text via a
/// single structured-JSON Chat call.
pub struct QAGenerator {
    chat: Arc<dyn Chat>,
    retry_policy: RetryPolicy,
}

#[derive(Debug, Deserialize)]
struct RawQaEnvelope {
    #[serde(default)]
    qa_pairs: Vec<RawQaPair>,
}

#[derive(Debug, Deserialize)]
struct RawQaPair {
    question: Option<String>,
    answer: Option<String>,
    #[serde(rename = "type")]
    qa_type: Option<String>,
}

impl QAGenerator {
    pub fn new(chat: Arc<dyn Chat>) -> Self {
        Self { chat, retry_policy: RetryPolicy::default() }
    }

    #[instrument(skip(self, tree, settings))]
    pub async fn generate(&self, tree: &DocumentTree, n: usize, settings: &Settings) -> Result<Vec<QAPair>, RagError> {
        let mut vars = HashMap::new();
        let content = tree.full_text();
        let n_str = n.to_string();
        vars.insert("content", content.as_str());
        vars.insert("num_questions", n_str.as_str());
        let user = render_template(&settings.prompt_qa, &vars);

        let raw = self
            .retry_policy
            .run(|| {
                let chat = self.chat.clone();
                let user = user.clone();
                async move {
                    chat.complete(ChatRequest { system: "You write diverse question/answer pairs grounded only in the given document.".into(), user, max_tokens: 1200, temperature: 0.4, json_mode: true })
                        .await
                }
            })
            .await?;

        let envelope: RawQaEnvelope = match serde_json::from_str(&raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = %err, "qa generator received unparsable envelope");
                return Ok(Vec::new());
            }
        };

        let pairs = envelope
            .qa_pairs
            .into_iter()
            .filter_map(|raw| {
                let question = raw.question?;
                let answer = raw.answer?;
                if question.trim().is_empty() || answer.trim().is_empty() {
                    return None;
                }
                let qa_type = raw.qa_type.as_deref().map(QAType::parse_or_factual).unwrap_or(QAType::Factual);
                Some(QAPair { question, answer, qa_type })
            })
            .collect();
        Ok(pairs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NodeKind;
    use crate::ports::FakeChat;

    fn tree_with_sections(sections: &[(&str, &str)]) -> DocumentTree {
        let mut tree = DocumentTree::with_root();
        for (title, body) in sections {
            let sec = tree.push_child(DocumentTree::ROOT, NodeKind::Section { title: title.to_string(), depth: 1, role: None }, String::new(), None);
            tree.push_child(sec, NodeKind::Paragraph, body.to_string(), None);
        }
        tree
    }

    #[tokio::test]
    async fn short_document_uses_single_method() {
        let chat = Arc::new(FakeChat::new());
        chat.push_response("a short summary");
        let summarizer = Summarizer::new(chat);
        let tree = tree_with_sections(&[("Intro", "hello world")]);
        let settings = Settings::default();
        let result = summarizer.summarize(&tree, &settings).await.unwrap();
        assert_eq!(result.method, SummaryMethod::Single);
        assert_eq!(result.sections_count, 0);
        assert!(result.section_summaries.is_empty());
        assert_eq!(result.document_summary, "a short summary");
    }

    #[tokio::test]
    async fn map_reduce_preserves_input_order_despite_concurrency() {
        let chat = Arc::new(FakeChat::new());
        let summarizer = Summarizer::new(chat.clone());
        let mut settings = Settings::default();
        settings.summarizer_short_doc_threshold = 0;
        settings.summarizer_min_section_size = 0;

        let body = |n: usize| "word ".repeat(200 + n);
        let tree = tree_with_sections(&[("Alpha", &body(0)), ("Beta", &body(1)), ("Gamma", &body(2))]);

        chat.push_response("summary-alpha");
        chat.push_response("summary-beta");
        chat.push_response("summary-gamma");
        chat.push_response("reduced");

        let result = summarizer.summarize(&tree, &settings).await.unwrap();
        assert_eq!(result.method, SummaryMethod::MapReduce);
        assert_eq!(result.section_summaries.len(), 3);
        assert_eq!(result.section_summaries[0].title, "Alpha");
        assert_eq!(result.section_summaries[1].title, "Beta");
        assert_eq!(result.section_summaries[2].title, "Gamma");
    }

    #[tokio::test]
    async fn qa_generator_drops_malformed_items() {
        let chat = Arc::new(FakeChat::new());
        chat.push_response(r#"{"qa_pairs":[{"question":"Q1","answer":"A1","type":"factual"},{"question":"only question"},{"question":"Q2","answer":"A2","type":"bogus"}]}"#);
        let generator = QAGenerator::new(chat);
        let tree = tree_with_sections(&[("Intro", "hello world")]);
        let settings = Settings::default();
        let pairs = generator.generate(&tree, 5, &settings).await.unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[1].qa_type, QAType::Factual);
    }

    #[tokio::test]
    async fn qa_generator_returns_empty_on_unparsable_envelope() {
        let chat = Arc::new(FakeChat::new());
        chat.push_response("not json at all");
        let generator = QAGenerator::new(chat);
        let tree = tree_with_sections(&[("Intro", "hello world")]);
        let settings = Settings::default();
        let pairs = generator.generate(&tree, 5, &settings).await.unwrap();
        assert!(pairs.is_empty());
    }
}
