//! Produces a grounded answer with numbered inline citations from the
//! final iteration's reranked context.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use regex::Regex;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::error::{RetryPolicy, RagError};
use crate::model::Citation;
use crate::ports::{Chat, ChatRequest};
use crate::retrieval::Candidate;

pub struct AnswerGenerator {
    chat: Arc<dyn Chat>,
    retry_policy: RetryPolicy,
}

pub struct GeneratedAnswer {
    pub answer: String,
    pub citations: Vec<Citation>,
}

impl AnswerGenerator {
    pub fn new(chat: Arc<dyn Chat>) -> Self {
        Self { chat, retry_policy: RetryPolicy::default() }
    }

    #[instrument(skip(self, query, context, document_names))]
    pub async fn generate(&self, query: &str, context: &[Candidate], document_names: &HashMap<Uuid, String>) -> Result<GeneratedAnswer, RagError> {
        if context.is_empty() {
            return Ok(GeneratedAnswer { answer: String::new(), citations: Vec::new() });
        }

        let listing: String = context
            .iter()
            .enumerate()
            .map(|(i, c)| format!("[{}] {}", i + 1, c.content))
            .collect::<Vec<_>>()
            .join("\n\n");
        let user = format!("Question: {query}\nContext passages:\n{listing}\n\nAnswer the question using only the context above, citing passages inline as [n].");

        let answer = self
            .retry_policy
            .run(|| {
                let chat = self.chat.clone();
                let user = user.clone();
                async move {
                    chat.complete(ChatRequest { system: "You answer questions using only the provided context, citing sources inline.".into(), user, max_tokens: 800, temperature: 0.2, json_mode: false })
                        .await
                }
            })
            .await?;

        let citations = extract_citations(&answer, context, document_names);
        if citations.is_empty() {
            warn!("answer generator produced no resolvable citation markers");
        }

        Ok(GeneratedAnswer { answer, citations })
    }
}

fn citation_pattern() -> Regex {
    Regex::new(r"\[(\d+)\]").expect("static citation regex is valid")
}

/// Scans the answer text for `[n]` markers in order of first appearance,
/// mapping each valid index to its source candidate. Duplicate markers
/// share the same ordinal; out-of-range markers are skipped.
fn extract_citations(answer: &str, context: &[Candidate], document_names: &HashMap<Uuid, String>) -> Vec<Citation> {
    let pattern = citation_pattern();
    let mut seen = HashSet::new();
    let mut citations = Vec::new();
    let mut ordinal = 0u32;

    for capture in pattern.captures_iter(answer) {
        let Ok(index) = capture[1].parse::<usize>() else {
            continue;
        };
        if index == 0 || index > context.len() || !seen.insert(index) {
            continue;
        }
        let candidate = &context[index - 1];
        ordinal += 1;
        citations.push(Citation {
            document_id: candidate.doc_id,
            document_name: document_names.get(&candidate.doc_id).cloned().unwrap_or_default(),
            hierarchy_path: candidate.hierarchy_path.clone(),
            page_number: candidate.page_number,
            ordinal,
        });
    }
    citations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::FakeChat;

    fn candidate(doc_id: Uuid) -> Candidate {
        Candidate {
            chunk_id: Uuid::new_v4(),
            doc_id,
            content: "relevant passage".to_string(),
            hierarchy_path: vec!["Intro".to_string()],
            page_number: Some(2),
            source: "vector_chunks",
            fused_score: 1.0,
            score: 1.0,
            score_change: 0.0,
        }
    }

    #[tokio::test]
    async fn citations_are_ordered_by_first_appearance_and_deduped() {
        let chat = Arc::new(FakeChat::new());
        chat.push_response("The system works this way [2]. It also does this [1], repeated again [2].");
        let generator = AnswerGenerator::new(chat);
        let doc_a = Uuid::new_v4();
        let doc_b = Uuid::new_v4();
        let context = vec![candidate(doc_a), candidate(doc_b)];
        let mut names = HashMap::new();
        names.insert(doc_a, "doc-a.pdf".to_string());
        names.insert(doc_b, "doc-b.pdf".to_string());

        let result = generator.generate("how does it work", &context, &names).await.unwrap();
        assert_eq!(result.citations.len(), 2);
        assert_eq!(result.citations[0].document_name, "doc-b.pdf");
        assert_eq!(result.citations[1].document_name, "doc-a.pdf");
        assert_eq!(result.citations[0].ordinal, 1);
        assert_eq!(result.citations[1].ordinal, 2);
    }

    #[tokio::test]
    async fn out_of_range_marker_is_skipped() {
        let chat = Arc::new(FakeChat::new());
        chat.push_response("This cites a nonexistent source [9].");
        let generator = AnswerGenerator::new(chat);
        let context = vec![candidate(Uuid::new_v4())];
        let result = generator.generate("q", &context, &HashMap::new()).await.unwrap();
        assert!(result.citations.is_empty());
    }
}
