//! The agentic decision point: given the current reranked context, decide
//! whether to answer now, refine the query, or widen the search.

use std::sync::Arc;

use serde::Deserialize;
use tracing::instrument;

use crate::error::{RetryPolicy, RagError};
use crate::model::{AgentDecision, AgentEvaluation};
use crate::ports::{Chat, ChatRequest};
use crate::retrieval::Candidate;

#[derive(Debug, Deserialize)]
struct RawEvaluation {
    decision: Option<String>,
    confidence: Option<f64>,
    reasoning: Option<String>,
    refined_query: Option<String>,
}

pub struct AgentEvaluator {
    chat: Arc<dyn Chat>,
    retry_policy: RetryPolicy,
}

impl AgentEvaluator {
    pub fn new(chat: Arc<dyn Chat>) -> Self {
        Self { chat, retry_policy: RetryPolicy::default() }
    }

    #[instrument(skip(self, query, context))]
    pub async fn evaluate(&self, query: &str, context: &[Candidate]) -> Result<AgentEvaluation, RagError> {
        let context_text: String = context.iter().map(|c| c.content.as_str()).collect::<Vec<_>>().join("\n\n");
        let user = format!(
            "Question: {query}\nRetrieved context:\n{context_text}\n\nRespond with JSON {{\"decision\": \"proceed\"|\"refine_query\"|\"expand_search\", \"confidence\": 0..1, \"reasoning\": \"...\", \"refined_query\": \"...\"}}."
        );

        let raw = self
            .retry_policy
            .run(|| {
                let chat = self.chat.clone();
                let user = user.clone();
                async move {
                    chat.complete(ChatRequest { system: "You judge whether retrieved context is sufficient to answer a question.".into(), user, max_tokens: 200, temperature: 0.1, json_mode: true })
                        .await
                }
            })
            .await?;

        Ok(match serde_json::from_str::<RawEvaluation>(&raw) {
            Ok(parsed) => normalize(parsed),
            Err(_) => AgentEvaluation { decision: AgentDecision::Proceed, confidence: 0.5, reasoning: "parse_failed".to_string(), refined_query: None },
        })
    }
}

fn normalize(raw: RawEvaluation) -> AgentEvaluation {
    let mut reasoning = raw.reasoning.unwrap_or_default();

    let decision = match raw.decision.as_deref() {
        Some("proceed") => AgentDecision::Proceed,
        Some("refine_query") => AgentDecision::RefineQuery,
        Some("expand_search") => AgentDecision::ExpandSearch,
        _ => {
            reasoning.push_str(" [decision coerced to proceed]");
            AgentDecision::Proceed
        }
    };

    let confidence = match raw.confidence {
        Some(c) if (0.0..=1.0).contains(&c) => c,
        Some(c) => {
            reasoning.push_str(" [confidence coerced into range]");
            c.clamp(0.0, 1.0)
        }
        None => {
            reasoning.push_str(" [confidence missing, defaulted]");
            0.5
        }
    };

    let refined_query = match decision {
        AgentDecision::RefineQuery => match raw.refined_query {
            Some(q) if !q.trim().is_empty() => Some(q),
            _ => None,
        },
        _ => raw.refined_query,
    };

    AgentEvaluation { decision, confidence, reasoning, refined_query }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::FakeChat;

    #[tokio::test]
    async fn parse_failure_synthesizes_safe_default() {
        let chat = Arc::new(FakeChat::new());
        chat.push_response("garbage, not json");
        let evaluator = AgentEvaluator::new(chat);
        let evaluation = evaluator.evaluate("q", &[]).await.unwrap();
        assert_eq!(evaluation.decision, AgentDecision::Proceed);
        assert_eq!(evaluation.confidence, 0.5);
        assert_eq!(evaluation.reasoning, "parse_failed");
    }

    #[tokio::test]
    async fn out_of_range_confidence_is_clamped() {
        let chat = Arc::new(FakeChat::new());
        chat.push_response(r#"{"decision":"proceed","confidence":1.5,"reasoning":"looks good"}"#);
        let evaluator = AgentEvaluator::new(chat);
        let evaluation = evaluator.evaluate("q", &[]).await.unwrap();
        assert_eq!(evaluation.confidence, 1.0);
        assert!(evaluation.reasoning.contains("coerced"));
    }

    #[tokio::test]
    async fn empty_refined_query_on_refine_decision_is_none() {
        let chat = Arc::new(FakeChat::new());
        chat.push_response(r#"{"decision":"refine_query","confidence":0.4,"reasoning":"ambiguous","refined_query":""}"#);
        let evaluator = AgentEvaluator::new(chat);
        let evaluation = evaluator.evaluate("q", &[]).await.unwrap();
        assert_eq!(evaluation.decision, AgentDecision::RefineQuery);
        assert_eq!(evaluation.refined_query, None);
    }
}
