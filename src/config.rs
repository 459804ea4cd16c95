//! Settings resolution: compiled defaults, environment overrides, and
//! MetaStore-backed per-tenant overrides, plus the shared prompt-template
//! substitution function used by every LLM-facing component.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::RagError;
use crate::ports::MetaStore;

const ENV_PREFIX: &str = "DOCSMITH_";

/// Resolved settings consumed by every stage. Constructed by
/// [`SettingsLoader::resolve`]; individual fields are also overridable
/// explicitly (mainly used by tests) by mutating the returned struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub default_top_k: usize,
    pub default_rerank_top: usize,
    pub max_agent_iterations: u32,
    pub rrf_k: f64,
    pub summarizer_short_doc_threshold: usize,
    pub summarizer_max_section_size: usize,
    pub summarizer_min_section_size: usize,
    pub summarizer_max_concurrent: usize,
    pub hierarchical_threshold_chars: usize,
    pub min_headers_for_semantic: usize,
    pub parent_summary_max_length: usize,
    pub parent_chunk_multiplier: usize,
    pub prompt_summary: String,
    pub prompt_qa: String,
    pub prompt_section_summary: String,
    pub prompt_reduce: String,
    pub prompt_evaluator: String,
    pub prompt_answer: String,
    #[serde(skip, default = "default_chat_timeout")]
    pub chat_timeout: Duration,
    #[serde(skip, default = "default_embedder_timeout")]
    pub embedder_timeout: Duration,
    #[serde(skip, default = "default_extractor_timeout")]
    pub extractor_timeout: Duration,
}

fn default_chat_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_embedder_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_extractor_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            chunk_size: 512,
            chunk_overlap: 50,
            default_top_k: 10,
            default_rerank_top: 5,
            max_agent_iterations: 3,
            rrf_k: 60.0,
            summarizer_short_doc_threshold: 12_000,
            summarizer_max_section_size: 15_000,
            summarizer_min_section_size: 500,
            summarizer_max_concurrent: 5,
            hierarchical_threshold_chars: 60_000,
            min_headers_for_semantic: 3,
            parent_summary_max_length: 2_000,
            parent_chunk_multiplier: 4,
            prompt_summary: "Summarize the following document:\n\n{content}".to_string(),
            prompt_qa: "Generate question/answer pairs grounded in:\n\n{content}".to_string(),
            prompt_section_summary: "Summarize this section titled \"{title}\":\n\n{content}".to_string(),
            prompt_reduce: "Combine these section summaries into one document summary:\n\n{summaries}".to_string(),
            prompt_evaluator: "Question: {query}\nRetrieved context:\n{context}\n\nDecide proceed, refine_query, or expand_search.".to_string(),
            prompt_answer: "Question: {query}\nContext:\n{context}\n\nAnswer with numbered citations.".to_string(),
            chat_timeout: default_chat_timeout(),
            embedder_timeout: default_embedder_timeout(),
            extractor_timeout: default_extractor_timeout(),
        }
    }
}

/// Reads settings from a [`MetaStore`], falling back through environment
/// variables prefixed `DOCSMITH_` to compiled defaults, and caches the
/// MetaStore rows behind a read-mostly lock.
///
/// Resolution order (highest precedence first): explicit overrides passed
/// to a pipeline call, MetaStore rows, `DOCSMITH_`-prefixed environment
/// variables, compiled defaults.
pub struct SettingsLoader {
    cache: RwLock<HashMap<String, String>>,
}

impl Default for SettingsLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl SettingsLoader {
    pub fn new() -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Refreshes the cache from the MetaStore for the given keys. Best-effort:
    /// a missing row simply leaves the cache entry absent, falling through
    /// to environment/defaults at resolve time.
    pub async fn refresh(&self, store: &dyn MetaStore, keys: &[&str]) -> Result<(), RagError> {
        let mut next = HashMap::new();
        for key in keys {
            if let Some(value) = store.get_setting(key).await? {
                next.insert((*key).to_string(), value);
            }
        }
        *self.cache.write() = next;
        Ok(())
    }

    fn cached(&self, key: &str) -> Option<String> {
        self.cache.read().get(key).cloned()
    }

    fn resolve_string(&self, key: &str, default: &str) -> String {
        if let Some(v) = self.cached(key) {
            return v;
        }
        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}{}", key.to_uppercase())) {
            return v;
        }
        default.to_string()
    }

    fn resolve_parsed<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        if let Some(v) = self.cached(key) {
            if let Ok(parsed) = v.parse() {
                return parsed;
            }
        }
        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}{}", key.to_uppercase())) {
            if let Ok(parsed) = v.parse() {
                return parsed;
            }
        }
        default
    }

    /// Builds a fully-resolved [`Settings`], layering cached MetaStore rows
    /// over environment variables over compiled defaults.
    pub fn resolve(&self) -> Settings {
        let defaults = Settings::default();
        Settings {
            chunk_size: self.resolve_parsed("chunk_size", defaults.chunk_size),
            chunk_overlap: self.resolve_parsed("chunk_overlap", defaults.chunk_overlap),
            default_top_k: self.resolve_parsed("default_top_k", defaults.default_top_k),
            default_rerank_top: self.resolve_parsed("default_rerank_top", defaults.default_rerank_top),
            max_agent_iterations: self.resolve_parsed("max_agent_iterations", defaults.max_agent_iterations),
            rrf_k: self.resolve_parsed("rrf_k", defaults.rrf_k),
            summarizer_short_doc_threshold: self
                .resolve_parsed("summarizer_short_doc_threshold", defaults.summarizer_short_doc_threshold),
            summarizer_max_section_size: self
                .resolve_parsed("summarizer_max_section_size", defaults.summarizer_max_section_size),
            summarizer_min_section_size: self
                .resolve_parsed("summarizer_min_section_size", defaults.summarizer_min_section_size),
            summarizer_max_concurrent: self
                .resolve_parsed("summarizer_max_concurrent", defaults.summarizer_max_concurrent),
            hierarchical_threshold_chars: defaults.hierarchical_threshold_chars,
            min_headers_for_semantic: defaults.min_headers_for_semantic,
            parent_summary_max_length: defaults.parent_summary_max_length,
            parent_chunk_multiplier: defaults.parent_chunk_multiplier,
            prompt_summary: self.resolve_string("prompt_summary", &defaults.prompt_summary),
            prompt_qa: self.resolve_string("prompt_qa", &defaults.prompt_qa),
            prompt_section_summary: defaults.prompt_section_summary,
            prompt_reduce: defaults.prompt_reduce,
            prompt_evaluator: defaults.prompt_evaluator,
            prompt_answer: defaults.prompt_answer,
            chat_timeout: defaults.chat_timeout,
            embedder_timeout: defaults.embedder_timeout,
            extractor_timeout: defaults.extractor_timeout,
        }
    }
}

/// Minimal mustache-style `{placeholder}` substitution: replaces every
/// `{key}` occurrence with its value from `vars`, leaving unknown
/// placeholders literal.
pub fn render_template(template: &str, vars: &HashMap<&str, &str>) -> String {
    let mut out = String::with_capacity(template.len());
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            if let Some(end) = template[i..].find('}') {
                let key = &template[i + 1..i + end];
                if let Some(value) = vars.get(key) {
                    out.push_str(value);
                    i += end + 1;
                    continue;
                }
            }
        }
        let ch = template[i..].chars().next().unwrap();
        out.push(ch);
        i += ch.len_utf8();
    }
    out
}
