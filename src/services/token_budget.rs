//! Fits conversation history and retrieved context into the model's input window.
//!
//! Priority: the query is never cut, history is kept in preference to context.

use std::path::Path;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use tokenizers::Tokenizer;

use crate::error::ModelError;
use crate::models::TokenBudgetConfig;
use crate::utils::tail_chars;

pub const TRUNCATION_MARKER: &str = " ...[TRUNCATED]";
pub const CONTEXT_HEADING: &str = "Regulatory Documents:";

static WORD_OR_PUNCT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\w+|[^\w\s]").unwrap());

/// Counts tokens and cuts text at token boundaries.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;

    /// Longest prefix of `text` spanning at most `max_tokens` tokens.
    fn truncate<'a>(&self, text: &'a str, max_tokens: usize) -> &'a str;
}

/// Words and individual punctuation marks, a close approximation of BPE counts
/// for English prose.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegexTokenCounter;

impl TokenCounter for RegexTokenCounter {
    fn count(&self, text: &str) -> usize {
        WORD_OR_PUNCT.find_iter(text).count()
    }

    fn truncate<'a>(&self, text: &'a str, max_tokens: usize) -> &'a str {
        if max_tokens == 0 {
            return "";
        }
        match WORD_OR_PUNCT.find_iter(text).nth(max_tokens - 1) {
            Some(m) => &text[..m.end()],
            None => text,
        }
    }
}

/// Exact counts from a HuggingFace `tokenizer.json`.
pub struct HfTokenCounter {
    tokenizer: Tokenizer,
}

impl HfTokenCounter {
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        if !path.exists() {
            return Err(ModelError::NotFound(path.display().to_string()));
        }
        let mut tokenizer =
            Tokenizer::from_file(path).map_err(|e| ModelError::TokenizerError(e.to_string()))?;
        tokenizer
            .with_truncation(None)
            .map_err(|e| ModelError::TokenizerError(e.to_string()))?;
        tokenizer.with_padding(None);
        Ok(Self { tokenizer })
    }
}

impl TokenCounter for HfTokenCounter {
    fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        match self.tokenizer.encode(text, false) {
            Ok(encoding) => encoding.len(),
            Err(e) => {
                tracing::debug!(error = %e, "tokenizer failed, using word count");
                RegexTokenCounter.count(text)
            }
        }
    }

    fn truncate<'a>(&self, text: &'a str, max_tokens: usize) -> &'a str {
        if max_tokens == 0 {
            return "";
        }
        match self.tokenizer.encode(text, false) {
            Ok(encoding) => match encoding.get_offsets().get(max_tokens - 1) {
                Some(&(_, end)) if text.is_char_boundary(end) => &text[..end],
                Some(_) => RegexTokenCounter.truncate(text, max_tokens),
                None => text,
            },
            Err(_) => RegexTokenCounter.truncate(text, max_tokens),
        }
    }
}

pub struct TokenBudget {
    counter: Arc<dyn TokenCounter>,
    max_input_tokens: usize,
    safety_margin: usize,
    min_context_tokens: usize,
    history_tail_chars: usize,
}

impl TokenBudget {
    pub fn new(counter: Arc<dyn TokenCounter>, config: &TokenBudgetConfig) -> Self {
        Self {
            counter,
            max_input_tokens: config.max_input_tokens,
            safety_margin: config.safety_margin,
            min_context_tokens: config.min_context_tokens,
            history_tail_chars: config.history_tail_chars,
        }
    }

    /// Uses the configured tokenizer when it loads, the regex counter otherwise.
    pub fn from_config(config: &TokenBudgetConfig) -> Self {
        let counter: Arc<dyn TokenCounter> = match &config.tokenizer_path {
            Some(path) => match HfTokenCounter::load(path) {
                Ok(counter) => Arc::new(counter),
                Err(e) => {
                    tracing::warn!(error = %e, "falling back to approximate token counting");
                    Arc::new(RegexTokenCounter)
                }
            },
            None => Arc::new(RegexTokenCounter),
        };
        Self::new(counter, config)
    }

    pub fn count(&self, text: &str) -> usize {
        self.counter.count(text)
    }

    /// Assemble history and context for the prompt. Returns an empty string when
    /// the query alone leaves no room.
    pub fn fit(&self, history: &str, context: &str, query: &str) -> String {
        let query_tokens = self.count(query) as i64;
        let budget = self.max_input_tokens as i64 - query_tokens - self.safety_margin as i64;
        if budget < 0 {
            tracing::warn!(query_tokens, "query exceeds the input window, dropping all context");
            return String::new();
        }

        let history_tokens = self.count(history) as i64;
        let context_tokens = self.count(context) as i64;
        if history_tokens + self.heading_tokens(history) + context_tokens <= budget {
            return join(history, context);
        }

        tracing::info!(
            needed = history_tokens + context_tokens,
            budget,
            "token limit exceeded, truncating"
        );

        let mut history = history;
        let mut remaining = budget - history_tokens - self.heading_tokens(history);
        if remaining < self.min_context_tokens as i64 {
            history = tail_chars(history, self.history_tail_chars);
            remaining = budget - self.count(history) as i64 - self.heading_tokens(history);
        }

        let context = self.counter.truncate(context, remaining.max(0) as usize);
        let mut assembled = join(history, context);
        assembled.push_str(TRUNCATION_MARKER);
        assembled
    }

    /// The context heading is only emitted between history and context.
    fn heading_tokens(&self, history: &str) -> i64 {
        if history.is_empty() {
            0
        } else {
            self.count(CONTEXT_HEADING) as i64
        }
    }
}

fn join(history: &str, context: &str) -> String {
    if history.is_empty() {
        context.to_string()
    } else {
        format!("{}\n\n{}\n{}", history, CONTEXT_HEADING, context)
    }
}
