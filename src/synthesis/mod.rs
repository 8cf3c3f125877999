//! Optional answer synthesis over ranked search results.
//!
//! The [`AnswerSynthesizer`] receives the query and numbered snippets and
//! returns a short answer that cites snippets as `[n]`. [`parse_citations`]
//! turns those markers back into result positions. Synthesis is advisory:
//! callers drop the answer on any error.

pub mod http;

use std::sync::{Arc, LazyLock};

use anyhow::Result;
use regex::Regex;
use serde::Serialize;

use crate::config::SynthesisConfig;

/// One numbered search result handed to the synthesizer.
#[derive(Debug, Clone, Serialize)]
pub struct Snippet {
    /// 1-based position in the ranked result list.
    pub position: usize,
    pub memory_id: String,
    pub title: Option<String>,
    pub text: String,
}

/// Produces a short answer with `[n]` citations from ranked snippets.
/// Synchronous: call from `spawn_blocking`.
pub trait AnswerSynthesizer: Send + Sync {
    fn synthesize(&self, query: &str, snippets: &[Snippet]) -> Result<String>;
}

/// Create the configured synthesizer, or `None` when synthesis is disabled.
pub fn create_synthesizer(config: &SynthesisConfig) -> Result<Option<Arc<dyn AnswerSynthesizer>>> {
    match config.provider.as_str() {
        "none" | "" => Ok(None),
        "http" => Ok(Some(Arc::new(http::HttpSynthesizer::new(config)?))),
        other => anyhow::bail!("unknown synthesis provider: {other}. Supported: none, http"),
    }
}

static CITATION_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(\d{1,3})\]").expect("valid regex"));

/// Render the user prompt: the question followed by numbered sources.
pub fn build_prompt(query: &str, snippets: &[Snippet]) -> String {
    let mut prompt = format!("Question: {query}\n\nSources:\n");
    for snippet in snippets {
        match &snippet.title {
            Some(title) => prompt.push_str(&format!(
                "[{}] {}\n{}\n\n",
                snippet.position, title, snippet.text
            )),
            None => prompt.push_str(&format!("[{}] {}\n\n", snippet.position, snippet.text)),
        }
    }
    prompt.push_str(
        "Answer in at most three sentences using only the sources above. \
         Cite every claim with its source number in square brackets, e.g. [1].",
    );
    prompt
}

/// Extract `[n]` citation markers in order of first appearance, dropping
/// repeats and positions outside `1..=max_position`.
pub fn parse_citations(answer: &str, max_position: usize) -> Vec<usize> {
    let mut positions = Vec::new();
    for cap in CITATION_MARKER.captures_iter(answer) {
        if let Ok(n) = cap[1].parse::<usize>() {
            if (1..=max_position).contains(&n) && !positions.contains(&n) {
                positions.push(n);
            }
        }
    }
    positions
}

/// Truncate text to at most `max_chars` characters on a char boundary,
/// appending "..." when truncated.
pub fn truncate_snippet(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snippet(position: usize, title: Option<&str>, text: &str) -> Snippet {
        Snippet {
            position,
            memory_id: format!("m{position}"),
            title: title.map(str::to_string),
            text: text.to_string(),
        }
    }

    #[test]
    fn citations_in_first_appearance_order() {
        let answer = "Tokio schedules tasks [2]. It is work-stealing [1][2]. See also [9].";
        assert_eq!(parse_citations(answer, 3), vec![2, 1]);
    }

    #[test]
    fn citations_ignore_zero_and_non_numeric() {
        assert_eq!(parse_citations("[0] [a] [3]", 5), vec![3]);
        assert!(parse_citations("no markers here", 5).is_empty());
    }

    #[test]
    fn prompt_numbers_sources() {
        let prompt = build_prompt(
            "what is tokio?",
            &[
                snippet(1, Some("Tokio docs"), "An async runtime."),
                snippet(2, None, "Work stealing scheduler."),
            ],
        );
        assert!(prompt.starts_with("Question: what is tokio?"));
        assert!(prompt.contains("[1] Tokio docs\nAn async runtime."));
        assert!(prompt.contains("[2] Work stealing scheduler."));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_snippet("héllo wörld", 5), "héllo...");
        assert_eq!(truncate_snippet("short", 10), "short");
    }

    #[test]
    fn disabled_synthesizer_is_none() {
        let config = SynthesisConfig::default();
        assert!(create_synthesizer(&config).unwrap().is_none());
    }
}
