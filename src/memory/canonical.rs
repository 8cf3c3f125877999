//! Text canonicalization, content fingerprints and URL normalization.
//!
//! [`canonicalize`] is pure and idempotent. Markup is reduced to its text
//! with entities decoded, repeatedly, until the text is stable under NFKC
//! folding and HTML parsing. The token removals that follow replace their
//! match with a space and no pattern spans whitespace, so a second pass finds
//! nothing new.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use scraper::Html;
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;
use url::Url;

use super::types::UNKNOWN_URL;

static TRACKING_PARAM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:utm_[a-z0-9_]+|fbclid|gclid|msclkid|mc_cid|mc_eid|igshid|yclid|ref_src|_ga)=[^\s&#]*")
        .expect("valid regex")
});
static ISO_TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b\d{4}-\d{2}-\d{2}(?:t\d{2}:\d{2}(?::\d{2}(?:\.\d+)?)?(?:z|[+-]\d{2}:?\d{2})?)?\b")
        .expect("valid regex")
});
static UUID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b")
        .expect("valid regex")
});
static CLOCK_TIME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{1,2}:\d{2}(?::\d{2})?\b").expect("valid regex"));

/// Elements whose text is never content.
const HIDDEN_ELEMENTS: [&str; 4] = ["script", "style", "noscript", "template"];

/// Bound on markup passes; each pass peels one layer of entity escaping.
const MAX_MARKUP_PASSES: usize = 8;

/// Normalize raw captured text into its canonical comparison form.
pub fn canonicalize(raw: &str) -> String {
    let mut text = strip_markup(raw);

    for pattern in [&*TRACKING_PARAM, &*ISO_TIMESTAMP, &*UUID, &*CLOCK_TIME] {
        if pattern.is_match(&text) {
            text = pattern.replace_all(&text, " ").into_owned();
        }
    }

    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Fold, then reduce markup to text until neither changes the result.
fn strip_markup(raw: &str) -> String {
    let mut text = fold_text(raw);
    for _ in 0..MAX_MARKUP_PASSES {
        if !text.contains(['<', '&']) {
            break;
        }
        let next = fold_text(&html_text(&text));
        if next == text {
            break;
        }
        text = next;
    }
    text
}

/// Visible text of an HTML fragment with entities decoded. Text nodes are
/// joined with spaces so adjacent block elements don't run together.
fn html_text(fragment: &str) -> String {
    let document = Html::parse_fragment(fragment);
    let mut out = String::with_capacity(fragment.len());
    for node in document.root_element().descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node.ancestors().any(|parent| {
            parent
                .value()
                .as_element()
                .is_some_and(|el| HIDDEN_ELEMENTS.contains(&el.name()))
        });
        if !hidden {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(&**text);
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// NFKC-normalize, map typographic punctuation to ASCII, drop invisible
/// characters and lowercase.
fn fold_text(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.nfkc() {
        match c {
            '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{2060}' | '\u{FEFF}' | '\u{00AD}' => {}
            '\u{00A0}' | '\u{2000}'..='\u{200A}' | '\u{202F}' | '\u{205F}' | '\u{3000}' => {
                out.push(' ')
            }
            '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}' | '\u{2032}' => out.push('\''),
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{201F}' | '\u{2033}' => out.push('"'),
            '\u{2010}'..='\u{2015}' | '\u{2212}' => out.push('-'),
            _ => out.push(c),
        }
    }
    out.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Lowercase hex SHA-256 of the canonical text.
pub fn canonical_hash(canonical_text: &str) -> String {
    format!("{:x}", Sha256::digest(canonical_text.as_bytes()))
}

/// Trim a submitted URL and map blanks and the `"unknown"` sentinel to `None`.
pub fn clean_url(url: Option<&str>) -> Option<String> {
    let url = url?.trim();
    if url.is_empty() || url.eq_ignore_ascii_case(UNKNOWN_URL) {
        None
    } else {
        Some(url.to_string())
    }
}

/// Scheme + host (+ non-default port) + path, with query and fragment
/// dropped and any trailing `/` removed from non-root paths.
pub fn normalize_url(url: &str) -> Option<String> {
    let url = clean_url(Some(url))?;
    let parsed = Url::parse(&url).ok()?;
    let host = parsed.host_str()?.to_lowercase();

    let path = parsed.path();
    let path = if path.len() > 1 {
        path.trim_end_matches('/')
    } else {
        ""
    };

    Some(match parsed.port() {
        Some(port) => format!("{}://{host}:{port}{path}", parsed.scheme()),
        None => format!("{}://{host}{path}", parsed.scheme()),
    })
}

/// Lowercased hostname without a leading `www.`.
pub fn url_host(url: &str) -> Option<String> {
    let url = clean_url(Some(url))?;
    let parsed = Url::parse(&url).ok()?;
    let host = parsed.host_str()?.to_lowercase();
    Some(host.strip_prefix("www.").unwrap_or(&host).to_string())
}

/// True when `host` equals `pattern` or is a subdomain of it.
pub fn host_matches(host: &str, pattern: &str) -> bool {
    let pattern = pattern.trim().to_lowercase();
    host == pattern || host.ends_with(&format!(".{pattern}"))
}

/// Jaccard similarity of the whitespace-separated word sets of two texts.
pub fn word_jaccard(a: &str, b: &str) -> f64 {
    let words_a: HashSet<&str> = a.split_whitespace().collect();
    let words_b: HashSet<&str> = b.split_whitespace().collect();
    if words_a.is_empty() && words_b.is_empty() {
        return if a.trim() == b.trim() { 1.0 } else { 0.0 };
    }
    let intersection = words_a.intersection(&words_b).count();
    let union = words_a.union(&words_b).count();
    intersection as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_html_and_collapses_whitespace() {
        let raw = "<html><head><style>body { color: red }</style></head>\
                   <body><h1>Hello</h1>\n\n  <p>World&nbsp;news</p>\
                   <script type=\"text/javascript\">track()</script></body></html>";
        assert_eq!(canonicalize(raw), "hello world news");
    }

    #[test]
    fn lowercases_and_folds_unicode() {
        assert_eq!(
            canonicalize("\u{201C}Smart\u{201D}\u{00A0}Quotes \u{2014} ＡＢＣ\u{200B}D"),
            "\"smart\" quotes - abcd"
        );
    }

    #[test]
    fn removes_timestamps_uuids_and_tracking() {
        let raw = "Captured 2026-03-04T10:15:30Z at 10:15 id 0191b1d2-8c5e-7a3b-9f00-1234567890ab \
                   see https://example.com/a?utm_source=news&utm_medium=email&fbclid=XyZ";
        assert_eq!(
            canonicalize(raw),
            "captured at id see https://example.com/a? & &"
        );
    }

    #[test]
    fn comparison_signs_survive() {
        assert_eq!(canonicalize("if a < b and c > d"), "if a < b and c > d");
    }

    #[test]
    fn entities_are_decoded() {
        assert_eq!(canonicalize("AT&amp;T earnings"), "at&t earnings");
        assert_eq!(canonicalize("x &lt; y &gt; z"), "x < y > z");
        assert_eq!(canonicalize("caf&eacute; &#x2019;s"), "caf\u{e9} 's");
        // Escaped markup is markup once decoded.
        assert_eq!(canonicalize("&lt;b&gt;bold&lt;/b&gt; text"), "bold text");
    }

    #[test]
    fn composed_and_decomposed_forms_match() {
        let composed = "Caf\u{e9} r\u{e9}sum\u{e9}";
        let decomposed = "Cafe\u{301} re\u{301}sume\u{301}";
        assert_eq!(canonicalize(composed), canonicalize(decomposed));
        assert_eq!(
            canonical_hash(&canonicalize(composed)),
            canonical_hash(&canonicalize(decomposed))
        );
        assert_eq!(canonicalize("\u{FB01}le \u{2460}"), "file 1");
    }

    #[test]
    fn empty_and_garbage_yield_empty() {
        assert_eq!(canonicalize(""), "");
        assert_eq!(canonicalize("   \n\t "), "");
        assert_eq!(canonicalize("<div></div><!-- note -->"), "");
        assert_eq!(canonicalize("<script>alert(1)</script>"), "");
    }

    #[test]
    fn canonicalize_is_idempotent() {
        let samples = [
            "Plain text with   spaces",
            "<p>Tagged &amp; entity</p> 2024-01-01t10:00:00z",
            "ＦＵＬＬ＜ｐ＞width",
            "x12345678-1234-1234-1234-1234567890ab2024-01-01",
            "?utm_a=1&gclid=2#frag 12:30 pm",
            "ut<b>utm_x=1</b>m_y=2",
            "Mixed ＜script＞alert(1)＜/script＞ end",
            "AT&amp;amp;T &amp;lt;i&amp;gt;x",
            "Cafe\u{301} \u{FB01}le",
        ];
        for s in samples {
            let once = canonicalize(s);
            assert_eq!(canonicalize(&once), once, "not idempotent for {s:?}");
        }
    }

    #[test]
    fn hash_is_pure_function_of_canonical_text() {
        let a = canonical_hash(&canonicalize("Hello   World"));
        let b = canonical_hash(&canonicalize("<b>hello</b> world"));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, canonical_hash("hello worlds"));
    }

    #[test]
    fn normalize_url_drops_query_and_fragment() {
        assert_eq!(
            normalize_url("https://Example.com/docs/page/?utm_source=x#top").as_deref(),
            Some("https://example.com/docs/page")
        );
        assert_eq!(
            normalize_url("https://example.com").as_deref(),
            Some("https://example.com")
        );
        assert_eq!(
            normalize_url("http://example.com:8080/a").as_deref(),
            Some("http://example.com:8080/a")
        );
        assert_eq!(normalize_url("unknown"), None);
        assert_eq!(normalize_url("not a url"), None);
    }

    #[test]
    fn url_host_strips_www() {
        assert_eq!(url_host("https://www.GitHub.com/a/b").as_deref(), Some("github.com"));
        assert_eq!(url_host("UNKNOWN"), None);
    }

    #[test]
    fn host_matching_includes_subdomains() {
        assert!(host_matches("github.com", "github.com"));
        assert!(host_matches("gist.github.com", "github.com"));
        assert!(!host_matches("notgithub.com", "github.com"));
    }

    #[test]
    fn jaccard_of_word_sets() {
        assert_eq!(word_jaccard("a b c", "a b c"), 1.0);
        assert_eq!(word_jaccard("a b", "c d"), 0.0);
        assert!((word_jaccard("a b c", "a b d") - 0.5).abs() < 1e-9);
        assert_eq!(word_jaccard("", ""), 1.0);
        assert_eq!(word_jaccard("", "a"), 0.0);
    }
}
