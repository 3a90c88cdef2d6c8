//! Keyword (FTS5/BM25) search support.
//!
//! SQLite's FTS5 `MATCH` operator treats `"`, `(`, `)`, `*`, `:`, `-`,
//! and a handful of other characters as query syntax rather than
//! literal text. A memory's text is free-form user content, so any
//! FTS5 query built from it (or from a user-supplied recall query) must
//! be escaped before it reaches `MATCH` — otherwise a string like
//! `"what's -2025"` throws a syntax error instead of matching.
//!
//! The approach mirrors `vector.rs`'s flat-scan idiom in spirit: keep it
//! simple and correct rather than trying to expose FTS5's operator
//! syntax (column filters, NEAR, prefix `*`) to callers. Every token is
//! wrapped in double quotes, which FTS5 treats as a literal phrase
//! term; AND is implicit between quoted terms.

/// Escape a raw query string for safe use inside an FTS5 `MATCH` clause.
///
/// Splits on whitespace, drops empty tokens, and wraps each token in
/// double quotes with internal `"` doubled per FTS5's own escaping rule.
/// An empty or all-whitespace input sanitizes to an empty string; callers
/// must check for that and skip the FTS5 query entirely (an empty
/// `MATCH ''` is itself a syntax error).
pub fn sanitize_fts5_query(raw: &str) -> String {
    raw.split_whitespace()
        .filter(|tok| !tok.is_empty())
        .map(|tok| format!("\"{}\"", tok.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_simple_tokens_in_quotes() {
        assert_eq!(sanitize_fts5_query("hello world"), "\"hello\" \"world\"");
    }

    #[test]
    fn escapes_embedded_quotes() {
        assert_eq!(sanitize_fts5_query("what's up"), "\"what's\" \"up\"");
        assert_eq!(sanitize_fts5_query("say \"hi\""), "\"say\" \"\"\"hi\"\"\"");
    }

    #[test]
    fn neutralizes_fts5_operator_characters() {
        let sanitized = sanitize_fts5_query("NEAR(a b) OR c* -d");
        assert!(sanitized.contains("\"NEAR(a\""));
        assert!(sanitized.contains("\"c*\""));
        assert!(sanitized.contains("\"-d\""));
    }

    #[test]
    fn empty_input_sanitizes_to_empty_string() {
        assert_eq!(sanitize_fts5_query(""), "");
        assert_eq!(sanitize_fts5_query("   "), "");
    }

    #[test]
    fn collapses_repeated_whitespace() {
        assert_eq!(sanitize_fts5_query("a   b\tc\n\nd"), "\"a\" \"b\" \"c\" \"d\"");
    }
}
