use once_cell::sync::Lazy;
use regex::Regex;

/// Default cap for normalized system-message bodies.
pub const DEFAULT_MAX_LEN: usize = 5000;

const TRUNCATION_MARKER: &str = "\n\n[Content truncated...]";

static SCRIPT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<script[^>]*>.*?</script>").expect("script regex"));
static STYLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<style[^>]*>.*?</style>").expect("style regex"));
static BLOCK_TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<(?:br|p|div|tr|li|h[1-6])[^>]*>").expect("block tag regex"));
static ANY_TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").expect("tag regex"));
static NUMERIC_ENTITY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"&#(x[0-9a-fA-F]+|[0-9]+);").expect("entity regex"));
static SPACES_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t]+").expect("spaces regex"));
static BLANK_LINES_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n\s*\n").expect("blank regex"));

/// Convert an HTML blob to bounded plain text.
///
/// System-channel messages are frequently entire HTML emails; this strips
/// script/style blocks, turns block-level tags into newlines, drops the rest
/// of the markup, decodes entities, collapses whitespace, and truncates to
/// `max_len` characters with a visible marker. Pure and deterministic.
pub fn strip_html_to_text(html: &str, max_len: usize) -> String {
    if html.is_empty() {
        return String::new();
    }
    let text = SCRIPT_RE.replace_all(html, "");
    let text = STYLE_RE.replace_all(&text, "");
    let text = BLOCK_TAG_RE.replace_all(&text, "\n");
    let text = ANY_TAG_RE.replace_all(&text, "");
    let text = decode_entities(&text);
    let text = SPACES_RE.replace_all(&text, " ");
    let text = BLANK_LINES_RE.replace_all(&text, "\n\n");
    let text = text.trim();
    if text.chars().count() > max_len {
        let mut out: String = text.chars().take(max_len).collect();
        out.push_str(TRUNCATION_MARKER);
        out
    } else {
        text.to_string()
    }
}

/// True when the body looks like markup and is worth running through
/// `strip_html_to_text` at all.
pub fn looks_like_html(body: &str) -> bool {
    body.contains('<')
}

fn decode_entities(text: &str) -> String {
    let decoded = NUMERIC_ENTITY_RE.replace_all(text, |caps: &regex::Captures<'_>| {
        let raw = &caps[1];
        let code = if let Some(hex) = raw.strip_prefix('x').or_else(|| raw.strip_prefix('X')) {
            u32::from_str_radix(hex, 16).ok()
        } else {
            raw.parse::<u32>().ok()
        };
        code.and_then(char::from_u32)
            .map(|ch| ch.to_string())
            .unwrap_or_default()
    });
    // Named entities last so freshly decoded text is not re-interpreted.
    decoded
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_scripts_and_tags() {
        let out = strip_html_to_text("<p>Hello</p><script>evil()</script>World", 5000);
        assert!(out.contains("Hello"));
        assert!(out.contains("World"));
        assert!(!out.contains("evil()"));
        assert!(!out.contains('<'));
    }

    #[test]
    fn block_tags_become_newlines() {
        let out = strip_html_to_text("<div>one</div><div>two</div><br>three", 5000);
        assert_eq!(out, "one\ntwo\nthree");
    }

    #[test]
    fn decodes_entities() {
        let out = strip_html_to_text("Tom &amp; Jerry &lt;3 &#8364;5 &#x41;", 5000);
        assert_eq!(out, "Tom & Jerry <3 €5 A");
    }

    #[test]
    fn style_blocks_removed_case_insensitively() {
        let out = strip_html_to_text("<STYLE>p { color: red }</STYLE>visible", 5000);
        assert_eq!(out, "visible");
    }

    #[test]
    fn truncates_with_marker() {
        let long = "a".repeat(6000);
        let out = strip_html_to_text(&long, 5000);
        assert!(out.ends_with("[Content truncated...]"));
        assert!(out.starts_with("aaaa"));
        assert!(out.chars().count() < 6000);
    }

    #[test]
    fn collapses_whitespace() {
        let out = strip_html_to_text("a \t  b\n\n\n\nc", 5000);
        assert_eq!(out, "a b\n\nc");
    }

    #[test]
    fn empty_input_is_empty() {
        assert_eq!(strip_html_to_text("", 5000), "");
    }
}
