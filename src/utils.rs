//! Helper functions shared by the renderer and the builtin filters.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::map::Map;
use serde_json::Value;

/// Key of the one-entry object used to mark a string as already escaped.
/// This is the engine's equivalent of a safe-markup `html()` protocol:
/// values wrapped by [`mark_safe`] go through output untouched.
pub(crate) const SAFE_MARKER_KEY: &str = "$__kida_safe__";

lazy_static! {
    static ref SPACELESS_RE: Regex = Regex::new(r">\s+<").unwrap();
}

/// Escape HTML following the OWASP XSS prevention cheat sheet: `&`, `<`,
/// `>`, `"` and `'` are replaced, NUL bytes are stripped, everything else
/// is passed through.
pub fn escape_html(input: &str) -> String {
    let mut output = String::with_capacity(input.len() * 2);
    for c in input.chars() {
        match c {
            '&' => output.push_str("&amp;"),
            '<' => output.push_str("&lt;"),
            '>' => output.push_str("&gt;"),
            '"' => output.push_str("&quot;"),
            '\'' => output.push_str("&#39;"),
            '\u{0}' => (),
            _ => output.push(c),
        }
    }

    // Not using shrink_to_fit() on purpose
    output
}

/// Wraps an already-escaped string so autoescaping leaves it alone.
pub fn mark_safe(content: impl Into<String>) -> Value {
    let mut obj = Map::with_capacity(1);
    obj.insert(SAFE_MARKER_KEY.to_string(), Value::String(content.into()));
    Value::Object(obj)
}

/// Returns the inner string if `value` is a safe-marked value.
pub fn as_safe_string(value: &Value) -> Option<&str> {
    match value {
        Value::Object(obj) if obj.len() == 1 => obj.get(SAFE_MARKER_KEY).and_then(Value::as_str),
        _ => None,
    }
}

/// Removes whitespace between adjacent HTML tags: `<li> </li>` becomes
/// `<li></li>`. Used by `{% spaceless %}` blocks.
pub fn spaceless(input: &str) -> String {
    SPACELESS_RE.replace_all(input, "><").to_string()
}

/// Render a buffer capacity guess for a body of `n` nodes.
#[inline]
pub(crate) fn buffer_capacity(node_count: usize) -> usize {
    node_count * 20
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("<script>"), "&lt;script&gt;");
        assert_eq!(escape_html(r#"a"b'c&d"#), "a&quot;b&#39;c&amp;d");
        assert_eq!(escape_html("nul\u{0}byte"), "nulbyte");
        assert_eq!(escape_html("safe text"), "safe text");
    }

    #[test]
    fn test_safe_marker_round_trip() {
        let v = mark_safe("<b>hi</b>");
        assert_eq!(as_safe_string(&v), Some("<b>hi</b>"));
        assert_eq!(as_safe_string(&Value::String("<b>hi</b>".to_string())), None);
    }

    #[test]
    fn test_spaceless() {
        assert_eq!(spaceless("<ul>\n  <li>a</li>\n</ul>"), "<ul><li>a</li></ul>");
        assert_eq!(spaceless("<p> keep inner text </p>"), "<p> keep inner text </p>");
    }
}
