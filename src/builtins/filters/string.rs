/// Filters operating on string
use std::collections::HashMap;

use serde_json::value::{to_value, Value};
use unic_segment::{GraphemeIndices, Graphemes};

#[cfg(feature = "urlencode")]
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use super::arg_or_kwarg;
use crate::errors::{Error, Result};

/// RFC 3986 unreserved characters stay readable; `/` is kept so paths
/// survive encoding.
#[cfg(feature = "urlencode")]
const URL_PATH_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~')
    .remove(b'/');

/// Like [`URL_PATH_SET`] but `/` is encoded too, for query values.
#[cfg(feature = "urlencode")]
const URL_STRICT_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Uppercases the whole string.
pub fn upper(value: &Value, _: &[Value], _: &HashMap<String, Value>) -> Result<Value> {
    let s = try_get_value!("upper", "value", String, value);

    Ok(Value::String(s.to_uppercase()))
}

/// Lowercases the whole string.
pub fn lower(value: &Value, _: &[Value], _: &HashMap<String, Value>) -> Result<Value> {
    let s = try_get_value!("lower", "value", String, value);

    Ok(Value::String(s.to_lowercase()))
}

/// Drops whitespace from both ends.
pub fn trim(value: &Value, _: &[Value], _: &HashMap<String, Value>) -> Result<Value> {
    let s = try_get_value!("trim", "value", String, value);

    Ok(Value::String(s.trim().to_string()))
}

/// Drops whitespace from the left end only.
pub fn trim_start(value: &Value, _: &[Value], _: &HashMap<String, Value>) -> Result<Value> {
    let s = try_get_value!("lstrip", "value", String, value);

    Ok(Value::String(s.trim_start().to_string()))
}

/// Drops whitespace from the right end only.
pub fn trim_end(value: &Value, _: &[Value], _: &HashMap<String, Value>) -> Result<Value> {
    let s = try_get_value!("rstrip", "value", String, value);

    Ok(Value::String(s.trim_end().to_string()))
}

fn is_word_char(c: char) -> bool {
    // apostrophes stay inside a word so contractions keep their case
    c.is_alphanumeric() || c == '_' || c == '\''
}

/// Starts every word with an uppercase letter and lowercases the rest.
/// Any non-word character separates words.
pub fn title(value: &Value, _: &[Value], _: &HashMap<String, Value>) -> Result<Value> {
    let s = try_get_value!("title", "value", String, value);

    let mut out = String::with_capacity(s.len());
    let mut at_word_start = true;
    for c in s.chars() {
        if is_word_char(c) {
            if at_word_start {
                out.extend(c.to_uppercase());
            } else {
                out.extend(c.to_lowercase());
            }
            at_word_start = false;
        } else {
            out.push(c);
            at_word_start = true;
        }
    }

    Ok(Value::String(out))
}

/// Uppercases the first letter and lowercases everything after it.
pub fn capitalize(value: &Value, _: &[Value], _: &HashMap<String, Value>) -> Result<Value> {
    let s = try_get_value!("capitalize", "value", String, value);

    let mut chars = s.chars();
    let out = match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    };
    Ok(Value::String(out))
}

/// Flips the case of every cased letter.
pub fn swapcase(value: &Value, _: &[Value], _: &HashMap<String, Value>) -> Result<Value> {
    let s = try_get_value!("swapcase", "value", String, value);

    let out: String = s
        .chars()
        .flat_map(|c| {
            if c.is_lowercase() {
                c.to_uppercase().collect::<Vec<_>>()
            } else {
                c.to_lowercase().collect::<Vec<_>>()
            }
        })
        .collect();
    Ok(Value::String(out))
}

/// Cuts the string after `length` grapheme clusters and appends `end`
/// (default `…`) when something was actually cut. Counting clusters keeps
/// combined emoji and accented letters whole.
pub fn truncate(value: &Value, args: &[Value], kwargs: &HashMap<String, Value>) -> Result<Value> {
    let s = try_get_value!("truncate", "value", String, value);
    let length = match arg_or_kwarg(args, 0, kwargs, "length") {
        Some(l) => try_get_value!("truncate", "length", usize, l),
        None => 255,
    };
    let end = match arg_or_kwarg(args, 1, kwargs, "end") {
        Some(e) => try_get_value!("truncate", "end", String, e),
        None => "…".to_string(),
    };

    // byte offset of the first cluster past the limit, if there is one
    let cut_at = GraphemeIndices::new(&s).nth(length).map(|(offset, _)| offset);
    let out = match cut_at {
        Some(offset) => format!("{}{}", &s[..offset], end),
        None => s,
    };
    Ok(Value::String(out))
}

/// Counts whitespace-separated words.
pub fn wordcount(value: &Value, _: &[Value], _: &HashMap<String, Value>) -> Result<Value> {
    let s = try_get_value!("wordcount", "value", String, value);

    Ok(Value::from(s.split_whitespace().count()))
}

/// Wrap words onto lines no longer than `width` characters.
pub fn wordwrap(value: &Value, args: &[Value], kwargs: &HashMap<String, Value>) -> Result<Value> {
    let s = try_get_value!("wordwrap", "value", String, value);
    let width = match arg_or_kwarg(args, 0, kwargs, "width") {
        Some(w) => try_get_value!("wordwrap", "width", usize, w),
        None => 79,
    };

    let mut lines: Vec<String> = Vec::new();
    let mut current = String::new();
    for word in s.split_whitespace() {
        if !current.is_empty() && current.chars().count() + 1 + word.chars().count() > width {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        lines.push(current);
    }

    Ok(to_value(lines.join("\n")).unwrap())
}

/// Indent every line but the first by `width` spaces; `first=true` indents
/// the first line too.
pub fn indent(value: &Value, args: &[Value], kwargs: &HashMap<String, Value>) -> Result<Value> {
    let s = try_get_value!("indent", "value", String, value);
    let width = match arg_or_kwarg(args, 0, kwargs, "width") {
        Some(w) => try_get_value!("indent", "width", usize, w),
        None => 4,
    };
    let indent_first = match arg_or_kwarg(args, 1, kwargs, "first") {
        Some(f) => try_get_value!("indent", "first", bool, f),
        None => false,
    };

    let pad = " ".repeat(width);
    let mut out = String::with_capacity(s.len());
    for (i, line) in s.lines().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        if !line.is_empty() && (i > 0 || indent_first) {
            out.push_str(&pad);
        }
        out.push_str(line);
    }

    Ok(to_value(out).unwrap())
}

fn pad_to(s: &str, width: usize) -> (usize, usize) {
    let len = Graphemes::new(s).count();
    if len >= width {
        return (0, 0);
    }
    let total = width - len;
    (total / 2, total - total / 2)
}

/// Center the string in a field of `width` characters.
pub fn center(value: &Value, args: &[Value], kwargs: &HashMap<String, Value>) -> Result<Value> {
    let s = try_get_value!("center", "value", String, value);
    let width = match arg_or_kwarg(args, 0, kwargs, "width") {
        Some(w) => try_get_value!("center", "width", usize, w),
        None => 80,
    };

    let (left, right) = pad_to(&s, width);
    Ok(to_value(format!("{}{}{}", " ".repeat(left), s, " ".repeat(right))).unwrap())
}

/// Left-justify in a field of `width` characters.
pub fn ljust(value: &Value, args: &[Value], kwargs: &HashMap<String, Value>) -> Result<Value> {
    let s = try_get_value!("ljust", "value", String, value);
    let width = match arg_or_kwarg(args, 0, kwargs, "width") {
        Some(w) => try_get_value!("ljust", "width", usize, w),
        None => 80,
    };
    let len = Graphemes::new(s.as_str()).count();
    let pad = width.saturating_sub(len);
    Ok(to_value(format!("{}{}", s, " ".repeat(pad))).unwrap())
}

/// Right-justify in a field of `width` characters.
pub fn rjust(value: &Value, args: &[Value], kwargs: &HashMap<String, Value>) -> Result<Value> {
    let s = try_get_value!("rjust", "value", String, value);
    let width = match arg_or_kwarg(args, 0, kwargs, "width") {
        Some(w) => try_get_value!("rjust", "width", usize, w),
        None => 80,
    };
    let len = Graphemes::new(s.as_str()).count();
    let pad = width.saturating_sub(len);
    Ok(to_value(format!("{}{}", " ".repeat(pad), s)).unwrap())
}

/// Swaps every occurrence of `from` for `to`.
pub fn replace(value: &Value, args: &[Value], kwargs: &HashMap<String, Value>) -> Result<Value> {
    let s = try_get_value!("replace", "value", String, value);

    let from = arg_or_kwarg(args, 0, kwargs, "from")
        .ok_or_else(|| Error::msg("Filter `replace` needs a `from` argument"))?;
    let from = try_get_value!("replace", "from", String, from);
    let to = arg_or_kwarg(args, 1, kwargs, "to")
        .ok_or_else(|| Error::msg("Filter `replace` needs a `to` argument"))?;
    let to = try_get_value!("replace", "to", String, to);

    Ok(Value::String(s.replace(&from, &to)))
}

/// Removes HTML tags and comments, keeping the text between them. An
/// unterminated tag swallows the rest of the string.
pub fn striptags(value: &Value, _: &[Value], _: &HashMap<String, Value>) -> Result<Value> {
    let s = try_get_value!("striptags", "value", String, value);

    let mut out = String::with_capacity(s.len());
    let mut rest = s.as_str();
    while let Some(open) = rest.find('<') {
        out.push_str(&rest[..open]);
        let tail = &rest[open..];
        let skip = if tail.starts_with("<!--") {
            tail.find("-->").map(|end| end + 3)
        } else {
            tail.find('>').map(|end| end + 1)
        };
        match skip {
            Some(skip) => rest = &tail[skip..],
            None => return Ok(Value::String(out)),
        }
    }
    out.push_str(rest);

    Ok(Value::String(out))
}

/// Splits on `pat`, producing an array of the pieces.
pub fn split(value: &Value, args: &[Value], kwargs: &HashMap<String, Value>) -> Result<Value> {
    let s = try_get_value!("split", "value", String, value);
    let pat = arg_or_kwarg(args, 0, kwargs, "pat")
        .ok_or_else(|| Error::msg("Filter `split` needs a `pat` argument"))?;
    let pat = try_get_value!("split", "pat", String, pat);

    Ok(Value::Array(s.split(&pat).map(|piece| Value::String(piece.to_string())).collect()))
}

/// Puts a backslash before quotes and backslashes, for embedding in
/// quoted contexts.
pub fn addslashes(value: &Value, _: &[Value], _: &HashMap<String, Value>) -> Result<Value> {
    let s = try_get_value!("addslashes", "value", String, value);

    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '\\' | '"' | '\'') {
            out.push('\\');
        }
        out.push(c);
    }
    Ok(Value::String(out))
}

/// Percent-encodes everything outside the URL-safe set, leaving `/`
/// alone so paths stay paths.
#[cfg(feature = "urlencode")]
pub fn urlencode(value: &Value, _: &[Value], _: &HashMap<String, Value>) -> Result<Value> {
    let s = try_get_value!("urlencode", "value", String, value);
    Ok(Value::String(utf8_percent_encode(&s, URL_PATH_SET).to_string()))
}

/// Percent-encodes everything outside the URL-safe set, `/` included.
#[cfg(feature = "urlencode")]
pub fn urlencode_strict(value: &Value, _: &[Value], _: &HashMap<String, Value>) -> Result<Value> {
    let s = try_get_value!("urlencode_strict", "value", String, value);
    Ok(Value::String(utf8_percent_encode(&s, URL_STRICT_SET).to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_upper_lower() {
        assert_eq!(upper(&json!("straße"), &[], &HashMap::new()).unwrap(), json!("STRASSE"));
        assert_eq!(lower(&json!("LOUD"), &[], &HashMap::new()).unwrap(), json!("loud"));
    }

    #[test]
    fn test_upper_rejects_non_strings() {
        assert!(upper(&json!([1, 2]), &[], &HashMap::new()).is_err());
        assert!(upper(&json!(7), &[], &HashMap::new()).is_err());
    }

    #[test]
    fn test_trims() {
        assert_eq!(trim(&json!("\t padded \n"), &[], &HashMap::new()).unwrap(), json!("padded"));
        assert_eq!(
            trim_start(&json!("  left"), &[], &HashMap::new()).unwrap(),
            json!("left")
        );
        assert_eq!(trim_end(&json!("right  "), &[], &HashMap::new()).unwrap(), json!("right"));
    }

    #[test]
    fn test_title() {
        let cases = vec![
            ("once upon a time", "Once Upon A Time"),
            ("HELLO-world", "Hello-World"),
            ("rock'n'roll", "Rock'n'roll"),
            ("line\nbreaks  too", "Line\nBreaks  Too"),
            ("(parens) stay", "(Parens) Stay"),
            ("", ""),
        ];
        for (input, expected) in cases {
            assert_eq!(title(&json!(input), &[], &HashMap::new()).unwrap(), json!(expected));
        }
    }

    #[test]
    fn test_capitalize() {
        assert_eq!(
            capitalize(&json!("gETTING sTARTED"), &[], &HashMap::new()).unwrap(),
            json!("Getting started")
        );
        assert_eq!(capitalize(&json!(""), &[], &HashMap::new()).unwrap(), json!(""));
    }

    #[test]
    fn test_swapcase() {
        assert_eq!(
            swapcase(&json!("Kida v0.1"), &[], &HashMap::new()).unwrap(),
            json!("kIDA V0.1")
        );
    }

    #[test]
    fn test_truncate_short_input_untouched() {
        assert_eq!(
            truncate(&json!("tiny"), &[json!(10)], &HashMap::new()).unwrap(),
            json!("tiny")
        );
        // exactly at the limit counts as untouched
        assert_eq!(
            truncate(&json!("four"), &[json!(4)], &HashMap::new()).unwrap(),
            json!("four")
        );
    }

    #[test]
    fn test_truncate_counts_clusters_not_bytes() {
        assert_eq!(
            truncate(&json!("héllo wörld"), &[json!(5)], &HashMap::new()).unwrap(),
            json!("héllo…")
        );
        // a skin-tone emoji is one cluster, several code points
        assert_eq!(
            truncate(&json!("👍🏽 ok"), &[json!(1)], &HashMap::new()).unwrap(),
            json!("👍🏽…")
        );
    }

    #[test]
    fn test_truncate_custom_end() {
        let kwargs: HashMap<String, Value> =
            [("end".to_string(), json!(" [more]"))].into_iter().collect();
        assert_eq!(
            truncate(&json!("read all about it"), &[json!(8)], &kwargs).unwrap(),
            json!("read all [more]")
        );
    }

    #[test]
    fn test_wordcount() {
        assert_eq!(
            wordcount(&json!("  three  little words "), &[], &HashMap::new()).unwrap(),
            json!(3)
        );
        assert_eq!(wordcount(&json!(""), &[], &HashMap::new()).unwrap(), json!(0));
    }

    #[test]
    fn test_wordwrap() {
        assert_eq!(
            wordwrap(&json!("wrap these four words"), &[json!(10)], &HashMap::new()).unwrap(),
            json!("wrap these\nfour words")
        );
    }

    #[test]
    fn test_indent_defaults() {
        assert_eq!(
            indent(&json!("one\ntwo\nthree"), &[], &HashMap::new()).unwrap(),
            json!("one\n    two\n    three")
        );
    }

    #[test]
    fn test_indent_first_line() {
        let kwargs: HashMap<String, Value> =
            [("first".to_string(), json!(true))].into_iter().collect();
        assert_eq!(
            indent(&json!("one\ntwo"), &[json!(2)], &kwargs).unwrap(),
            json!("  one\n  two")
        );
    }

    #[test]
    fn test_padding() {
        assert_eq!(center(&json!("ab"), &[json!(6)], &HashMap::new()).unwrap(), json!("  ab  "));
        // an odd leftover lands on the right
        assert_eq!(center(&json!("ab"), &[json!(5)], &HashMap::new()).unwrap(), json!(" ab  "));
        assert_eq!(ljust(&json!("ab"), &[json!(4)], &HashMap::new()).unwrap(), json!("ab  "));
        assert_eq!(rjust(&json!("ab"), &[json!(4)], &HashMap::new()).unwrap(), json!("  ab"));
        assert_eq!(
            rjust(&json!("too wide"), &[json!(3)], &HashMap::new()).unwrap(),
            json!("too wide")
        );
    }

    #[test]
    fn test_replace() {
        assert_eq!(
            replace(&json!("2025-12-31"), &[json!("-"), json!("/")], &HashMap::new()).unwrap(),
            json!("2025/12/31")
        );
        let err = replace(&json!("x"), &[json!("a")], &HashMap::new()).unwrap_err();
        assert!(err.to_string().contains("`to`"));
    }

    #[test]
    fn test_striptags() {
        let cases = vec![
            ("<p>keep <em>this</em> text</p>", "keep this text"),
            ("before<!-- hidden <b>bits</b> -->after", "beforeafter"),
            ("no markup at all", "no markup at all"),
            ("dangling <unclosed", "dangling "),
            ("<a href=\"#\">link</a>", "link"),
        ];
        for (input, expected) in cases {
            assert_eq!(
                striptags(&json!(input), &[], &HashMap::new()).unwrap(),
                json!(expected),
                "{}",
                input
            );
        }
    }

    #[test]
    fn test_split() {
        assert_eq!(
            split(&json!("one::two::three"), &[json!("::")], &HashMap::new()).unwrap(),
            json!(["one", "two", "three"])
        );
        assert_eq!(
            split(&json!("nosep"), &[json!(",")], &HashMap::new()).unwrap(),
            json!(["nosep"])
        );
    }

    #[test]
    fn test_addslashes() {
        assert_eq!(
            addslashes(&json!(r#"it's a "test" \ok"#), &[], &HashMap::new()).unwrap(),
            json!(r#"it\'s a \"test\" \\ok"#)
        );
    }

    #[cfg(feature = "urlencode")]
    #[test]
    fn test_urlencode_keeps_slashes() {
        assert_eq!(
            urlencode(&json!("/docs/getting started?v=2"), &[], &HashMap::new()).unwrap(),
            json!("/docs/getting%20started%3Fv%3D2")
        );
    }

    #[cfg(feature = "urlencode")]
    #[test]
    fn test_urlencode_strict_encodes_slashes() {
        assert_eq!(
            urlencode_strict(&json!("a/b c"), &[], &HashMap::new()).unwrap(),
            json!("a%2Fb%20c")
        );
    }
}
