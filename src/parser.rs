//! Parser for `$variable` references and `${name(args)}` function calls
//! embedded in step fields.

use indexmap::{IndexMap, IndexSet};
use regex::Regex;
use serde_json::{Number, Value};
use std::sync::LazyLock;

use crate::error::{EngineError, Result};

static VARIABLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)")
        .expect("failed to compile variable regex")
});

/// A parsed `${name(args)}` call.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    pub args: Vec<Value>,
    pub kwargs: IndexMap<String, Value>,
}

/// A piece of an expression string.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Segment<'a> {
    Text(&'a str),
    Variable(&'a str),
    /// Raw `${name(args)}` substring.
    Call(&'a str),
}

/// Distinct `$name` references in first-occurrence order. A name directly
/// followed by `(` is not a variable.
pub fn extract_variables(text: &str) -> Vec<String> {
    let mut names = IndexSet::new();
    for caps in VARIABLE_RE.captures_iter(text) {
        let whole = caps.get(0).expect("capture 0 always present");
        if text[whole.end()..].starts_with('(') {
            continue;
        }
        names.insert(caps[1].to_string());
    }
    names.into_iter().collect()
}

/// Raw `${name(args)}` substrings in order of appearance.
pub fn extract_function_calls(text: &str) -> Result<Vec<String>> {
    Ok(segments(text)?
        .into_iter()
        .filter_map(|segment| match segment {
            Segment::Call(raw) => Some(raw.to_string()),
            _ => None,
        })
        .collect())
}

/// Split a call such as `${sign(key, $body, upper=True)}` into its name,
/// positional arguments and keyword arguments.
pub fn parse_call(call: &str) -> Result<FunctionCall> {
    let trimmed = call.trim();
    let inner = match trimmed.strip_prefix("${") {
        Some(rest) => rest
            .strip_suffix('}')
            .ok_or_else(|| EngineError::parse(call, "missing closing '}'"))?,
        None => trimmed,
    };

    let name_len = identifier_len(inner.as_bytes(), 0);
    if name_len == 0 {
        return Err(EngineError::parse(call, "expected function name"));
    }
    let name = &inner[..name_len];
    if inner.as_bytes().get(name_len) != Some(&b'(') {
        return Err(EngineError::parse(
            call,
            "expected '(' after function name",
        ));
    }
    let close = matching_paren(inner.as_bytes(), name_len)
        .ok_or_else(|| EngineError::parse(call, "unbalanced parentheses"))?;
    if close != inner.len() - 1 {
        return Err(EngineError::parse(
            call,
            format!("unexpected trailing input '{}'", &inner[close + 1..]),
        ));
    }

    let mut parsed = FunctionCall {
        name: name.to_string(),
        args: Vec::new(),
        kwargs: IndexMap::new(),
    };
    let arg_text = &inner[name_len + 1..close];
    if arg_text.trim().is_empty() {
        return Ok(parsed);
    }

    let pieces = split_top_level(arg_text)
        .map_err(|message| EngineError::parse(call, message))?;
    for piece in pieces {
        let piece = piece.trim();
        if piece.is_empty() {
            return Err(EngineError::parse(call, "empty argument"));
        }
        match keyword_split(piece) {
            Some((key, value)) => {
                parsed
                    .kwargs
                    .insert(key.to_string(), coerce_literal(value.trim()));
            }
            None => {
                if !parsed.kwargs.is_empty() {
                    return Err(EngineError::parse(
                        call,
                        "positional argument follows keyword argument",
                    ));
                }
                parsed.args.push(coerce_literal(piece));
            }
        }
    }

    Ok(parsed)
}

/// Literal coercion for one argument. Anything that still references a
/// variable stays a string so it can be substituted later.
pub fn coerce_literal(raw: &str) -> Value {
    if raw.contains('$') {
        return Value::String(raw.to_string());
    }
    if let Ok(int) = raw.parse::<i64>() {
        return Value::Number(int.into());
    }
    if let Ok(float) = raw.parse::<f64>() {
        if float.is_finite() && raw.chars().any(|c| c.is_ascii_digit()) {
            if let Some(number) = Number::from_f64(float) {
                return Value::Number(number);
            }
        }
    }
    match raw {
        "True" | "true" => return Value::Bool(true),
        "False" | "false" => return Value::Bool(false),
        "None" | "null" => return Value::Null,
        _ => {}
    }
    if raw.len() >= 2 {
        let first = raw.as_bytes()[0];
        let last = raw.as_bytes()[raw.len() - 1];
        if (first == b'\'' || first == b'"') && first == last {
            return Value::String(raw[1..raw.len() - 1].to_string());
        }
        if (first == b'[' && last == b']') || (first == b'{' && last == b'}') {
            if let Ok(value) = serde_json::from_str::<Value>(raw) {
                return value;
            }
        }
    }
    Value::String(raw.to_string())
}

/// Tokenize an expression string into literal text, variables and calls.
pub(crate) fn segments(text: &str) -> Result<Vec<Segment<'_>>> {
    let bytes = text.as_bytes();
    let mut out = Vec::new();
    let mut literal_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }

        if bytes.get(i + 1) == Some(&b'{') {
            let name_start = i + 2;
            let name_len = identifier_len(bytes, name_start);
            let open = name_start + name_len;
            if name_len > 0 && bytes.get(open) == Some(&b'(') {
                let close = matching_paren(bytes, open).ok_or_else(|| {
                    EngineError::parse(
                        &text[i..],
                        "unbalanced parentheses in function call",
                    )
                })?;
                if bytes.get(close + 1) != Some(&b'}') {
                    return Err(EngineError::parse(
                        &text[i..],
                        "expected '}' after function call",
                    ));
                }
                if literal_start < i {
                    out.push(Segment::Text(&text[literal_start..i]));
                }
                out.push(Segment::Call(&text[i..close + 2]));
                i = close + 2;
                literal_start = i;
                continue;
            }
            i += 1;
            continue;
        }

        let name_len = identifier_len(bytes, i + 1);
        let end = i + 1 + name_len;
        if name_len == 0 || bytes.get(end) == Some(&b'(') {
            i = end.max(i + 1);
            continue;
        }
        if literal_start < i {
            out.push(Segment::Text(&text[literal_start..i]));
        }
        out.push(Segment::Variable(&text[i + 1..end]));
        i = end;
        literal_start = i;
    }

    if literal_start < bytes.len() {
        out.push(Segment::Text(&text[literal_start..]));
    }
    Ok(out)
}

fn identifier_len(bytes: &[u8], start: usize) -> usize {
    let mut len = 0;
    while let Some(&b) = bytes.get(start + len) {
        let ok = if len == 0 {
            b.is_ascii_alphabetic() || b == b'_'
        } else {
            b.is_ascii_alphanumeric() || b == b'_'
        };
        if !ok {
            break;
        }
        len += 1;
    }
    len
}

/// Index of the `)` closing the `(` at `open`, skipping quoted text.
fn matching_paren(bytes: &[u8], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<u8> = None;
    for (idx, &b) in bytes.iter().enumerate().skip(open) {
        if let Some(q) = quote {
            if b == q {
                quote = None;
            }
            continue;
        }
        match b {
            b'\'' | b'"' => quote = Some(b),
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(idx);
                }
            }
            _ => {}
        }
    }
    None
}

fn split_top_level(text: &str) -> std::result::Result<Vec<&str>, String> {
    let mut pieces = Vec::new();
    let mut depth: i32 = 0;
    let mut quote: Option<u8> = None;
    let mut start = 0;

    for (idx, b) in text.bytes().enumerate() {
        if let Some(q) = quote {
            if b == q {
                quote = None;
            }
            continue;
        }
        match b {
            b'\'' | b'"' => quote = Some(b),
            b'(' | b'[' | b'{' => depth += 1,
            b')' | b']' | b'}' => {
                depth -= 1;
                if depth < 0 {
                    return Err(format!("unexpected '{}'", b as char));
                }
            }
            b',' if depth == 0 => {
                pieces.push(&text[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }

    if quote.is_some() {
        return Err("unterminated string literal".to_string());
    }
    if depth != 0 {
        return Err("unbalanced brackets in arguments".to_string());
    }
    pieces.push(&text[start..]);
    Ok(pieces)
}

/// `key=value` with an identifier key; `==` is not a keyword separator.
fn keyword_split(piece: &str) -> Option<(&str, &str)> {
    let eq = piece.find('=')?;
    let key = piece[..eq].trim();
    let rest = &piece[eq + 1..];
    if rest.starts_with('=') || key.is_empty() {
        return None;
    }
    if identifier_len(key.as_bytes(), 0) != key.len() {
        return None;
    }
    Some((key, rest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn variables_are_distinct_in_first_occurrence_order() {
        let names = extract_variables("$b/$a/$b?x=$c&y=$a");
        assert_eq!(names, vec!["b", "a", "c"]);
    }

    #[test]
    fn variables_skip_function_style_names() {
        assert_eq!(extract_variables("$call(1) and $real"), vec!["real"]);
        assert!(extract_variables("no refs, price 5$").is_empty());
        assert!(extract_variables("${now()}").is_empty());
    }

    #[test]
    fn variables_inside_call_arguments_are_reported() {
        assert_eq!(
            extract_variables("${sign($key, $body)}"),
            vec!["key", "body"]
        );
    }

    #[test]
    fn function_calls_are_extracted_raw() {
        let text = "/users/${uid()}/orders?ts=${stamp(1, (2))}";
        let calls = extract_function_calls(text).unwrap();
        assert_eq!(calls, vec!["${uid()}", "${stamp(1, (2))}"]);
    }

    #[test]
    fn unbalanced_call_is_a_parse_error() {
        let err = extract_function_calls("x ${broken(1, 2}").unwrap_err();
        assert!(matches!(err, EngineError::Parse { .. }));
        assert!(parse_call("${f(1}").is_err());
        assert!(parse_call("f(1))").is_err());
    }

    #[test]
    fn parse_call_classifies_and_coerces() {
        let call = parse_call(
            "${make(1, 2.5, True, None, 'quoted, text', $var, mode=fast, n=3)}",
        )
        .unwrap();
        assert_eq!(call.name, "make");
        assert_eq!(
            call.args,
            vec![
                json!(1),
                json!(2.5),
                json!(true),
                Value::Null,
                json!("quoted, text"),
                json!("$var"),
            ]
        );
        assert_eq!(call.kwargs.get("mode"), Some(&json!("fast")));
        assert_eq!(call.kwargs.get("n"), Some(&json!(3)));
    }

    #[test]
    fn parse_call_without_wrapper_and_args() {
        let call = parse_call("now()").unwrap();
        assert_eq!(call.name, "now");
        assert!(call.args.is_empty());
        assert!(call.kwargs.is_empty());
    }

    #[test]
    fn variable_arguments_are_never_coerced() {
        assert_eq!(coerce_literal("$count"), json!("$count"));
        assert_eq!(coerce_literal("[1, $x]"), json!("[1, $x]"));
        assert_eq!(coerce_literal("[1, 2]"), json!([1, 2]));
        assert_eq!(coerce_literal("inf"), json!("inf"));
    }

    #[test]
    fn nested_calls_stay_in_one_argument() {
        let call = parse_call("${outer(inner(1, 2), 3)}").unwrap();
        assert_eq!(call.args, vec![json!("inner(1, 2)"), json!(3)]);
    }

    #[test]
    fn segments_split_text_variables_and_calls() {
        let parts = segments("a $x b ${f($y)} $").unwrap();
        assert_eq!(
            parts,
            vec![
                Segment::Text("a "),
                Segment::Variable("x"),
                Segment::Text(" b "),
                Segment::Call("${f($y)}"),
                Segment::Text(" $"),
            ]
        );
    }
}
