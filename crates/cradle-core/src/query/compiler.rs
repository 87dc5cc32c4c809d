//! Compiler for the `subtype:name` query language.
//!
//! Either side may be double-quoted (taken literally, backslash escapes the
//! next character) or bare (trimmed, `*` is a wildcard). Without an unquoted
//! colon the whole input is a name pattern, OR-ed with a case-insensitive
//! description search over entities.

use pyo3::prelude::*;

use crate::errors::{CradleError, CradleResult};
use crate::models::EntryType;
use crate::query::guards::truncate_query;
use crate::query::predicate::{Field, Lookup, Predicate};

const REGEX_SPECIALS: &[char] = &[
    '.', '^', '$', '+', '?', '{', '}', '[', ']', '|', '(', ')', '\\',
];

/// One side of a query, as read from the input.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedField {
    pub value: String,
    /// Index just past the field.
    pub end: usize,
    pub quoted: bool,
}

/// Read one field starting at char index `start`.
///
/// A quoted field runs to the matching unescaped quote (or the end of
/// input); a bare field runs to the next colon and is trimmed.
pub fn parse_field(chars: &[char], start: usize) -> ParsedField {
    let n = chars.len();
    if start < n && chars[start] == '"' {
        let mut i = start + 1;
        let mut value = String::new();
        while i < n {
            match chars[i] {
                '\\' => {
                    if i + 1 < n {
                        value.push(chars[i + 1]);
                        i += 2;
                    } else {
                        i += 1;
                    }
                }
                '"' => {
                    i += 1;
                    break;
                }
                c => {
                    value.push(c);
                    i += 1;
                }
            }
        }
        return ParsedField {
            value,
            end: i,
            quoted: true,
        };
    }
    let mut i = start;
    while i < n && chars[i] != ':' {
        i += 1;
    }
    let raw: String = chars[start.min(n)..i].iter().collect();
    ParsedField {
        value: raw.trim().to_string(),
        end: i,
        quoted: false,
    }
}

/// Map one field to a lookup. `None` means the field imposes no constraint.
pub fn process_pattern(field: &str, was_quoted: bool) -> Option<Lookup> {
    if was_quoted || !field.contains('*') {
        return Some(Lookup::Exact(field.to_string()));
    }

    let left = field.starts_with('*');
    let right = field.ends_with('*');
    let count = field.matches('*').count();

    if count == 1 {
        match (left, right) {
            (true, false) => return Some(Lookup::IEndsWith(field[1..].to_string())),
            (false, true) => return Some(Lookup::IStartsWith(field[..field.len() - 1].to_string())),
            (true, true) => return None,
            (false, false) => {}
        }
    }
    if count == 2 && left && right {
        return Some(Lookup::IContains(field[1..field.len() - 1].to_string()));
    }

    let mut pattern = String::with_capacity(field.len() * 2 + 2);
    pattern.push('^');
    for ch in field.chars() {
        if ch == '*' {
            pattern.push_str(".*");
        } else {
            if REGEX_SPECIALS.contains(&ch) {
                pattern.push('\\');
            }
            pattern.push(ch);
        }
    }
    pattern.push('$');
    Some(Lookup::IRegex(pattern))
}

/// Index of the first colon outside double quotes. A quote preceded by a
/// backslash does not toggle quoting.
fn find_separator(chars: &[char]) -> Option<usize> {
    let mut in_quote = false;
    for (i, &c) in chars.iter().enumerate() {
        if c == '"' && (i == 0 || chars[i - 1] != '\\') {
            in_quote = !in_quote;
        } else if c == ':' && !in_quote {
            return Some(i);
        }
    }
    None
}

fn constraint(field: Field, lookup: Option<Lookup>) -> Predicate {
    match lookup {
        Some(lookup) => Predicate::leaf(field, lookup),
        None => Predicate::All,
    }
}

/// Compile a query string into a predicate over entries.
pub fn compile(query: &str) -> CradleResult<Predicate> {
    let chars: Vec<char> = query.chars().collect();

    if find_separator(&chars).is_none() {
        let name = parse_field(&chars, 0);
        let name_predicate = constraint(Field::Name, process_pattern(&name.value, name.quoted));
        let description = Predicate::leaf(
            Field::Description,
            Lookup::IContains(query.trim_matches('*').to_string()),
        )
        .and(Predicate::entry_type(EntryType::Entity));
        return Ok(name_predicate.or(description));
    }

    let subtype = parse_field(&chars, 0);
    if subtype.end >= chars.len() || chars[subtype.end] != ':' {
        return Err(CradleError::Syntax("Missing colon separator".to_string()));
    }
    let name = parse_field(&chars, subtype.end + 1);

    Ok(
        constraint(Field::Subtype, process_pattern(&subtype.value, subtype.quoted))
            .and(constraint(Field::Name, process_pattern(&name.value, name.quoted))),
    )
}

/// Compile with the advanced-query options applied: the input is bounded
/// and, with `wildcard`, wrapped as `*query*`. Empty input matches all.
pub fn compile_with_options(query: &str, wildcard: bool) -> CradleResult<Predicate> {
    let bounded = truncate_query(query);
    if bounded.is_empty() {
        return Ok(Predicate::All);
    }
    if wildcard {
        return compile(&format!("*{bounded}*"));
    }
    compile(&bounded)
}

// ---------------------------------------------------------------------------
// Python bindings
// ---------------------------------------------------------------------------

/// Compile `query` and return the predicate as a JSON-compatible object.
#[pyfunction]
#[pyo3(name = "compile_query", signature = (query, wildcard=false))]
pub fn py_compile_query(py: Python<'_>, query: &str, wildcard: bool) -> PyResult<PyObject> {
    let predicate = compile_with_options(query, wildcard)?;
    let json_str = serde_json::to_string(&predicate).map_err(CradleError::from)?;
    let json_module = py.import("json")?;
    json_module
        .call_method1("loads", (json_str,))
        .map(|o| o.into())
}

/// `(lookup, value)` for one field, or `(None, None)` when unconstrained.
#[pyfunction]
#[pyo3(name = "process_pattern", signature = (field, was_quoted=false))]
pub fn py_process_pattern(field: &str, was_quoted: bool) -> (Option<String>, Option<String>) {
    match process_pattern(field, was_quoted) {
        None => (None, None),
        Some(lookup) => {
            let (name, value) = match lookup {
                Lookup::Exact(v) => ("exact", v),
                Lookup::IStartsWith(v) => ("istartswith", v),
                Lookup::IEndsWith(v) => ("iendswith", v),
                Lookup::IContains(v) => ("icontains", v),
                Lookup::IRegex(v) => ("iregex", v),
                Lookup::In(ids) => (
                    "in",
                    ids.iter().map(i64::to_string).collect::<Vec<_>>().join(","),
                ),
            };
            (Some(name.to_string()), Some(value))
        }
    }
}
