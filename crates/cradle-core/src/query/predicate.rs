//! Storage-agnostic predicate tree over entry fields.
//!
//! Built by the query compiler and the visibility rules, evaluated either in
//! memory against an [`Entry`] or compiled to a SQLite `WHERE` fragment.

use regex::RegexBuilder;
use rusqlite::types::Value as SqlValue;
use serde::{Deserialize, Serialize};

use crate::models::{Entry, EntryType};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Subtype,
    Name,
    Description,
    EntryType,
    Id,
}

impl Field {
    /// Column over the `entries e JOIN entry_classes c` pair.
    fn column(&self) -> &'static str {
        match self {
            Field::Subtype => "c.subtype",
            Field::Name => "e.name",
            Field::Description => "COALESCE(e.description, '')",
            Field::EntryType => "c.type",
            Field::Id => "e.id",
        }
    }
}

/// Comparison operator with its operand. Only `Exact` is case-sensitive.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "lookup", content = "value", rename_all = "lowercase")]
pub enum Lookup {
    Exact(String),
    IStartsWith(String),
    IEndsWith(String),
    IContains(String),
    IRegex(String),
    In(Vec<i64>),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Comparison {
    pub field: Field,
    pub lookup: Lookup,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "op", content = "args", rename_all = "snake_case")]
pub enum Predicate {
    All,
    Nothing,
    Leaf(Comparison),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

fn escape_like(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

impl Predicate {
    pub fn leaf(field: Field, lookup: Lookup) -> Self {
        Predicate::Leaf(Comparison { field, lookup })
    }

    pub fn entry_type(entry_type: EntryType) -> Self {
        Self::leaf(Field::EntryType, Lookup::Exact(entry_type.as_str().to_string()))
    }

    pub fn and(self, other: Predicate) -> Self {
        Self::all_of(vec![self, other])
    }

    pub fn or(self, other: Predicate) -> Self {
        Self::any_of(vec![self, other])
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        match self {
            Predicate::All => Predicate::Nothing,
            Predicate::Nothing => Predicate::All,
            Predicate::Not(inner) => *inner,
            other => Predicate::Not(Box::new(other)),
        }
    }

    /// Conjunction with `All` dropped, `Nothing` absorbing and nested `And`s
    /// flattened.
    pub fn all_of(parts: Vec<Predicate>) -> Self {
        let mut flat = Vec::with_capacity(parts.len());
        for part in parts {
            match part {
                Predicate::All => {}
                Predicate::Nothing => return Predicate::Nothing,
                Predicate::And(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => Predicate::All,
            1 => flat.remove(0),
            _ => Predicate::And(flat),
        }
    }

    /// Disjunction with `Nothing` dropped, `All` absorbing and nested `Or`s
    /// flattened.
    pub fn any_of(parts: Vec<Predicate>) -> Self {
        let mut flat = Vec::with_capacity(parts.len());
        for part in parts {
            match part {
                Predicate::Nothing => {}
                Predicate::All => return Predicate::All,
                Predicate::Or(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => Predicate::Nothing,
            1 => flat.remove(0),
            _ => Predicate::Or(flat),
        }
    }

    pub fn matches(&self, entry: &Entry) -> bool {
        match self {
            Predicate::All => true,
            Predicate::Nothing => false,
            Predicate::Leaf(cmp) => cmp.matches(entry),
            Predicate::And(parts) => parts.iter().all(|p| p.matches(entry)),
            Predicate::Or(parts) => parts.iter().any(|p| p.matches(entry)),
            Predicate::Not(inner) => !inner.matches(entry),
        }
    }

    /// SQL boolean expression plus its positional parameters, in order.
    pub fn to_sql(&self) -> (String, Vec<SqlValue>) {
        let mut params = Vec::new();
        let sql = self.write_sql(&mut params);
        (sql, params)
    }

    fn write_sql(&self, params: &mut Vec<SqlValue>) -> String {
        match self {
            Predicate::All => "1".to_string(),
            Predicate::Nothing => "0".to_string(),
            Predicate::Leaf(cmp) => cmp.write_sql(params),
            Predicate::And(parts) => {
                let inner: Vec<String> = parts.iter().map(|p| p.write_sql(params)).collect();
                format!("({})", inner.join(" AND "))
            }
            Predicate::Or(parts) => {
                let inner: Vec<String> = parts.iter().map(|p| p.write_sql(params)).collect();
                format!("({})", inner.join(" OR "))
            }
            Predicate::Not(inner) => format!("NOT ({})", inner.write_sql(params)),
        }
    }
}

impl Comparison {
    fn text<'a>(&self, entry: &'a Entry) -> std::borrow::Cow<'a, str> {
        match self.field {
            Field::Subtype => entry.subtype.as_str().into(),
            Field::Name => entry.name.as_str().into(),
            Field::Description => entry.description.as_deref().unwrap_or("").into(),
            Field::EntryType => entry.entry_type.as_str().into(),
            Field::Id => entry.id.to_string().into(),
        }
    }

    pub fn matches(&self, entry: &Entry) -> bool {
        let text = self.text(entry);
        match &self.lookup {
            Lookup::Exact(value) => text == value.as_str(),
            Lookup::IStartsWith(value) => text.to_lowercase().starts_with(&value.to_lowercase()),
            Lookup::IEndsWith(value) => text.to_lowercase().ends_with(&value.to_lowercase()),
            Lookup::IContains(value) => text.to_lowercase().contains(&value.to_lowercase()),
            Lookup::IRegex(pattern) => RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map(|re| re.is_match(&text))
                .unwrap_or(false),
            Lookup::In(ids) => self.field == Field::Id && ids.contains(&entry.id),
        }
    }

    fn write_sql(&self, params: &mut Vec<SqlValue>) -> String {
        let column = self.field.column();
        match &self.lookup {
            Lookup::Exact(value) => {
                params.push(SqlValue::Text(value.clone()));
                format!("{column} = ?")
            }
            Lookup::IStartsWith(value) => {
                params.push(SqlValue::Text(format!("{}%", escape_like(&value.to_lowercase()))));
                format!("casefold({column}) LIKE ? ESCAPE '\\'")
            }
            Lookup::IEndsWith(value) => {
                params.push(SqlValue::Text(format!("%{}", escape_like(&value.to_lowercase()))));
                format!("casefold({column}) LIKE ? ESCAPE '\\'")
            }
            Lookup::IContains(value) => {
                params.push(SqlValue::Text(format!("%{}%", escape_like(&value.to_lowercase()))));
                format!("casefold({column}) LIKE ? ESCAPE '\\'")
            }
            Lookup::IRegex(pattern) => {
                params.push(SqlValue::Text(format!("(?i){pattern}")));
                format!("regexp(?, {column})")
            }
            Lookup::In(ids) if ids.is_empty() => "0".to_string(),
            Lookup::In(ids) => {
                params.extend(ids.iter().map(|id| SqlValue::Integer(*id)));
                format!("{column} IN ({})", vec!["?"; ids.len()].join(", "))
            }
        }
    }
}
