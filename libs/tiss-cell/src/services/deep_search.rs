//! Shape-tolerant lookups over insurer payloads.
//!
//! Insurer return files arrive as XML or JSON whose nesting and namespace
//! prefixes vary per insurer (`ans:valorGlosa`, `valorGlosa`, `dados.valorGlosa`).
//! Every lookup here is total: absence is `None` or an empty `Vec`, never an
//! error, and callers decide their own default-or-fail policy.

use std::str::FromStr;

use rust_decimal::Decimal;
use serde_json::{Map, Value};

use crate::error::TissError;
use crate::services::xml_reader::xml_to_value;

pub const DEFAULT_MAX_DEPTH: usize = 10;

#[derive(Debug, Clone, Copy)]
pub struct SearchOptions {
    pub ignore_namespace: bool,
    pub max_depth: usize,
    pub case_insensitive: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            ignore_namespace: true,
            max_depth: DEFAULT_MAX_DEPTH,
            case_insensitive: false,
        }
    }
}

/// `ans:valorGlosa` -> `valorGlosa`
pub fn local_name(key: &str) -> &str {
    key.rsplit(':').next().unwrap_or(key)
}

fn key_matches(candidate: &str, wanted: &str, options: &SearchOptions) -> bool {
    let (candidate, wanted) = if options.ignore_namespace {
        (local_name(candidate), local_name(wanted))
    } else {
        (candidate, wanted)
    };

    if options.case_insensitive {
        candidate.to_lowercase() == wanted.to_lowercase()
    } else {
        candidate == wanted
    }
}

/// Depth-first search for the first value stored under `key`. Keys of the
/// current object are checked before descending into its children.
pub fn find_key_in_object<'a>(doc: &'a Value, key: &str, options: &SearchOptions) -> Option<&'a Value> {
    search(doc, key, options, 0)
}

fn search<'a>(value: &'a Value, key: &str, options: &SearchOptions, depth: usize) -> Option<&'a Value> {
    if depth > options.max_depth {
        return None;
    }

    match value {
        Value::Object(map) => map
            .iter()
            .find(|(candidate, _)| key_matches(candidate, key, options))
            .map(|(_, found)| found)
            .or_else(|| map.values().find_map(|child| search(child, key, options, depth + 1))),
        Value::Array(items) => items
            .iter()
            .find_map(|item| search(item, key, options, depth + 1)),
        _ => None,
    }
}

pub fn find_key<'a>(doc: &'a Value, key: &str) -> Option<&'a Value> {
    find_key_in_object(doc, key, &SearchOptions::default())
}

/// Tries each alternative name in order; the first hit wins.
pub fn find_first_key<'a>(doc: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| find_key(doc, key))
}

/// Every value stored under `key`, in document order. A matched value is not
/// searched again for nested occurrences of the same key.
pub fn find_all_keys<'a>(doc: &'a Value, key: &str) -> Vec<&'a Value> {
    let mut found = Vec::new();
    collect(doc, key, &SearchOptions::default(), 0, &mut found);
    found
}

fn collect<'a>(value: &'a Value, key: &str, options: &SearchOptions, depth: usize, found: &mut Vec<&'a Value>) {
    if depth > options.max_depth {
        return;
    }

    match value {
        Value::Object(map) => {
            for (candidate, child) in map {
                if key_matches(candidate, key, options) {
                    found.push(child);
                } else {
                    collect(child, key, options, depth + 1, found);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect(item, key, options, depth + 1, found);
            }
        }
        _ => {}
    }
}

/// Follows an explicit path. Each segment is matched with or without a
/// namespace prefix; an array is indexed numerically or, failing that, its
/// first element is used.
pub fn get_path<'a>(obj: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(obj, |current, segment| step(current, segment))
}

fn step<'a>(value: &'a Value, segment: &str) -> Option<&'a Value> {
    match value {
        Value::Object(map) => lookup_key(map, segment),
        Value::Array(items) => match segment.parse::<usize>() {
            Ok(index) => items.get(index),
            Err(_) => items.first().and_then(|first| step(first, segment)),
        },
        _ => None,
    }
}

fn lookup_key<'a>(map: &'a Map<String, Value>, segment: &str) -> Option<&'a Value> {
    map.get(segment).or_else(|| {
        let wanted = local_name(segment);
        map.iter()
            .find(|(candidate, _)| local_name(candidate) == wanted)
            .map(|(_, found)| found)
    })
}

/// A bare value becomes a one-element list; `null` becomes empty.
pub fn normalize_array(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(items) => items.iter().collect(),
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

/// Unwraps `{"#text": ...}` and single-element arrays down to a scalar.
fn unwrap_scalar(value: &Value) -> Option<&Value> {
    match value {
        Value::Object(map) => map.get("#text").and_then(unwrap_scalar),
        Value::Array(items) => match items.as_slice() {
            [single] => unwrap_scalar(single),
            _ => None,
        },
        Value::Null => None,
        scalar => Some(scalar),
    }
}

pub fn extract_text(value: &Value) -> Option<String> {
    match unwrap_scalar(value)? {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

pub fn extract_number(value: &Value) -> Option<Decimal> {
    match unwrap_scalar(value)? {
        Value::Number(n) => parse_decimal(&n.to_string()),
        Value::String(s) => parse_locale_number(s),
        _ => None,
    }
}

pub fn extract_boolean(value: &Value) -> Option<bool> {
    match unwrap_scalar(value)? {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_i64() {
            Some(1) => Some(true),
            Some(0) => Some(false),
            _ => None,
        },
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "1" | "s" | "sim" | "yes" | "y" => Some(true),
            "false" | "0" | "n" | "não" | "nao" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn parse_decimal(raw: &str) -> Option<Decimal> {
    Decimal::from_str(raw)
        .ok()
        .or_else(|| Decimal::from_scientific(raw).ok())
}

/// Accepts `R$ 1.234,56`, `1234,56`, `1234.56` and `1.234.567`.
pub fn parse_locale_number(raw: &str) -> Option<Decimal> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, ',' | '.' | '-'))
        .collect();

    if !cleaned.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }

    let normalized = if cleaned.contains(',') {
        cleaned.replace('.', "").replace(',', ".")
    } else if cleaned.matches('.').count() > 1 {
        cleaned.replace('.', "")
    } else {
        cleaned
    };

    Decimal::from_str(&normalized).ok()
}

/// Parses a raw insurer payload: JSON when it looks like JSON, XML otherwise.
pub fn parse_document(raw: &str) -> Result<Value, TissError> {
    let trimmed = raw.trim_start_matches('\u{feff}').trim();

    match trimmed.chars().next() {
        Some('{') | Some('[') => serde_json::from_str(trimmed)
            .map_err(|e| TissError::Parse(format!("JSON inválido: {}", e))),
        Some('<') => xml_to_value(trimmed),
        _ => Err(TissError::Parse("Formato de arquivo não reconhecido".to_string())),
    }
}
