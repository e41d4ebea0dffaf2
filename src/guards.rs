//! Guard expression evaluator.
//!
//! ```text
//! expr     := term  ( ('and' | 'or') term )*
//! term     := path ( ('==' | '!=') value )?
//! path     := identifier ('.' identifier)*
//! value    := 'true' | 'false' | 'null' | bareword | quoted-string | integer
//! ```
//!
//! `and` binds tighter than `or`, evaluated left-to-right within equal precedence.
//! Syntax errors never panic: they surface as `Err` and the caller treats the
//! containing transition as unsatisfied.

use crate::value::{Context, Scalar};
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub struct GuardError(String);

impl fmt::Display for GuardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid guard expression: {}", self.0)
    }
}

impl std::error::Error for GuardError {}

/// Evaluate a guard expression against a context. The empty string is always true.
pub fn evaluate(expr: &str, context: &Context) -> Result<bool, GuardError> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Ok(true);
    }

    // `or` has the lowest precedence: split on top-level " or " first.
    let mut any_true = false;
    for or_clause in split_top_level(expr, "or") {
        let mut clause_true = true;
        for and_clause in split_top_level(&or_clause, "and") {
            if !eval_term(and_clause.trim(), context)? {
                clause_true = false;
            }
        }
        if clause_true {
            any_true = true;
        }
    }
    Ok(any_true)
}

/// Split `expr` on a bare keyword operator that appears as a standalone word, outside
/// of any quoted string.
fn split_top_level(expr: &str, keyword: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth_quote = false;
    let mut current = String::new();
    let words: Vec<&str> = tokenize_preserving_quotes(expr);
    let mut i = 0;
    while i < words.len() {
        let w = words[i];
        if !depth_quote && w.eq_ignore_ascii_case(keyword) {
            parts.push(current.trim().to_string());
            current.clear();
        } else {
            if w.starts_with('"') {
                depth_quote = !depth_quote;
            }
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(w);
        }
        i += 1;
    }
    parts.push(current.trim().to_string());
    parts
}

/// Word-level tokenizer that keeps quoted strings as a single token.
fn tokenize_preserving_quotes(expr: &str) -> Vec<&str> {
    expr.split_whitespace().collect()
}

fn eval_term(term: &str, context: &Context) -> Result<bool, GuardError> {
    if term.is_empty() {
        return Err(GuardError("empty term".to_string()));
    }

    for op in ["==", "!="] {
        if let Some(pos) = term.find(op) {
            let path = term[..pos].trim();
            let raw_value = term[pos + op.len()..].trim();
            if path.is_empty() || raw_value.is_empty() {
                return Err(GuardError(format!("malformed comparison: {term}")));
            }
            let lhs = context.get(path);
            let rhs = parse_value(raw_value);
            let eq = scalars_equal(&lhs, &rhs);
            return Ok(if op == "==" { eq } else { !eq });
        }
    }

    // Bare path: truthy check.
    Ok(context.get(term).is_truthy())
}

fn parse_value(raw: &str) -> Scalar {
    if raw == "true" {
        return Scalar::Bool(true);
    }
    if raw == "false" {
        return Scalar::Bool(false);
    }
    if raw == "null" {
        return Scalar::Null;
    }
    if let Ok(n) = raw.parse::<f64>() {
        return Scalar::Number(n);
    }
    let unquoted = raw.trim_matches('"');
    Scalar::String(unquoted.to_string())
}

fn scalars_equal(lhs: &Scalar, rhs: &Scalar) -> bool {
    match (lhs, rhs) {
        (Scalar::Null, Scalar::Null) => true,
        (Scalar::Bool(a), Scalar::Bool(b)) => a == b,
        (Scalar::Number(a), Scalar::Number(b)) => a == b,
        (Scalar::String(a), Scalar::String(b)) => a == b,
        // A literal bareword that isn't a recognised keyword compares as a string
        // against whatever scalar the path resolved to (coerced to its display form).
        (other, Scalar::String(s)) | (Scalar::String(s), other) => other.to_string() == *s,
        _ => false,
    }
}
