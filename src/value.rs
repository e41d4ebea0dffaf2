//! A small typed value used for the guard-evaluation context, issue `status` maps, and
//! script env-var flattening. Backed by `serde_json::Value` so it round-trips directly
//! through the JSON documents the issue state store reads and writes, but exposes a
//! narrower scalar union {bool, number, string, null} at the accessor boundary per
//! the guard evaluator's contract.

use serde_json::Value as Json;

/// A scalar resolved from a dotted path lookup. Collections (objects/arrays) are not
/// scalars and resolve to `None` from `Context::get`.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Bool(bool),
    Number(f64),
    String(String),
    Null,
}

impl Scalar {
    /// Truthiness used for bare-path guard terms: false/null/0/empty-string are falsy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Scalar::Bool(b) => *b,
            Scalar::Number(n) => *n != 0.0,
            Scalar::String(s) => !s.is_empty(),
            Scalar::Null => false,
        }
    }

    fn from_json(value: &Json) -> Option<Scalar> {
        match value {
            Json::Null => Some(Scalar::Null),
            Json::Bool(b) => Some(Scalar::Bool(*b)),
            Json::Number(n) => n.as_f64().map(Scalar::Number),
            Json::String(s) => Some(Scalar::String(s.clone())),
            Json::Array(_) | Json::Object(_) => None,
        }
    }
}

impl std::fmt::Display for Scalar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scalar::Bool(b) => write!(f, "{b}"),
            Scalar::Number(n) => write!(f, "{n}"),
            Scalar::String(s) => write!(f, "{s}"),
            Scalar::Null => write!(f, ""),
        }
    }
}

/// A nested context map over which guard expressions and script templates are
/// resolved. Wraps an arbitrary `serde_json::Value` object.
#[derive(Debug, Clone, Default)]
pub struct Context(Json);

impl Context {
    pub fn new(value: Json) -> Self {
        Context(value)
    }

    pub fn empty() -> Self {
        Context(Json::Object(serde_json::Map::new()))
    }

    /// Resolve a dotted path (`a.b.c`) against the context. A missing segment anywhere
    /// along the path resolves to `Scalar::Null`, matching the guard evaluator's
    /// missing-path-is-null semantics. A path that resolves to an object or array also
    /// yields `Null` since those are not part of the scalar union.
    pub fn get(&self, path: &str) -> Scalar {
        let mut current = &self.0;
        for segment in path.split('.') {
            match current.get(segment) {
                Some(next) => current = next,
                None => return Scalar::Null,
            }
        }
        Scalar::from_json(current).unwrap_or(Scalar::Null)
    }

    /// Flatten every scalar-valued leaf into `UPPER_SNAKE` environment variable names,
    /// joining nested keys with `_` (so `status.phase` becomes `STATUS_PHASE`).
    pub fn flatten_env(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        flatten_into(&self.0, &mut Vec::new(), &mut out);
        out
    }

    pub fn as_json(&self) -> &Json {
        &self.0
    }
}

fn flatten_into(value: &Json, path: &mut Vec<String>, out: &mut Vec<(String, String)>) {
    match value {
        Json::Object(map) => {
            for (key, val) in map {
                path.push(key.clone());
                flatten_into(val, path, out);
                path.pop();
            }
        }
        other => {
            if path.is_empty() {
                return;
            }
            let name = path.join("_").to_uppercase();
            let rendered = match other {
                Json::Null => String::new(),
                Json::Bool(b) => b.to_string(),
                Json::Number(n) => n.to_string(),
                Json::String(s) => s.clone(),
                Json::Array(_) | Json::Object(_) => unreachable!(),
            };
            out.push((name, rendered));
        }
    }
}

/// Substitute `${a.b.c}` patterns in `template` with dotted lookups into `ctx`. A
/// missing substitution resolves to the empty string rather than erroring.
pub fn substitute(template: &str, ctx: &Context) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let path = &after[..end];
                out.push_str(&ctx.get(path).to_string());
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out
}
