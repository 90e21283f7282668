//! A small JSONPath dialect: `.a.b`, `[0]`, `[-1]`, `[*]`, `['dotted.key']`,
//! `[?(@.type=="Ready")]`, optionally wrapped in `{...}` and prefixed with `$`.

use std::fmt;

use serde_json::{Map, Value as Json};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JsonPathError {
    #[error("empty path")]
    Empty,
    #[error("invalid path {path:?} at offset {offset}: {message}")]
    Syntax { path: String, offset: usize, message: String },
    #[error("path {0:?} not found")]
    NotFound(String),
    #[error("cannot construct value at {0:?}")]
    Construct(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Field(String),
    Index(i64),
    Wildcard,
    Filter { path: Vec<String>, negate: bool, literal: Json },
}

#[derive(Debug, Clone, PartialEq)]
pub struct JsonPath {
    raw: String,
    segments: Vec<Segment>,
}

impl fmt::Display for JsonPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl JsonPath {
    pub fn parse(input: &str) -> Result<Self, JsonPathError> {
        let mut s = input.trim();
        if let Some(inner) = s.strip_prefix('{').and_then(|r| r.strip_suffix('}')) {
            s = inner.trim();
        }
        s = s.strip_prefix('$').unwrap_or(s);
        if s.is_empty() {
            return Err(JsonPathError::Empty);
        }
        let syntax = |offset: usize, message: &str| JsonPathError::Syntax { path: input.to_string(), offset, message: message.to_string() };

        let bytes = s.as_bytes();
        let mut segments = Vec::new();
        let mut i = 0usize;
        // A bare leading field (`status.phase`) reads as `.status.phase`.
        let mut expect_field = !matches!(bytes[0], b'.' | b'[');
        while i < bytes.len() || expect_field {
            if expect_field {
                let end = s[i..].find(['.', '[']).map(|p| i + p).unwrap_or(s.len());
                if end == i {
                    return Err(syntax(i, "expected field name"));
                }
                let name = &s[i..end];
                if name == "*" {
                    segments.push(Segment::Wildcard);
                } else {
                    segments.push(Segment::Field(name.to_string()));
                }
                i = end;
                expect_field = false;
                continue;
            }
            match bytes[i] {
                b'.' => {
                    if bytes.get(i + 1) == Some(&b'.') {
                        return Err(syntax(i, "recursive descent is not supported"));
                    }
                    i += 1;
                    expect_field = true;
                }
                b'[' => {
                    let close = find_bracket_end(s, i).ok_or_else(|| syntax(i, "unterminated '['"))?;
                    let inner = s[i + 1..close].trim();
                    segments.push(parse_bracket(inner).map_err(|m| syntax(i, &m))?);
                    i = close + 1;
                }
                _ => return Err(syntax(i, "expected '.' or '['")),
            }
        }
        Ok(Self { raw: input.to_string(), segments })
    }

    /// Whether the path can yield more than one value.
    pub fn is_multi(&self) -> bool {
        self.segments.iter().any(|s| matches!(s, Segment::Wildcard | Segment::Filter { .. }))
    }

    /// Every value the path selects. Missing keys select nothing.
    pub fn find<'a>(&self, root: &'a Json) -> Vec<&'a Json> {
        let mut cur: Vec<&'a Json> = vec![root];
        for seg in &self.segments {
            let mut next = Vec::new();
            for v in cur {
                match seg {
                    Segment::Field(name) => {
                        if let Some(x) = v.as_object().and_then(|o| o.get(name)) {
                            next.push(x);
                        }
                    }
                    Segment::Index(idx) => {
                        if let Some(arr) = v.as_array() {
                            let pos = if *idx < 0 { arr.len() as i64 + idx } else { *idx };
                            if pos >= 0 {
                                if let Some(x) = arr.get(pos as usize) {
                                    next.push(x);
                                }
                            }
                        }
                    }
                    Segment::Wildcard => match v {
                        Json::Array(arr) => next.extend(arr.iter()),
                        Json::Object(map) => next.extend(map.values()),
                        _ => {}
                    },
                    Segment::Filter { path, negate, literal } => {
                        if let Some(arr) = v.as_array() {
                            for el in arr {
                                let field = path.iter().try_fold(el, |acc, k| acc.get(k));
                                let hit = match field {
                                    Some(f) => values_equal(f, literal) != *negate,
                                    None => false,
                                };
                                if hit {
                                    next.push(el);
                                }
                            }
                        }
                    }
                }
            }
            cur = next;
        }
        cur
    }

    /// Single value for plain paths; an array of all matches for wildcard/filter paths.
    pub fn get(&self, root: &Json) -> Result<Json, JsonPathError> {
        let found = self.find(root);
        if self.is_multi() {
            if found.is_empty() {
                return Err(JsonPathError::NotFound(self.raw.clone()));
            }
            return Ok(Json::Array(found.into_iter().cloned().collect()));
        }
        found.into_iter().next().cloned().ok_or_else(|| JsonPathError::NotFound(self.raw.clone()))
    }
}

fn find_bracket_end(s: &str, open: usize) -> Option<usize> {
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    for (off, c) in s[open..].char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '[') => depth += 1,
            (None, ']') => {
                depth -= 1;
                if depth == 0 {
                    return Some(open + off);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_bracket(inner: &str) -> Result<Segment, String> {
    if inner == "*" {
        return Ok(Segment::Wildcard);
    }
    if let Some(q) = unquote(inner) {
        return Ok(Segment::Field(q));
    }
    if let Some(expr) = inner.strip_prefix("?(").and_then(|r| r.strip_suffix(')')) {
        return parse_filter(expr.trim());
    }
    inner.parse::<i64>().map(Segment::Index).map_err(|_| format!("unsupported selector [{}]", inner))
}

fn unquote(s: &str) -> Option<String> {
    let first = s.chars().next()?;
    if (first == '\'' || first == '"') && s.len() >= 2 && s.ends_with(first) {
        return Some(s[1..s.len() - 1].to_string());
    }
    None
}

fn parse_filter(expr: &str) -> Result<Segment, String> {
    let (lhs, rhs, negate) = if let Some((l, r)) = expr.split_once("!=") {
        (l, r, true)
    } else if let Some((l, r)) = expr.split_once("==") {
        (l, r, false)
    } else {
        return Err(format!("unsupported filter ({})", expr));
    };
    let lhs = lhs.trim();
    let field_path = lhs.strip_prefix("@.").ok_or_else(|| format!("filter must start with @. ({})", expr))?;
    let path: Vec<String> = field_path.split('.').map(|s| s.to_string()).collect();
    if path.iter().any(|p| p.is_empty()) {
        return Err(format!("empty field in filter ({})", expr));
    }
    let rhs = rhs.trim();
    let literal = match unquote(rhs) {
        Some(s) => Json::String(s),
        None => serde_json::from_str(rhs).map_err(|_| format!("invalid literal {}", rhs))?,
    };
    Ok(Segment::Filter { path, negate, literal })
}

/// Equality with numbers compared by value, so `1` and `1.0` match.
pub fn values_equal(a: &Json, b: &Json) -> bool {
    match (a, b) {
        (Json::Number(x), Json::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Json::Array(x), Json::Array(y)) => x.len() == y.len() && x.iter().zip(y).all(|(a, b)| values_equal(a, b)),
        (Json::Object(x), Json::Object(y)) => {
            x.len() == y.len() && x.iter().all(|(k, v)| y.get(k).map_or(false, |w| values_equal(v, w)))
        }
        _ => a == b,
    }
}

/// Build a nested object holding `value` at the dotted `key` (`a.b` → `{"a":{"b":value}}`).
pub fn construct(key: &str, value: Json) -> Result<Json, JsonPathError> {
    let trimmed = key.trim().trim_start_matches('$').trim_start_matches('.');
    if trimmed.is_empty() {
        return Err(JsonPathError::Construct(key.to_string()));
    }
    let parts: Vec<&str> = trimmed.split('.').collect();
    if parts.iter().any(|p| p.is_empty()) {
        return Err(JsonPathError::Construct(key.to_string()));
    }
    let mut out = value;
    for part in parts.into_iter().rev() {
        let mut m = Map::new();
        m.insert(part.to_string(), out);
        out = Json::Object(m);
    }
    Ok(out)
}

/// Deep-merge `src` into `dst`; objects merge key by key, anything else is replaced.
pub fn merge_into(dst: &mut Json, src: Json) {
    match (dst, src) {
        (Json::Object(d), Json::Object(s)) => {
            for (k, v) in s {
                match d.get_mut(&k) {
                    Some(existing) => merge_into(existing, v),
                    None => {
                        d.insert(k, v);
                    }
                }
            }
        }
        (d, s) => *d = s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pod() -> Json {
        json!({
            "metadata": {"name": "p", "labels": {"app.kubernetes.io/name": "web"}},
            "status": {
                "phase": "Running",
                "replicas": 3,
                "conditions": [
                    {"type": "Initialized", "status": "True"},
                    {"type": "Ready", "status": "False"}
                ]
            }
        })
    }

    #[test]
    fn plain_paths() {
        let p = JsonPath::parse(".status.phase").unwrap();
        assert_eq!(p.get(&pod()).unwrap(), json!("Running"));
        let p = JsonPath::parse("{.status.replicas}").unwrap();
        assert_eq!(p.get(&pod()).unwrap(), json!(3));
        let p = JsonPath::parse("status.conditions[-1].type").unwrap();
        assert_eq!(p.get(&pod()).unwrap(), json!("Ready"));
        let p = JsonPath::parse("$.metadata.labels['app.kubernetes.io/name']").unwrap();
        assert_eq!(p.get(&pod()).unwrap(), json!("web"));
    }

    #[test]
    fn missing_keys_select_nothing() {
        let p = JsonPath::parse(".status.nope.deeper").unwrap();
        assert!(p.find(&pod()).is_empty());
        assert!(matches!(p.get(&pod()), Err(JsonPathError::NotFound(_))));
    }

    #[test]
    fn wildcard_and_filter() {
        let p = JsonPath::parse(".status.conditions[*].status").unwrap();
        assert_eq!(p.get(&pod()).unwrap(), json!(["True", "False"]));
        let p = JsonPath::parse(".status.conditions[?(@.type==\"Ready\")].status").unwrap();
        assert_eq!(p.find(&pod()), vec![&json!("False")]);
        let p = JsonPath::parse(".status.conditions[?(@.type != 'Ready')].type").unwrap();
        assert_eq!(p.find(&pod()), vec![&json!("Initialized")]);
    }

    #[test]
    fn syntax_errors() {
        assert!(matches!(JsonPath::parse(""), Err(JsonPathError::Empty)));
        assert!(matches!(JsonPath::parse("..a"), Err(JsonPathError::Syntax { .. })));
        assert!(matches!(JsonPath::parse(".a[1"), Err(JsonPathError::Syntax { .. })));
        assert!(matches!(JsonPath::parse(".a[?(@.x > 1)]"), Err(JsonPathError::Syntax { .. })));
        assert!(matches!(JsonPath::parse(".a."), Err(JsonPathError::Syntax { .. })));
    }

    #[test]
    fn numbers_compare_by_value() {
        assert!(values_equal(&json!(1), &json!(1.0)));
        assert!(values_equal(&json!({"a": [1, 2]}), &json!({"a": [1.0, 2]})));
        assert!(!values_equal(&json!("1"), &json!(1)));
    }

    #[test]
    fn construct_and_merge() {
        let a = construct("db.host", json!("h")).unwrap();
        let b = construct(".db.port", json!(5432)).unwrap();
        let mut out = json!({});
        merge_into(&mut out, a);
        merge_into(&mut out, b);
        assert_eq!(out, json!({"db": {"host": "h", "port": 5432}}));
        assert!(construct("", json!(1)).is_err());
        assert!(construct("a..b", json!(1)).is_err());
    }
}
