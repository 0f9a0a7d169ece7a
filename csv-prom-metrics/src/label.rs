use std::fmt::Write as _;
use std::hash::{Hash, Hasher};

/// An ordered, environment-anchored set of Prometheus labels.
///
/// `environment` is always rendered first, followed by the insertion-ordered
/// `(key, value)` pairs. Equality and hashing are order-sensitive: two sets
/// with the same pairs in a different order are distinct keys, which is why
/// this type cannot simply wrap `indexmap::IndexMap` (its `Eq` impl compares
/// as an unordered collection).
#[derive(Clone, Debug, Eq)]
pub struct LabelSet {
    environment: String,
    pairs: Vec<(String, String)>,
}

impl LabelSet {
    /// Creates a label set anchored to `environment`. Panics if `environment`
    /// is empty: constructing one without it is a programming error (spec
    /// §4.1 "Failure").
    pub fn new(environment: impl Into<String>) -> Self {
        let environment = environment.into();
        assert!(!environment.is_empty(), "LabelSet requires a non-empty environment");
        Self { environment, pairs: Vec::new() }
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Sets `key` to `value`, overwriting in place if present, else
    /// appending. `key == "environment"` is rejected by callers at
    /// configuration time (§4.2); this method does not re-check it on every
    /// call since it runs on the hot parsing path.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if let Some(existing) = self.pairs.iter_mut().find(|(k, _)| *k == key) {
            existing.1 = value;
        } else {
            self.pairs.push((key, value));
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Renders the Prometheus label-list body: `environment="..."[,le="..."][,k="v"...]`.
    pub fn render(&self, le: Option<&str>) -> String {
        let mut out = String::with_capacity(32 + self.pairs.len() * 16);
        out.push_str("environment=\"");
        escape_into(&mut out, &self.environment);
        out.push('"');

        if let Some(le) = le {
            out.push_str(",le=\"");
            escape_into(&mut out, le);
            out.push('"');
        }

        for (k, v) in &self.pairs {
            out.push(',');
            out.push_str(k);
            out.push_str("=\"");
            escape_into(&mut out, v);
            out.push('"');
        }

        out
    }
}

fn escape_into(out: &mut String, value: &str) {
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '"' => out.push_str("\\\""),
            c => {
                let _ = write!(out, "{c}");
            }
        }
    }
}

impl PartialEq for LabelSet {
    fn eq(&self, other: &Self) -> bool {
        self.environment == other.environment && self.pairs == other.pairs
    }
}

impl Hash for LabelSet {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.environment.hash(state);
        self.pairs.hash(state);
    }
}
