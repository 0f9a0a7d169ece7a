use std::collections::HashMap;

use crate::label::LabelSet;

/// A transient buffer carrying the evolving `LabelSet` and the metric
/// observations gathered from a single CSV line (spec §3 "ParsedLine").
#[derive(Clone, Debug)]
pub struct ParsedLine {
    pub labels: LabelSet,
    pub metrics: HashMap<String, f64>,
}

impl ParsedLine {
    pub fn new(environment: &str) -> Self {
        Self { labels: LabelSet::new(environment), metrics: HashMap::new() }
    }
}

/// A single malformed-record condition; dropped by the `LogParser` without a
/// partial update (spec §4.2/§4.3).
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ParseError {
    #[error("column count {actual} does not match configured reader count {expected}")]
    ColumnCountMismatch { expected: usize, actual: usize },

    #[error("column {column} ({field:?}) for metric {name:?} is not a valid number")]
    InvalidNumber { column: usize, name: String, field: String },

    #[error("column {column} ({field:?}) is not a valid request header line (expected 3 space-separated parts)")]
    InvalidRequestHeader { column: usize, field: String },
}

/// A pure transformation from one raw CSV field to a mutation of a
/// `ParsedLine` (spec §4.2). Stateless and `Clone`, so the same reader
/// vector can be shared across every `LogParser` for a target's scraper.
#[derive(Clone, Debug)]
pub enum ColumnReader {
    /// Parses the field as a decimal float and records it as metric `name`.
    Number(String),
    /// Like `Number`, but a literal `-` (the Common Log Format "no value"
    /// marker) is treated as `0.0` instead of a parse error.
    ClfNumber(String),
    /// Sets label `name` to the raw field value.
    Label(String),
    /// Splits the field into `"<method> <uri> <version>"` and sets
    /// `request_method`, `request_uri` (query string stripped), and
    /// `request_http_version`.
    RequestHeader,
    /// Consumes the column without effect.
    Ignore,
}

impl ColumnReader {
    pub fn apply(&self, column: usize, field: &str, line: &mut ParsedLine) -> Result<(), ParseError> {
        match self {
            ColumnReader::Label(name) => {
                line.labels.set(name.clone(), field.to_string());
                Ok(())
            }
            ColumnReader::Number(name) => {
                let value = parse_number(field)
                    .ok_or_else(|| ParseError::InvalidNumber {
                        column,
                        name: name.clone(),
                        field: field.to_string(),
                    })?;
                line.metrics.insert(name.clone(), value);
                Ok(())
            }
            ColumnReader::ClfNumber(name) => {
                let value = if field == "-" {
                    0.0
                } else {
                    parse_number(field).ok_or_else(|| ParseError::InvalidNumber {
                        column,
                        name: name.clone(),
                        field: field.to_string(),
                    })?
                };
                line.metrics.insert(name.clone(), value);
                Ok(())
            }
            ColumnReader::RequestHeader => {
                let parts: Vec<&str> = field.split(' ').collect();
                if parts.len() != 3 {
                    return Err(ParseError::InvalidRequestHeader { column, field: field.to_string() });
                }
                let uri = parts[1].split('?').next().unwrap_or(parts[1]);
                line.labels.set("request_method", parts[0].to_string());
                line.labels.set("request_uri", uri.to_string());
                line.labels.set("request_http_version", parts[2].to_string());
                Ok(())
            }
            ColumnReader::Ignore => Ok(()),
        }
    }
}

/// Parses `s` as a decimal float, accepting an optional sign, decimal point,
/// and scientific notation -- i.e. anything Rust's invariant `f64::from_str`
/// accepts, which already matches the spec's description exactly.
fn parse_number(s: &str) -> Option<f64> {
    s.trim().parse::<f64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clf_number_dash_is_zero() {
        let mut line = ParsedLine::new("prod");
        ColumnReader::ClfNumber("bytes".into()).apply(0, "-", &mut line).unwrap();
        assert_eq!(line.metrics["bytes"], 0.0);
    }

    #[test]
    fn clf_number_non_dash_parses_normally() {
        let mut line = ParsedLine::new("prod");
        ColumnReader::ClfNumber("bytes".into()).apply(0, "123", &mut line).unwrap();
        assert_eq!(line.metrics["bytes"], 123.0);
    }

    #[test]
    fn number_rejects_garbage() {
        let mut line = ParsedLine::new("prod");
        assert!(ColumnReader::Number("bytes".into()).apply(0, "nope", &mut line).is_err());
    }

    #[test]
    fn request_header_splits_method_uri_version() {
        let mut line = ParsedLine::new("prod");
        ColumnReader::RequestHeader.apply(0, "GET /a?b=1 HTTP/1.1", &mut line).unwrap();
        assert_eq!(line.labels.get("request_method"), Some("GET"));
        assert_eq!(line.labels.get("request_uri"), Some("/a"));
        assert_eq!(line.labels.get("request_http_version"), Some("HTTP/1.1"));
    }

    #[test]
    fn request_header_wrong_cardinality_is_error() {
        let mut line = ParsedLine::new("prod");
        assert!(ColumnReader::RequestHeader.apply(0, "GET /a", &mut line).is_err());
        assert!(ColumnReader::RequestHeader.apply(0, "GET /a HTTP/1.1 extra", &mut line).is_err());
    }

    #[test]
    fn ignore_is_a_noop() {
        let mut line = ParsedLine::new("prod");
        ColumnReader::Ignore.apply(0, "whatever", &mut line).unwrap();
        assert!(line.metrics.is_empty());
        assert_eq!(line.labels.pairs().count(), 0);
    }
}
