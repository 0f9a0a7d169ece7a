use std::sync::Arc;
use std::time::Duration;

use csv_prom_metrics::{decode_line, ColumnReader, LabelSet, MetricRegistry, ParsedLine};
use quanta::Clock;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::error::ParserExit;

const SEPARATOR: char = ' ';
const QUOTE: char = '"';

/// Bytes consumed are flushed to `ssh_bytes_in` at least this often, so a
/// long-idle-but-connected stream doesn't hide its traffic until the next
/// record (spec §4.3 point 4).
const BYTES_FLUSH_THRESHOLD: u64 = 4096;

/// Pulls CSV records from a tailed SSH stream with an inter-line read
/// timeout, updating the shared `MetricRegistry` as it goes (spec §4.3).
pub struct LogParser {
    environment: String,
    target: String,
    readers: Arc<Vec<ColumnReader>>,
    registry: Arc<MetricRegistry>,
    read_timeout: Duration,
    clock: Clock,
    bytes_since_flush: u64,
}

impl LogParser {
    pub fn new(
        environment: String,
        target: String,
        readers: Arc<Vec<ColumnReader>>,
        registry: Arc<MetricRegistry>,
        read_timeout: Duration,
    ) -> Self {
        Self { environment, target, readers, registry, read_timeout, clock: Clock::new(), bytes_since_flush: 0 }
    }

    /// Consumes CSV records from `input` until end-of-stream, cancellation,
    /// or starvation. Honours cancellation at every suspension point (spec
    /// §4.3 point 5, §5 "Cancellation").
    pub async fn run<R>(&mut self, mut input: R, cancel: &CancellationToken) -> ParserExit
    where
        R: AsyncBufRead + Unpin,
    {
        loop {
            let mut raw_line = Vec::new();
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.flush_bytes();
                    return ParserExit::Cancelled;
                }
                outcome = tokio::time::timeout(self.read_timeout, input.read_until(b'\n', &mut raw_line)) => outcome,
            };

            let io_result = match read {
                Ok(io_result) => io_result,
                Err(_elapsed) => {
                    warn!(
                        environment = %self.environment, target = %self.target,
                        "stream_starvation: no record read within the configured timeout"
                    );
                    self.flush_bytes();
                    return ParserExit::StreamStarvation;
                }
            };

            let bytes_read = match io_result {
                Ok(n) => n,
                Err(err) => {
                    error!(
                        environment = %self.environment, target = %self.target, error = %err,
                        "unexpected_error reading from SSH stream"
                    );
                    self.flush_bytes();
                    return ParserExit::StreamStarvation;
                }
            };

            if bytes_read == 0 {
                self.flush_bytes();
                return ParserExit::EndOfStream;
            }

            self.bytes_since_flush += bytes_read as u64;
            if self.bytes_since_flush >= BYTES_FLUSH_THRESHOLD {
                self.flush_bytes();
            }

            let text = String::from_utf8_lossy(&raw_line);
            let trimmed = text.trim_end_matches(['\n', '\r']);
            if trimmed.is_empty() {
                continue;
            }

            self.parse_record(trimmed);
        }
    }

    fn parse_record(&self, line: &str) {
        let fields = decode_line(line, SEPARATOR, QUOTE);
        if fields.len() != self.readers.len() {
            self.record_parse_error();
            return;
        }

        let mut parsed = ParsedLine::new(&self.environment);
        for (column, (reader, field)) in self.readers.iter().zip(fields.iter()).enumerate() {
            // Any ColumnReader failure other than its own declared parse
            // error would be a bug in this crate, not operator data; since
            // `ColumnReader::apply` never panics, "any exception other than
            // parse_error" (spec §4.3 point 7) can't actually arise here.
            if reader.apply(column, field, &mut parsed).is_err() {
                self.record_parse_error();
                return;
            }
        }

        self.record_success(parsed);
    }

    fn record_parse_error(&self) {
        let now = self.clock.now();
        let env_only = LabelSet::new(&self.environment);
        self.registry.parser_errors().with_labels(&env_only).add(1.0, now).ok();

        let mut env_and_target = LabelSet::new(&self.environment);
        env_and_target.set("target", self.target.clone());
        self.registry.parser_errors_per_target().with_labels(&env_and_target).add(1.0, now).ok();
    }

    fn record_success(&self, parsed: ParsedLine) {
        let now = self.clock.now();
        self.registry.lines_parsed().with_labels(&parsed.labels).add(1.0, now).ok();

        let mut with_target = parsed.labels.clone();
        with_target.set("target", self.target.clone());
        self.registry.lines_parsed_per_target().with_labels(&with_target).add(1.0, now).ok();

        for (name, value) in &parsed.metrics {
            match self.registry.get(name) {
                Some(family) => {
                    if let Err(err) = family.with_labels(&parsed.labels).add(*value, now) {
                        error!(metric = %name, value = *value, error = %err, "unexpected_error: failed to update instrument");
                    }
                }
                None => {
                    // Spec §4.3 point 3: unknown metric names cannot arise
                    // from a validated configuration, so reaching this arm
                    // means `resolve()` registered a reader without its
                    // matching family -- a programming error, not operator
                    // data.
                    error!(metric = %name, "unexpected_error: parsed metric has no registered family");
                }
            }
        }
    }

    fn flush_bytes(&mut self) {
        if self.bytes_since_flush == 0 {
            return;
        }
        let now = self.clock.now();
        let env_only = LabelSet::new(&self.environment);
        self.registry.ssh_bytes_in().with_labels(&env_only).add(self.bytes_since_flush as f64, now).ok();
        self.bytes_since_flush = 0;
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::time::Duration as StdDuration;

    use csv_prom_metrics::{Kind, MetricFamily, Resilience};

    use super::*;

    fn registry_with_bytes_family() -> Arc<MetricRegistry> {
        MetricRegistry::new(None, StdDuration::from_secs(60), 1, 10)
    }

    #[tokio::test]
    async fn parses_apache_style_line_and_increments_counters() {
        let registry = registry_with_bytes_family();
        registry
            .register_family(Arc::new(MetricFamily::new(
                "body_bytes_sent_total".to_string(),
                "help".to_string(),
                Kind::Counter,
                Resilience::Weak,
            )))
            .unwrap();

        let readers = Arc::new(vec![
            ColumnReader::Label("remote_host".to_string()),
            ColumnReader::Ignore,
            ColumnReader::Label("remote_user".to_string()),
            ColumnReader::Ignore,
            ColumnReader::RequestHeader,
            ColumnReader::Label("status".to_string()),
            ColumnReader::ClfNumber("body_bytes_sent_total".to_string()),
        ]);

        let mut parser = LogParser::new(
            "prod".to_string(),
            "ssh://host/access.log".to_string(),
            readers,
            registry.clone(),
            StdDuration::from_millis(500),
        );

        let input = tokio::io::BufReader::new(Cursor::new(
            b"1.2.3.4 - alice - \"GET /a?b=1 HTTP/1.1\" 200 123\n".to_vec(),
        ));
        let cancel = CancellationToken::new();
        let exit = parser.run(input, &cancel).await;
        assert_eq!(exit, ParserExit::EndOfStream);

        let mut buf = String::new();
        registry.expose_to(&mut buf);
        assert!(buf.contains("body_bytes_sent_total{environment=\"prod\""));
        assert!(buf.contains("lines_parsed_total{environment=\"prod\""));
    }

    #[tokio::test]
    async fn wrong_column_count_increments_parser_errors_only() {
        let registry = registry_with_bytes_family();
        let readers = Arc::new(vec![ColumnReader::Label("a".to_string()), ColumnReader::Label("b".to_string())]);
        let mut parser = LogParser::new(
            "prod".to_string(),
            "ssh://host/access.log".to_string(),
            readers,
            registry.clone(),
            StdDuration::from_millis(500),
        );

        let input = tokio::io::BufReader::new(Cursor::new(b"only-one-field\n".to_vec()));
        let cancel = CancellationToken::new();
        parser.run(input, &cancel).await;

        let mut buf = String::new();
        registry.expose_to(&mut buf);
        assert!(buf.contains("parser_errors_total{environment=\"prod\"} 1"));
        assert!(!buf.contains("lines_parsed_total"));
    }

    #[tokio::test]
    async fn cancellation_stops_the_parser_promptly() {
        let registry = registry_with_bytes_family();
        let readers = Arc::new(Vec::new());
        let mut parser = LogParser::new(
            "prod".to_string(),
            "ssh://host/access.log".to_string(),
            readers,
            registry,
            StdDuration::from_secs(30),
        );

        // A reader that never produces a line; cancellation must win the race.
        let (_tx, rx) = tokio::io::duplex(16);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let exit = parser.run(tokio::io::BufReader::new(rx), &cancel).await;
        assert_eq!(exit, ParserExit::Cancelled);
    }
}
