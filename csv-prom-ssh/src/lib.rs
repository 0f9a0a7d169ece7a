//! Connects to remote hosts over SSH, tails a file with a follow-by-name
//! `tail`, and feeds its output through a [`parser::LogParser`] into a
//! shared `MetricRegistry`.
//!
//! This crate owns the two components described in the design's "SSHScraper"
//! and "LogParser" sections; configuration binding (`csv-prom-config`) and
//! the HTTP/process-metrics surface (`csv-prom-exporter`) live in sibling
//! crates.

pub mod error;
pub mod parser;
pub mod scraper;

pub use error::{ParserExit, SshError};
pub use parser::LogParser;
pub use scraper::SSHScraper;
