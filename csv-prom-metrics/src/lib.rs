//! Labeled counters, gauges, histograms, and summaries with a per-family
//! TTL-based eviction policy, exposed in Prometheus text format.
//!
//! This crate carries the data model described in the design's "Data Model"
//! and "Component Design" sections: `LabelSet`, `ColumnReader`/`ParsedLine`
//! for turning a CSV record into observations, and `MetricFamily`/
//! `Instrument`/`MetricRegistry` for aggregating and exposing them. It does
//! not know about SSH, YAML configuration, or HTTP -- those live in sibling
//! crates.

pub mod csv;
pub mod family;
pub mod instrument;
pub mod label;
pub mod reader;
pub mod registry;

pub use csv::decode_line;
pub use family::{exposed_name, validate_base_name, with_inf_sentinel, Kind, MetricFamily, NameError, Resilience, RESERVED_FAMILY_NAMES};
pub use instrument::{format_value, Instrument, InstrumentError};
pub use label::LabelSet;
pub use reader::{ColumnReader, ParseError, ParsedLine};
pub use registry::MetricRegistry;
