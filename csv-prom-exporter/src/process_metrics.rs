use csv_prom_metrics::format_value;
use procfs::process::Process;
use tracing::warn;

/// Self-process resource usage (spec §4.10), read fresh on every scrape.
/// Never prefixed, regardless of `global.prefix` (spec §4.6).
pub struct ProcessMetrics {
    cpu_seconds_total: f64,
    resident_memory_bytes: u64,
    start_time_seconds: f64,
}

/// The handful of `/proc/[pid]/stat` fields (`proc(5)`) this module needs,
/// already parsed out of the raw line.
struct StatFields {
    utime_ticks: u64,
    stime_ticks: u64,
    starttime_ticks: u64,
    rss_pages: u64,
}

/// Parses a `/proc/[pid]/stat`-shaped line. Field 2 (`comm`) is parenthesized
/// and may itself contain spaces or parens, so the split point is the *last*
/// `)` on the line rather than whitespace -- everything after it is
/// whitespace-separated and 1-indexed from field 3 onward.
fn parse_stat_line(line: &str) -> Option<StatFields> {
    let rest = &line[line.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();

    // `fields[0]` is field 3 (`state`), so field N is `fields[N - 3]`.
    let field = |n: usize| fields.get(n - 3).copied();

    Some(StatFields {
        utime_ticks: field(14)?.parse().ok()?,
        stime_ticks: field(15)?.parse().ok()?,
        starttime_ticks: field(22)?.parse().ok()?,
        rss_pages: field(24)?.parse().ok()?,
    })
}

impl ProcessMetrics {
    /// Reads `/proc/self/stat` fresh. Returns `None` (and logs at `warn`) on
    /// any failure -- process metrics are never fatal (spec §4.10).
    pub fn sample() -> Option<Self> {
        let sample = Self::try_sample();
        if sample.is_none() {
            warn!("failed to read process metrics from /proc; omitting this scrape's process_* lines");
        }
        sample
    }

    fn try_sample() -> Option<Self> {
        let me = Process::myself().ok()?;
        let raw_stat = std::fs::read_to_string(format!("/proc/{}/stat", me.pid())).ok()?;
        let fields = parse_stat_line(&raw_stat)?;
        let ticks_per_second = procfs::ticks_per_second().ok()? as f64;
        let page_size = procfs::page_size().ok()?;
        let boot_time = procfs::boot_time_secs().ok()?;

        Some(Self::from_fields(&fields, ticks_per_second, page_size, boot_time))
    }

    fn from_fields(fields: &StatFields, ticks_per_second: f64, page_size: u64, boot_time: u64) -> Self {
        Self {
            cpu_seconds_total: (fields.utime_ticks + fields.stime_ticks) as f64 / ticks_per_second,
            resident_memory_bytes: fields.rss_pages * page_size,
            start_time_seconds: boot_time as f64 + (fields.starttime_ticks as f64 / ticks_per_second),
        }
    }

    /// Appends the three process_* lines, each with its own HELP/TYPE
    /// header, matching the unlabeled single-sample style Prometheus client
    /// libraries use for process metrics.
    pub fn write_prometheus(&self, buf: &mut String) {
        write_metric(
            buf,
            "process_cpu_seconds_total",
            "counter",
            "Total user and system CPU time spent in seconds.",
            self.cpu_seconds_total,
        );
        write_metric(
            buf,
            "process_resident_memory_bytes",
            "gauge",
            "Resident memory size in bytes.",
            self.resident_memory_bytes as f64,
        );
        write_metric(
            buf,
            "process_start_time_seconds",
            "gauge",
            "Start time of the process since unix epoch in seconds.",
            self.start_time_seconds,
        );
    }
}

fn write_metric(buf: &mut String, name: &str, type_str: &str, help: &str, value: f64) {
    buf.push_str("# HELP ");
    buf.push_str(name);
    buf.push(' ');
    buf.push_str(help);
    buf.push('\n');
    buf.push_str("# TYPE ");
    buf.push_str(name);
    buf.push(' ');
    buf.push_str(type_str);
    buf.push('\n');
    buf.push_str(name);
    buf.push(' ');
    buf.push_str(&format_value(value));
    buf.push('\n');
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_metric_emits_header_and_unlabeled_value() {
        let mut buf = String::new();
        write_metric(&mut buf, "process_start_time_seconds", "gauge", "help text", 12345.0);
        assert_eq!(
            buf,
            "# HELP process_start_time_seconds help text\n# TYPE process_start_time_seconds gauge\nprocess_start_time_seconds 12345\n"
        );
    }

    // comm field deliberately contains a space and a closing paren to
    // exercise the last-`)` split.
    const FIXTURE_STAT_LINE: &str =
        "1234 (some proc)) S 1 1000 1000 0 -1 4194560 100 0 0 0 1500 300 0 0 20 0 4 0 987654 123456789 4096";

    #[test]
    fn parse_stat_line_splits_past_parenthesized_comm() {
        let fields = parse_stat_line(FIXTURE_STAT_LINE).unwrap();
        assert_eq!(fields.utime_ticks, 1500);
        assert_eq!(fields.stime_ticks, 300);
        assert_eq!(fields.starttime_ticks, 987654);
        assert_eq!(fields.rss_pages, 4096);
    }

    #[test]
    fn parse_stat_line_rejects_truncated_input() {
        assert!(parse_stat_line("1234 (sh) S 1 1000").is_none());
        assert!(parse_stat_line("no closing paren here").is_none());
    }

    #[test]
    fn from_fields_computes_expected_metrics() {
        let fields = parse_stat_line(FIXTURE_STAT_LINE).unwrap();
        let sample = ProcessMetrics::from_fields(&fields, 100.0, 4096, 1_000_000_000);

        assert_eq!(sample.cpu_seconds_total, 18.0);
        assert_eq!(sample.resident_memory_bytes, 16_777_216);
        assert_eq!(sample.start_time_seconds, 1_000_009_876.54);
    }
}
