//! Progress reporting for the CLI
//!
//! Spinner while a scan or drain runs, and plain summaries when it ends.

use crate::bulk::BulkReport;
use crate::coordinator::StatusSnapshot;
use crate::worker::PoolSummary;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Live counters shown by the spinner
#[derive(Debug, Clone, Copy, Default)]
pub struct RunProgress {
    pub queued: u64,
    pub processed: u64,
    pub failed: u64,
    pub in_flight: usize,
    pub jobs: usize,
    pub elapsed: Duration,
}

impl RunProgress {
    /// Finished items per second
    pub fn rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            (self.processed + self.failed) as f64 / secs
        } else {
            0.0
        }
    }
}

/// Spinner with a status line
pub struct ProgressReporter {
    bar: ProgressBar,
}

impl ProgressReporter {
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner();

        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .expect("Invalid progress template")
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
        );

        bar.enable_steady_tick(Duration::from_millis(100));

        Self { bar }
    }

    /// Update the status line
    pub fn update(&self, progress: &RunProgress) {
        let msg = format!(
            "Queued: {} | Done: {} | Failed: {} | Rate: {:.0}/s | Workers: {}/{}",
            format_number(progress.queued),
            format_number(progress.processed),
            format_number(progress.failed),
            progress.rate(),
            progress.in_flight,
            progress.jobs,
        );
        self.bar.set_message(msg);
    }

    pub fn set_status(&self, status: &str) {
        self.bar.set_message(status.to_string());
    }

    pub fn finish(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Format a number with thousands separators
pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut out = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().enumerate() {
        if i > 0 && (s.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

fn rule() {
    println!("{}", style("─".repeat(50)).dim());
}

/// Print a header at the start of a command
pub fn print_header(command: &str, backend: &str, queue: &str) {
    println!();
    println!(
        "{} {} {}",
        style("extract-pipeline").cyan().bold(),
        env!("CARGO_PKG_VERSION"),
        style(command).bold()
    );
    rule();
    println!("  {} {}", style("Backend:").bold(), backend);
    println!("  {} {}", style("Queue:").bold(), queue);
    println!();
}

/// Print the outcome of a scan
pub fn print_scan_summary(queued: u64, skipped: u64, errors: u64, duration: Duration) {
    println!();
    println!("{}", style("Scan Complete").green().bold());
    rule();
    println!("  {} {}", style("Queued:").bold(), format_number(queued));
    println!("  {} {}", style("Skipped:").bold(), format_number(skipped));
    if errors > 0 {
        println!("  {} {}", style("Errors:").yellow().bold(), format_number(errors));
    }
    println!("  {} {:.1}s", style("Duration:").bold(), duration.as_secs_f64());
    println!();
}

/// Print the outcome of a drain. Failures are listed apart from successes.
pub fn print_drain_summary(drained: u64, pool: &PoolSummary) {
    println!();
    println!("{}", style("Drain Complete").green().bold());
    rule();
    println!("  {} {}", style("Drained:").bold(), format_number(drained));
    println!("  {} {}", style("Processed:").bold(), format_number(pool.processed));
    if pool.skipped > 0 {
        println!("  {} {}", style("Skipped:").bold(), format_number(pool.skipped));
    }
    if pool.failed > 0 {
        println!("  {} {}", style("Failed:").yellow().bold(), format_number(pool.failed));
    }
    if pool.report_errors > 0 {
        println!(
            "  {} {}",
            style("Report errors:").red().bold(),
            format_number(pool.report_errors)
        );
    }
    println!("  {} {:.1}s", style("Duration:").bold(), pool.duration.as_secs_f64());
    println!();
}

/// Print the outcome of a bulk run
pub fn print_bulk_summary(operation: &str, report: &BulkReport) {
    println!();
    println!("{} {}", style("Bulk").green().bold(), style(operation).green().bold());
    rule();
    println!("  {} {}", style("Fetched:").bold(), format_number(report.fetched));
    println!("  {} {}", style("Processed:").bold(), format_number(report.processed));
    if report.failed > 0 {
        println!("  {} {}", style("Failed:").yellow().bold(), format_number(report.failed));
    }
    println!("  {} {}", style("Pages:").bold(), format_number(report.pages));
    println!("  {} {:.1}s", style("Duration:").bold(), report.duration.as_secs_f64());
    println!();
}

/// Print a status snapshot as text
pub fn print_status(status: &StatusSnapshot) {
    println!("{} {}", style("Queue").bold(), status.queue);
    rule();
    println!("  {} {}", style("Backend:").bold(), status.backend);
    println!("  {} {}", style("Waiting:").bold(), format_number(status.waiting as u64));
    println!("  {} {}", style("Processed:").bold(), format_number(status.processed as u64));
    println!(
        "  {} {} ({})",
        style("Reports:").bold(),
        format_number(status.reported as u64),
        status.reports
    );
    if let Some(next) = &status.next {
        println!("  {} {}", style("Next:").bold(), next.display());
    }
    if let Some(sealed) = status.sealed {
        println!("  {} {}", style("Scan finished:").bold(), if sealed { "yes" } else { "no" });
    }
    println!("  {} {}", style("At:").bold(), status.taken_at.to_rfc3339());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1234567), "1,234,567");
    }

    #[test]
    fn test_rate() {
        let progress = RunProgress {
            processed: 90,
            failed: 10,
            elapsed: Duration::from_secs(10),
            ..RunProgress::default()
        };
        assert_eq!(progress.rate(), 10.0);
        assert_eq!(RunProgress::default().rate(), 0.0);
    }
}
