//! Terminal rendering for analysis results.

use colored::*;
use console::style;
use std::fs;

use mortem::models::{Confidence, LeakDiagnosis, LeakKind, ReportSummary};
use mortem::pipeline::{AnalysisOutcome, RecordFailure};

pub fn print_banner() {
    println!();
    println!("{}", style("═══════════════════════════════════════════").magenta());
    println!("{}", style("  mortem — memory-leak root-cause analysis").magenta().bold());
    println!("{}", style("═══════════════════════════════════════════").magenta());
    println!();
}

pub fn format_bytes(bytes: u64) -> String {
    if bytes >= 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{} bytes", bytes)
    }
}

pub fn print_summary(summary: &ReportSummary, shallow: u32, skipped: u32) {
    println!("{}", "Checker summary".cyan().bold());
    println!("{}", "-".repeat(45));
    print_summary_row("definitely lost", summary.definitely_lost, true);
    print_summary_row("indirectly lost", summary.indirectly_lost, true);
    print_summary_row("possibly lost", summary.possibly_lost, false);
    print_summary_row("still reachable", summary.still_reachable, false);
    if shallow > 0 {
        println!(
            "{}",
            format!("  {} record(s) acknowledged without deep analysis", shallow).dimmed()
        );
    }
    if skipped > 0 {
        println!(
            "{}",
            format!("  ⚠️  {} malformed block(s) skipped", skipped).yellow()
        );
    }
    println!();
}

fn print_summary_row(label: &str, bytes: u64, severe: bool) {
    let value = format_bytes(bytes);
    let value = if bytes == 0 {
        value.green()
    } else if severe {
        value.red().bold()
    } else {
        value.yellow()
    };
    println!("  {:<18} {}", label, value);
}

pub fn print_diagnosis(diag: &LeakDiagnosis, index: usize, total: usize) {
    let kind_label = match diag.kind {
        LeakKind::MissingFree => "NEVER FREED".red().bold(),
        LeakKind::PathLossByReassignment => "POINTER PATH LOST".red().bold(),
        LeakKind::ContainerFreedFirst => "CONTAINER FREED FIRST".red().bold(),
    };
    println!(
        "{} {}",
        format!("Leak {}/{}", index, total).cyan().bold(),
        kind_label
    );
    println!(
        "  {} {} in {} block(s)",
        "size:".dimmed(),
        format_bytes(diag.bytes),
        diag.blocks
    );
    println!(
        "  {} {}:{} in {}()",
        "site:".dimmed(),
        diag.site.file,
        diag.site.line,
        diag.site.function
    );
    if let Some(text) = source_line(&diag.site.file, diag.site.line) {
        println!("  {} {}", format!("{:>4} |", diag.site.line).blue(), text.trim_end());
    }
    if !diag.roots_at_leak.is_empty() {
        println!(
            "  {} {}",
            "roots at leak:".dimmed(),
            diag.roots_at_leak.join(", ").yellow()
        );
    }
    if diag.confidence == Confidence::Static {
        println!(
            "  {}",
            "⚠️  static fallback: branches and loops were not observed".yellow()
        );
    }
    if !diag.trail.is_empty() {
        println!("  {}", "ownership trail:".dimmed());
        for step in &diag.trail {
            println!("    {}", step.dimmed());
        }
    }
    if let Some(narrative) = &diag.narrative {
        println!();
        println!("  {}", "analysis".cyan().bold());
        for line in narrative.lines() {
            println!("  {}", line);
        }
    }
    println!();
}

fn source_line(file: &str, line: u32) -> Option<String> {
    if line == 0 {
        return None;
    }
    let content = fs::read_to_string(file).ok()?;
    content.lines().nth(line as usize - 1).map(str::to_string)
}

pub fn print_failures(failures: &[RecordFailure]) {
    for failure in failures {
        println!(
            "{} loss record {}: {}",
            "❌ inconclusive".red(),
            failure.loss_record_index,
            failure.reason
        );
    }
    if !failures.is_empty() {
        println!();
    }
}

pub fn print_json(outcome: &AnalysisOutcome) {
    #[derive(serde::Serialize)]
    struct JsonOutcome<'a> {
        summary: &'a ReportSummary,
        diagnoses: &'a [LeakDiagnosis],
        failures: Vec<JsonFailure<'a>>,
    }
    #[derive(serde::Serialize)]
    struct JsonFailure<'a> {
        loss_record_index: u32,
        reason: &'a str,
    }
    let payload = JsonOutcome {
        summary: &outcome.summary,
        diagnoses: &outcome.diagnoses,
        failures: outcome
            .failures
            .iter()
            .map(|f| JsonFailure {
                loss_record_index: f.loss_record_index,
                reason: &f.reason,
            })
            .collect(),
    };
    match serde_json::to_string_pretty(&payload) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("{} {}", "❌ JSON rendering failed:".red(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(96), "96 bytes");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }
}
