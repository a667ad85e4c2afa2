//! Memory-checker report parser.
//!
//! Consumes the line-oriented human-readable output of a Valgrind-style
//! checker and produces structured loss records. Individual malformed
//! blocks are skipped; only a report with no recoverable structure at all
//! is an error.

use regex::Regex;

use crate::error::ParseError;
use crate::models::{Frame, LeakCategory, LeakRecord, ParsedReport, ReportSummary};

/// Marker printed by the checker when every heap block was freed.
const CLEAN_MARKER: &str = "All heap blocks were freed";

/// Junk lines tolerated inside a block before giving up on its frames.
const RESYNC_ATTEMPTS: u32 = 2;

struct Patterns {
    header: Regex,
    frame: Regex,
    summary_line: Regex,
    banner: Regex,
}

impl Patterns {
    fn new() -> Patterns {
        Patterns {
            header: Regex::new(
                r"^==\d+==\s+([\d,]+)(?:\s+\(([\d,]+) direct, ([\d,]+) indirect\))?\s+bytes in ([\d,]+) blocks? (?:is|are) (?:(definitely|indirectly|possibly) lost|(still reachable)) in loss record ([\d,]+) of ([\d,]+)",
            )
            .expect("Invalid header pattern"),
            frame: Regex::new(
                r"^==\d+==\s+(?:at|by)\s+0x[0-9A-Fa-f]+:\s+(\S+)\s+\((?:([^:()]+):(\d+)|in\s+[^)]*)\)",
            )
            .expect("Invalid frame pattern"),
            summary_line: Regex::new(
                r"^==\d+==\s+(definitely lost|indirectly lost|possibly lost|still reachable):\s+([\d,]+) bytes in ([\d,]+) blocks",
            )
            .expect("Invalid summary pattern"),
            banner: Regex::new(r"^==\d+==").expect("Invalid banner pattern"),
        }
    }
}

fn parse_count(text: &str) -> u64 {
    text.replace(',', "").parse().unwrap_or(0)
}

/// A `==pid==` line with nothing after it: the blank separator between
/// report blocks.
fn is_bare_banner(line: &str) -> bool {
    let t = line.trim();
    t.len() > 4
        && t.starts_with("==")
        && t.ends_with("==")
        && t[2..t.len() - 2].chars().all(|c| c.is_ascii_digit())
}

/// Parse a complete checker report.
///
/// A clean report (no leaks) yields an empty record list, which is the
/// normal outcome, not an error.
pub fn parse_report(text: &str) -> Result<ParsedReport, ParseError> {
    let patterns = Patterns::new();

    if !text.lines().any(|l| patterns.banner.is_match(l)) {
        return Err(ParseError::Malformed {
            detail: "no checker banner lines (==pid==) found".to_string(),
        });
    }

    let lines: Vec<&str> = text.lines().collect();
    let mut records = Vec::new();
    let mut skipped_malformed = 0u32;
    let mut summary = ReportSummary::default();
    let mut saw_summary = false;

    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];

        if let Some(cap) = patterns.header.captures(line) {
            let total: u64 = parse_count(&cap[1]);
            let (bytes_direct, bytes_indirect) = match (cap.get(2), cap.get(3)) {
                (Some(d), Some(ind)) => (parse_count(d.as_str()), parse_count(ind.as_str())),
                _ => (total, 0),
            };
            let blocks = parse_count(&cap[4]) as u32;
            let category = match (cap.get(5).map(|m| m.as_str()), cap.get(6)) {
                (Some("definitely"), _) => LeakCategory::Definitely,
                (Some("indirectly"), _) => LeakCategory::Indirectly,
                (Some("possibly"), _) => LeakCategory::Possibly,
                _ => LeakCategory::StillReachable,
            };
            let loss_record_index = parse_count(&cap[7]) as u32;
            let loss_record_total = parse_count(&cap[8]) as u32;

            // Collect the stack frames that follow, tolerating a bounded
            // number of unrecognized lines before declaring the block over.
            let mut frames = Vec::new();
            let mut junk = 0u32;
            let mut j = i + 1;
            while j < lines.len() && junk <= RESYNC_ATTEMPTS {
                let l = lines[j];
                if patterns.header.captures(l).is_some() {
                    break;
                }
                if let Some(fc) = patterns.frame.captures(l) {
                    let (file, line_no) = match (fc.get(2), fc.get(3)) {
                        (Some(f), Some(n)) => {
                            (f.as_str().to_string(), parse_count(n.as_str()) as u32)
                        }
                        _ => ("?".to_string(), 0),
                    };
                    frames.push(Frame {
                        function: fc[1].to_string(),
                        file,
                        line: line_no,
                    });
                    junk = 0;
                } else if l.trim().is_empty() || is_bare_banner(l) {
                    break;
                } else {
                    junk += 1;
                }
                j += 1;
            }

            if frames.is_empty() {
                skipped_malformed += 1;
            } else {
                records.push(LeakRecord {
                    bytes_direct,
                    bytes_indirect,
                    blocks,
                    loss_record_index,
                    loss_record_total,
                    alloc_stack: frames,
                    category_hint: category,
                });
            }
            i = j;
            continue;
        }

        if let Some(cap) = patterns.summary_line.captures(line) {
            saw_summary = true;
            let bytes = parse_count(&cap[2]);
            match &cap[1] {
                "definitely lost" => summary.definitely_lost = bytes,
                "indirectly lost" => summary.indirectly_lost = bytes,
                "possibly lost" => summary.possibly_lost = bytes,
                "still reachable" => summary.still_reachable = bytes,
                _ => {}
            }
        }

        i += 1;
    }

    summary.total_records = records.len() as u32;

    if records.is_empty() && !saw_summary && !text.contains(CLEAN_MARKER) {
        // The banner was there but nothing else was recoverable. A report
        // that mentions loss records yet yields none is malformed; a quiet
        // run (no leak vocabulary at all) is simply empty.
        if text.contains("loss record") || text.contains("LEAK SUMMARY") {
            return Err(ParseError::Malformed {
                detail: "leak blocks present but none could be recovered".to_string(),
            });
        }
    }

    Ok(ParsedReport {
        summary,
        records,
        skipped_malformed,
    })
}
