//! mortem CLI - analyze C executables for memory-leak root causes.
//!
//! Clean split: the `mortem` library does the analysis and never prints;
//! this binary owns arguments, exit codes, rendering, and the optional
//! LLM narration.

mod narrate;
mod render;

use clap::{Parser, Subcommand};
use colored::*;
use console::style;
use inquire::{Password, Select};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use mortem::checker;
use mortem::config::{self, AnalysisConfig, CancelFlag};
use mortem::context::SourceCache;
use mortem::error::{ConfigError, MortemError};
use mortem::models::LeakDiagnosis;
use mortem::pipeline::{AnalysisOutcome, Analyzer};

use narrate::{NarrativeRequest, Narrator, SourceExcerpt};

// Exit codes for the analyze flow.
const EXIT_NO_LEAKS: u8 = 0;
const EXIT_LEAKS: u8 = 1;
const EXIT_FAILURE: u8 = 2;
const EXIT_MISCONFIG: u8 = 3;

#[derive(Parser)]
#[command(name = "mortem")]
#[command(about = "🔎 Post-mortem root-cause analysis for C memory leaks", long_about = None)]
struct Cli {
    /// Emit machine-readable diagnosis records
    #[arg(long, global = true)]
    json: bool,

    /// Skip the LLM narrator entirely
    #[arg(long, global = true)]
    no_narrative: bool,

    /// Memory-checker binary
    #[arg(long, global = true)]
    checker: Option<String>,

    /// Debugger binary
    #[arg(long, global = true)]
    debugger: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Store the narrator API key (owner-only file permissions)
    Configure,

    /// Analyze an executable: mortem <executable> [args...]
    #[command(external_subcommand)]
    Analyze(Vec<String>),
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let code = match &cli.command {
        Command::Configure => run_configure(),
        Command::Analyze(argv) => run_analyze(&cli, argv),
    };
    ExitCode::from(code)
}

fn print_error(message: &str) {
    eprintln!("\n{} {}\n", "Error:".red().bold(), message);
}

// ═══════════════════════════════════════════════════════════════════════════
// configure
// ═══════════════════════════════════════════════════════════════════════════

fn run_configure() -> u8 {
    render::print_banner();
    let key = Password::new("🔑 Narrator API key:")
        .without_confirmation()
        .with_help_message("stored with owner-only read/write")
        .prompt();
    let key = match key {
        Ok(k) if !k.trim().is_empty() => k,
        Ok(_) => {
            print_error("the key cannot be empty");
            return EXIT_MISCONFIG;
        }
        Err(_) => {
            println!("{}", style("❌ Cancelled").red());
            return EXIT_MISCONFIG;
        }
    };
    match config::store_api_key(&key) {
        Ok(path) => {
            println!(
                "{} key stored in {}",
                style("✓").green(),
                style(path.display()).cyan()
            );
            EXIT_NO_LEAKS
        }
        Err(e) => {
            print_error(&e.to_string());
            EXIT_MISCONFIG
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// analyze
// ═══════════════════════════════════════════════════════════════════════════

fn run_analyze(cli: &Cli, argv: &[String]) -> u8 {
    let Some((executable, args)) = argv.split_first() else {
        print_error("no executable given");
        return EXIT_MISCONFIG;
    };
    let executable = PathBuf::from(executable);

    let mut cfg = AnalysisConfig::default();
    if let Some(checker_bin) = &cli.checker {
        cfg.checker = checker_bin.clone();
    }
    if let Some(debugger_bin) = &cli.debugger {
        if !checker::binary_available(debugger_bin) {
            print_error(
                &ConfigError::DebuggerMissing {
                    name: debugger_bin.clone(),
                }
                .to_string(),
            );
            return EXIT_MISCONFIG;
        }
        cfg.debugger = debugger_bin.clone();
    }
    let cfg = match cfg.from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            print_error(&e.to_string());
            return EXIT_MISCONFIG;
        }
    };

    // Narration needs a key only when a transport is actually configured.
    let api_key = config::load_api_key();
    let narrator: Box<dyn Narrator> = if cli.no_narrative {
        Box::new(narrate::OfflineNarrator)
    } else {
        if std::env::var(narrate::ENV_NARRATOR_CMD).is_ok() && api_key.is_none() {
            print_error(&ConfigError::MissingKey.to_string());
            return EXIT_MISCONFIG;
        }
        narrate::from_env(api_key.as_deref())
    };

    if !cli.json {
        render::print_banner();
    }

    let analyzer = Analyzer::new(cfg);
    let cancel = CancelFlag::new();
    match analyze_once(&analyzer, &executable, args, &cancel, narrator.as_ref()) {
        Ok(outcome) => present(cli, &analyzer, &executable, args, &cancel, outcome),
        Err(e) => exit_code_for(&e),
    }
}

fn analyze_once(
    analyzer: &Analyzer,
    executable: &Path,
    args: &[String],
    cancel: &CancelFlag,
    narrator: &dyn Narrator,
) -> Result<AnalysisOutcome, MortemError> {
    let report_text = checker::run_checker(analyzer.config(), executable, args)?;
    let mut outcome = analyzer.analyze_report(&report_text, executable, args, cancel)?;
    let sources = SourceCache::new(analyzer.config().search_root.clone());
    for diagnosis in &mut outcome.diagnoses {
        attach_narrative(diagnosis, &report_text, &sources, narrator);
    }
    Ok(outcome)
}

/// Ask the collaborator for prose. Failures only cost the prose.
fn attach_narrative(
    diagnosis: &mut LeakDiagnosis,
    report_text: &str,
    sources: &SourceCache,
    narrator: &dyn Narrator,
) {
    let excerpts = match sources.function_at(&diagnosis.site.file, diagnosis.site.line) {
        Ok(view) => vec![SourceExcerpt {
            function: view.name.clone(),
            file: view.file.clone(),
            code: view
                .body_lines
                .iter()
                .map(|(n, t)| format!("{n}: {t}"))
                .collect::<Vec<_>>()
                .join("\n"),
        }],
        Err(_) => Vec::new(),
    };
    let mut excerpt_limit = 2000.min(report_text.len());
    while !report_text.is_char_boundary(excerpt_limit) {
        excerpt_limit -= 1;
    }
    let request = NarrativeRequest::new(
        report_text[..excerpt_limit].to_string(),
        excerpts,
        diagnosis.clone(),
    );
    if let Ok(narrative) = narrator.narrate(&request) {
        diagnosis.narrative = Some(narrative);
    }
}

fn present(
    cli: &Cli,
    analyzer: &Analyzer,
    executable: &Path,
    args: &[String],
    cancel: &CancelFlag,
    mut outcome: AnalysisOutcome,
) -> u8 {
    if cli.json {
        render::print_json(&outcome);
        return verdict_code(&outcome);
    }

    loop {
        render::print_summary(
            &outcome.summary,
            outcome.shallow_records,
            outcome.skipped_malformed,
        );
        render::print_failures(&outcome.failures);

        if outcome.diagnoses.is_empty() && !outcome.has_leaks() {
            println!("{}", "✅ No memory leaks detected.".green().bold());
            return verdict_code(&outcome);
        }

        let total = outcome.diagnoses.len();
        for (i, diagnosis) in outcome.diagnoses.iter().enumerate() {
            render::print_diagnosis(diagnosis, i + 1, total);
        }

        if !console::user_attended() {
            return verdict_code(&outcome);
        }

        let choice = Select::new(
            "Next step:",
            vec!["Re-check after fixing", "Quit"],
        )
        .with_help_message("↑↓ to move, Enter to select")
        .prompt();
        match choice {
            Ok("Re-check after fixing") => {
                let previous = outcome.diagnoses.len();
                match analyze_once(
                    analyzer,
                    executable,
                    args,
                    cancel,
                    &narrate::OfflineNarrator,
                ) {
                    Ok(new_outcome) => {
                        let now = new_outcome.diagnoses.len();
                        if now < previous {
                            println!(
                                "{}",
                                format!("✓ {} leak(s) resolved", previous - now).green().bold()
                            );
                        } else {
                            println!("{}", format!("still {} leak(s) detected", now).red());
                        }
                        outcome = new_outcome;
                    }
                    Err(e) => {
                        print_error(&e.to_string());
                        return exit_code_for(&e);
                    }
                }
            }
            _ => return verdict_code(&outcome),
        }
    }
}

fn verdict_code(outcome: &AnalysisOutcome) -> u8 {
    if !outcome.diagnoses.is_empty() {
        EXIT_LEAKS
    } else if !outcome.failures.is_empty() {
        EXIT_FAILURE
    } else if outcome.has_leaks() {
        EXIT_LEAKS
    } else {
        EXIT_NO_LEAKS
    }
}

fn exit_code_for(error: &MortemError) -> u8 {
    print_error(&error.to_string());
    match error {
        MortemError::Config(_) => EXIT_MISCONFIG,
        MortemError::Parse(_) | MortemError::Trace(_) => EXIT_FAILURE,
    }
}
