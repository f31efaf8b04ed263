use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process;

use clap::{Parser, ValueEnum};
use relwal::{analyze, AnalysisReport, WalError};

const EXIT_OK: i32 = 0;
const EXIT_CORRUPT: i32 = 10;
const EXIT_FATAL_IO: i32 = 20;

#[derive(Clone, Debug, ValueEnum)]
enum OutputFormatArg {
    Text,
    Json,
}

#[derive(Parser)]
#[command(name = "wal-inspect", about = "Inspect a write-ahead log's consistency")]
struct Cli {
    /// Path to the log file
    log_path: PathBuf,

    /// Run Recovery's Analysis phase only and report what it would do,
    /// instead of printing the full per-record dump
    #[arg(long)]
    dry_run: bool,

    /// Output format for the --dry-run report (ignored for the default dump)
    #[arg(long, value_enum, default_value = "text")]
    format: OutputFormatArg,
}

fn print_text(report: &AnalysisReport) {
    println!("WAL inspection summary:");
    match report.checkpoint_offset {
        Some(off) => println!("  checkpoint pointer: {off}"),
        None => println!("  checkpoint pointer: none"),
    }
    println!("  updates seen: {}", report.update_count);
    println!("  committed txs: {}", report.committed.len());
    println!("  aborted txs: {}", report.aborted.len());
    println!("  live at EOF: {}", report.live_at_eof.len());
    for tid in &report.live_at_eof {
        println!("  - tid {tid} never committed or aborted");
    }
}

fn json_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 8);
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

fn join_tids(tids: &[u64]) -> String {
    tids.iter()
        .map(|t| t.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn print_json(report: &AnalysisReport) {
    let status = if report.live_at_eof.is_empty() {
        "ok"
    } else {
        "warning"
    };
    println!(
        "{{\"schema_version\":1,\"checkpoint_offset\":{},\"update_count\":{},\"committed\":[{}],\"aborted\":[{}],\"live_at_eof\":[{}],\"status\":\"{}\"}}",
        report
            .checkpoint_offset
            .map(|o| o.to_string())
            .unwrap_or_else(|| "null".to_string()),
        report.update_count,
        join_tids(&report.committed),
        join_tids(&report.aborted),
        join_tids(&report.live_at_eof),
        status,
    );
}

fn report_corrupt(format: &OutputFormatArg, msg: &str) -> ! {
    match format {
        OutputFormatArg::Text => eprintln!("CORRUPT: {msg}"),
        OutputFormatArg::Json => println!(
            "{{\"schema_version\":1,\"status\":\"corrupt\",\"error\":\"{}\"}}",
            json_escape(msg)
        ),
    }
    process::exit(EXIT_CORRUPT);
}

fn run_dry_run(cli: &Cli) {
    let report = match analyze(&cli.log_path) {
        Ok(report) => report,
        Err(WalError::CorruptLog(msg)) => report_corrupt(&cli.format, &msg),
        Err(e) => {
            eprintln!("ERROR: failed to inspect {}: {}", cli.log_path.display(), e);
            process::exit(EXIT_FATAL_IO);
        }
    };
    match cli.format {
        OutputFormatArg::Text => print_text(&report),
        OutputFormatArg::Json => print_json(&report),
    }
}

/// Opens the log read-only (no exclusive lock, unlike `LogWriter::open`) and
/// prints the full per-record dump, the same shape `LogWriter::print`
/// produces for a live process inspecting itself.
fn run_dump(cli: &Cli) {
    let mut file = match OpenOptions::new().read(true).open(&cli.log_path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("ERROR: failed to open {}: {}", cli.log_path.display(), e);
            process::exit(EXIT_FATAL_IO);
        }
    };
    let mut stdout = std::io::stdout();
    if let Err(e) = relwal::wal::reader::dump(&mut file, &mut stdout) {
        match e {
            WalError::CorruptLog(msg) => report_corrupt(&cli.format, &msg),
            e => {
                eprintln!("ERROR: failed to inspect {}: {}", cli.log_path.display(), e);
                process::exit(EXIT_FATAL_IO);
            }
        }
    }
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if cli.dry_run {
        run_dry_run(&cli);
    } else {
        run_dump(&cli);
    }

    process::exit(EXIT_OK);
}
