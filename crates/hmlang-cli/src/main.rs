//! Command-line driver: parse a program, run the combined HM + GCP
//! analysis, print the root scheme and flow signature.

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use hmlang_infer::{analyze, InferConfig};

#[derive(Parser)]
#[command(name = "hmlang", about = "HM type inference + constant propagation")]
struct Cli {
    /// Program file to analyze.
    file: Option<PathBuf>,

    /// Inline expression to analyze instead of a file.
    #[arg(short = 'e', long = "expr")]
    expr: Option<String>,

    /// Emit the result as JSON.
    #[arg(long)]
    json: bool,

    /// Verbose driver logging.
    #[arg(short, long)]
    verbose: bool,

    /// Run only the HM half.
    #[arg(long, conflicts_with = "gcp_only")]
    hm_only: bool,

    /// Run only the GCP half.
    #[arg(long)]
    gcp_only: bool,

    /// Main-loop iteration guard.
    #[arg(long, default_value_t = 10_000)]
    max_iters: usize,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if cli.verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(std::io::stderr)
            .init();
    }

    let src = match (&cli.file, &cli.expr) {
        (_, Some(e)) => e.clone(),
        (Some(f), None) => match fs::read_to_string(f) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("error: cannot read {}: {e}", f.display());
                return ExitCode::FAILURE;
            }
        },
        (None, None) => {
            eprintln!("error: provide a FILE or -e EXPR");
            return ExitCode::FAILURE;
        }
    };

    let cfg = InferConfig {
        max_iters: cli.max_iters,
        do_hm: !cli.gcp_only,
        do_gcp: !cli.hm_only,
        ..InferConfig::default()
    };

    match analyze(&src, cfg) {
        Ok(a) => {
            if cli.json {
                match serde_json::to_string_pretty(&a) {
                    Ok(j) => println!("{j}"),
                    Err(e) => {
                        eprintln!("error: {e}");
                        return ExitCode::FAILURE;
                    }
                }
            } else {
                println!("type: {}", a.hm);
                println!("flow: {}", a.flow);
                for e in &a.errors {
                    println!("error: {e}");
                }
            }
            if a.errors.is_empty() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
