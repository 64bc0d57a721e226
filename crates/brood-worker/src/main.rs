//! brood-worker entry point.
//!
//! Usage:
//!   brood-worker             # serve requests on stdin until EOF
//!   brood-worker --tasks     # list registered tasks and exit
//!
//! Stdout carries the wire protocol; logs go to stderr (RUST_LOG applies).

use std::process::ExitCode;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use brood_worker::{register_builtins, TaskRegistry, WorkerRuntime};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let mut registry = TaskRegistry::new();
    register_builtins(&mut registry);

    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        None => match WorkerRuntime::new(registry).run_stdio().await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("Error: {e:?}");
                ExitCode::FAILURE
            }
        },

        Some("--tasks") => {
            for name in registry.names() {
                println!("{name}");
            }
            ExitCode::SUCCESS
        }

        Some("--help" | "-h") => {
            print_help();
            ExitCode::SUCCESS
        }

        Some("--version" | "-V") => {
            println!("brood-worker {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }

        Some(unknown) => {
            eprintln!("Unknown option: {unknown}");
            eprintln!("Run 'brood-worker --help' for usage.");
            ExitCode::FAILURE
        }
    }
}

fn print_help() {
    println!(
        r#"brood-worker v{}

Executes pool tasks: reads request frames on stdin, writes response
frames on stdout. Meant to be spawned by a brood pool, not by hand.

Usage:
  brood-worker             Serve requests until stdin EOF
  brood-worker --tasks     List registered tasks

Options:
  -h, --help               Show this help
  -V, --version            Show version
"#,
        env!("CARGO_PKG_VERSION")
    );
}
