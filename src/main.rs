//! llx - turn a natural-language request into a shell command.
//!
//! Hands the prompt to the resident `llxd` daemon, starting it on first use,
//! and streams the answer to stdout.

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::Parser;
use llx::client::{self, input, render::Highlighter, DaemonManager};
use llx::config::{Config, SOCKET_PATH};
use std::io::{self, Write};
use std::path::Path;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "llx")]
#[command(version, about = "Turn a natural-language request into a shell command")]
#[command(long_about = "Turn a natural-language request into a shell command.\n\nWithout a PROMPT, reads a multi-line prompt from stdin terminated by two blank lines.")]
struct Cli {
    /// The request, e.g. "list files in the current directory"
    #[arg(value_name = "PROMPT")]
    prompt: Option<String>,

    /// Ask the running daemon to shut down
    #[arg(long, conflicts_with = "prompt")]
    shutdown: bool,

    /// Model to load if the daemon has to be started
    #[arg(short = 'm', long, value_name = "ID")]
    model: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            };
        }
    };

    // Stdout carries the answer, so diagnostics stay on stderr.
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let socket_path = Path::new(SOCKET_PATH);

    if cli.shutdown {
        return shutdown(socket_path).await;
    }

    let prompt = match cli.prompt {
        Some(prompt) => prompt,
        None => {
            if atty::is(atty::Stream::Stdin) {
                eprintln!("Enter your prompt (terminate with two blank lines):");
            }
            input::read_prompt(io::stdin().lock()).context("Failed to read prompt")?
        }
    };

    if prompt.trim().is_empty() {
        eprintln!("Error: Empty prompt");
        return Ok(ExitCode::FAILURE);
    }

    let config = Config::load().context("Failed to load configuration")?;
    let manager = DaemonManager::new(&config);
    if !manager.ensure_running(cli.model.as_deref()).await {
        eprintln!("Failed to start daemon");
        return Ok(ExitCode::FAILURE);
    }

    query(socket_path, &prompt).await
}

async fn shutdown(socket_path: &Path) -> Result<ExitCode> {
    if !client::is_running(socket_path).await {
        eprintln!("Failed to connect to llxd. Make sure the daemon is running.");
        return Ok(ExitCode::FAILURE);
    }

    let reply = client::send_shutdown(socket_path)
        .await
        .context("Failed to shut down llxd")?;
    print!("{reply}");
    Ok(ExitCode::SUCCESS)
}

async fn query(socket_path: &Path, prompt: &str) -> Result<ExitCode> {
    let mut highlighter = Highlighter::new(atty::is(atty::Stream::Stdout));
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut last_byte = None;

    let received = client::send_prompt(socket_path, prompt, |chunk| {
        last_byte = chunk.last().copied();
        highlighter.feed_bytes(chunk, &mut out)
    })
    .await
    .context("Failed to get response from llxd")?;

    highlighter.finish(&mut out)?;

    if received == 0 {
        eprintln!("Failed to get response from llxd: the daemon closed the connection");
        return Ok(ExitCode::FAILURE);
    }
    if last_byte != Some(b'\n') {
        writeln!(out)?;
    }
    out.flush()?;

    Ok(ExitCode::SUCCESS)
}
