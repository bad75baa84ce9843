// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Command-line front end for the download bridge.
//!
//! Wires the bundled HTTP backend into the bridge and renders the event
//! stream. Mostly useful as a living example of the library surface; the
//! bridge itself is platform-agnostic.

use std::collections::HashMap;
use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use bgfetch::{BridgeConfig, DownloadBridge, DownloadEvent, DownloadRequest, HttpTransfer, TaskStore};

#[derive(Parser)]
#[command(name = "bgfetch", version, about = "Background download bridge")]
struct Cli {
    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download a file to a destination path
    Get {
        /// Source URL
        url: String,
        /// Destination file path
        destination: String,
        /// Job identifier (defaults to the destination file name)
        #[arg(long)]
        id: Option<String>,
        /// Opaque metadata echoed back in events (conventionally JSON)
        #[arg(long, default_value = "{}")]
        metadata: String,
        /// Extra request header, `Name: value`. Repeatable.
        #[arg(long = "header")]
        headers: Vec<String>,
    },
    /// List persisted jobs the transfer backend still knows about
    Existing,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::WARN
        })
        .init();

    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn parse_headers(raw: &[String]) -> Result<HashMap<String, String>> {
    raw.iter()
        .map(|entry| {
            let (name, value) = entry
                .split_once(':')
                .ok_or_else(|| anyhow!("header `{}` is not in `Name: value` form", entry))?;
            Ok((name.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

async fn run(command: Command) -> Result<()> {
    let (backend, updates) = HttpTransfer::new();
    let (bridge, mut events) = DownloadBridge::new(
        backend,
        updates,
        TaskStore::default_path(),
        BridgeConfig::default(),
    )?;

    match command {
        Command::Get {
            url,
            destination,
            id,
            metadata,
            headers,
        } => {
            let id = match id {
                Some(id) => id,
                None => std::path::Path::new(&destination)
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(str::to_string)
                    .context("cannot derive a job id from the destination; pass --id")?,
            };

            let mut request = DownloadRequest::new(&id, &url, &destination).with_metadata(metadata);
            request.headers = parse_headers(&headers)?;
            bridge.enqueue(request).await?;

            let bar = ProgressBar::hidden();
            bar.set_style(
                ProgressStyle::with_template(
                    "{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})",
                )?
                .progress_chars("#>-"),
            );

            while let Some(event) = events.recv().await {
                match event {
                    DownloadEvent::Begin { expected_bytes, .. } => {
                        bar.set_length(expected_bytes);
                        bar.set_draw_target(indicatif::ProgressDrawTarget::stderr());
                    }
                    DownloadEvent::Progress {
                        bytes_downloaded, ..
                    } => bar.set_position(bytes_downloaded),
                    DownloadEvent::Done { location, .. } => {
                        bar.finish_and_clear();
                        println!("{}", location);
                        break;
                    }
                    DownloadEvent::Failed { error, .. } => {
                        bar.finish_and_clear();
                        bridge.shutdown().await.ok();
                        return Err(anyhow!(error));
                    }
                }
            }

            bridge.shutdown().await?;
        }
        Command::Existing => {
            let existing = bridge.list_existing().await?;
            if existing.is_empty() {
                println!("no existing downloads");
            } else {
                for download in existing {
                    println!(
                        "{}\t{:?}\t{}/{}\t{}",
                        download.id,
                        download.state,
                        download.bytes_downloaded,
                        download.bytes_total,
                        download.metadata
                    );
                }
            }
            bridge.shutdown().await?;
        }
    }

    Ok(())
}
