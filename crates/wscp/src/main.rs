//! WScp command-line tool.
//!
//! `wscp send` pushes one file to a server; `wscp serve` receives files.

use std::path::PathBuf;

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use wscp::client::{self, ProgressMode};
use wscp::config::Config;
use wscp::protocol::TransferReport;
use wscp::server::{Server, ServerOptions};

/// WScp - secure file copy over WebSockets.
#[derive(Parser, Debug)]
#[command(name = "wscp")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Send a file to a WScp server
    Send {
        /// HTTP proxy to tunnel through (http://[user:pass@]host:port)
        #[arg(short, long)]
        proxy: Option<String>,

        /// Content bytes per chunk
        #[arg(short, long)]
        stride: Option<usize>,

        /// Draw the progress bar with ASCII characters
        #[arg(short, long)]
        ascii: bool,

        /// Print the transfer report as JSON
        #[arg(long)]
        json: bool,

        /// Destination, e.g. ws://user:pass@host:8989/api
        address: String,

        /// File to send
        file: PathBuf,
    },

    /// Receive files from WScp clients
    Serve {
        /// Address to listen on
        #[arg(short, long)]
        listen: Option<String>,

        /// Directory for received files
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// WebSocket endpoint path
        #[arg(long)]
        path: Option<String>,

        /// Replace existing files instead of refusing them
        #[arg(long)]
        overwrite: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };

    // Apply environment variable overrides
    config.apply_env_overrides();

    // Initialize tracing
    let filter = match cli.verbose {
        0 => EnvFilter::try_new(&config.log.level).unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Some(config_path) = &cli.config {
        tracing::debug!("Using config file: {:?}", config_path);
    }

    match cli.command {
        Commands::Send {
            proxy,
            stride,
            ascii,
            json,
            address,
            file,
        } => {
            if let Some(proxy) = proxy {
                config.client.proxy = Some(proxy);
            }
            if let Some(stride) = stride {
                config.transfer.stride = stride;
            }
            config.client.ascii |= ascii;
            config.validate()?;

            println!("[+] Sending: {}", file.display());
            if let Some(proxy) = &config.client.proxy {
                println!("[+] Proxy: {}", client::redacted(proxy));
            }
            println!("[+] Destination: {}", client::redacted(&address));

            let mode = if json {
                ProgressMode::Hidden
            } else if config.client.ascii {
                ProgressMode::Ascii
            } else {
                ProgressMode::Bar
            };

            let report = client::send_file(
                &address,
                &file,
                config.client.proxy.as_deref(),
                config.session_config(),
                mode,
            )
            .await?;

            print_report(&report, json)?;
        }
        Commands::Serve {
            listen,
            output_dir,
            path,
            overwrite,
        } => {
            if let Some(listen) = listen {
                config.server.listen = listen;
            }
            if let Some(output_dir) = output_dir {
                config.server.output_dir = output_dir;
            }
            if let Some(path) = path {
                config.server.path = path;
            }
            config.server.overwrite |= overwrite;
            config.validate()?;

            let server = Server::bind(ServerOptions::from_config(&config))
                .await
                .context("Failed to start server")?;
            println!(
                "[+] Listening on ws://{}{}",
                server.local_addr()?,
                config.server.path
            );
            println!("[+] Saving to: {}", config.server.output_dir.display());

            server
                .run_until(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!("Failed to listen for Ctrl+C: {}", e);
                        std::future::pending::<()>().await;
                    }
                })
                .await?;
        }
    }

    Ok(())
}

fn print_report(report: &TransferReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("[+] Sent {} bytes in {} packets", report.bytes, report.packet_count);
    println!("[+] SHA-256: {}", report.checksum);
    if report.replays > 0 {
        println!("[+] Replayed packets: {}", report.replays);
    }
    Ok(())
}
