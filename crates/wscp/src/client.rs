//! Sending side of WScp.

use std::path::Path;

use anyhow::{Context, Result};
use protocol::{SessionConfig, TransferReport, TransferSession};
use tracing::info;
use url::Url;

use crate::network;
use crate::progress::TransferProgress;

/// How a send should report progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProgressMode {
    /// Draw a Unicode progress bar.
    #[default]
    Bar,
    /// Draw a progress bar with ASCII characters only.
    Ascii,
    /// Draw nothing.
    Hidden,
}

/// Sends `file` to the server at `address`.
///
/// The source is opened and hashed before connecting, so a bad path fails
/// without touching the network.
pub async fn send_file(
    address: &str,
    file: &Path,
    proxy: Option<&str>,
    config: SessionConfig,
    mode: ProgressMode,
) -> Result<TransferReport> {
    let mut session = TransferSession::prepare_sender(file, config)
        .await
        .with_context(|| format!("Failed to prepare {}", file.display()))?;
    info!(
        file = %file.display(),
        bytes = session.size(),
        packets = session.packet_count(),
        checksum = %session.checksum(),
        "Prepared source file"
    );

    let mut transport = network::connect(address, proxy)
        .await
        .with_context(|| format!("Failed to connect to {}", redacted(address)))?;

    let mut progress = match mode {
        ProgressMode::Bar => TransferProgress::new(session.size(), session.filename(), false),
        ProgressMode::Ascii => TransferProgress::new(session.size(), session.filename(), true),
        ProgressMode::Hidden => TransferProgress::hidden(session.size()),
    };

    match session.run(&mut transport, &mut progress).await {
        Ok(report) => {
            progress.finish();
            Ok(report)
        }
        Err(e) => {
            progress.abandon();
            Err(e).context("Transfer failed")
        }
    }
}

/// Address or proxy URL with any credentials removed, for messages.
pub fn redacted(address: &str) -> String {
    let candidate = if address.contains("://") {
        address.to_string()
    } else {
        format!("ws://{}", address)
    };
    match Url::parse(&candidate) {
        Ok(url) => network::connect::redact(&url),
        Err(_) => address.to_string(),
    }
}
