//! Terminal progress bar for outgoing transfers.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use protocol::{Progress, ProgressObserver};

const TEMPLATE: &str =
    "{msg} [{elapsed_precise}] [{bar:40}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})";

/// Progress bar driven by a sending session.
#[derive(Debug, Clone)]
pub struct TransferProgress {
    bar: ProgressBar,
}

impl TransferProgress {
    /// Creates a bar for `total` bytes labelled with `filename`.
    ///
    /// `ascii` swaps the block characters for `#` and spaces, for terminals
    /// without Unicode support.
    pub fn new(total: u64, filename: &str, ascii: bool) -> Self {
        let chars = if ascii { "## " } else { "▮▮▯" };
        let style = ProgressStyle::default_bar()
            .template(TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars(chars);

        let bar = ProgressBar::new(total);
        bar.set_style(style);
        bar.set_message(filename.to_string());
        Self { bar }
    }

    /// A bar that draws nothing, for JSON output and tests.
    pub fn hidden(total: u64) -> Self {
        let bar = ProgressBar::with_draw_target(Some(total), ProgressDrawTarget::hidden());
        Self { bar }
    }

    /// Bytes reported so far.
    pub fn position(&self) -> u64 {
        self.bar.position()
    }

    /// Marks the transfer as complete and leaves the bar on screen.
    pub fn finish(&self) {
        self.bar.finish();
    }

    /// Stops the bar where it is after a failure.
    pub fn abandon(&self) {
        self.bar.abandon();
    }
}

impl ProgressObserver for TransferProgress {
    fn on_chunk(&mut self, progress: Progress) {
        self.bar.set_position(progress.bytes_sent);
    }
}
