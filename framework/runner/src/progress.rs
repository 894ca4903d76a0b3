use graph_store_client::prelude::Diagram;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use serde_json::json;
use std::thread::JoinHandle;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Payload of a `scaleDeployments` frame, sent once per deployment applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScaleProgress {
    pub node: String,
    /// 1-based index of the deployment just applied.
    pub current: usize,
    pub total: usize,
    pub pods_per_node: usize,
    /// Whole percent, rounded down.
    pub progress: u32,
}

impl ScaleProgress {
    pub fn new(node: impl Into<String>, current: usize, total: usize, pods_per_node: usize) -> Self {
        let progress = if total == 0 {
            100
        } else {
            (current * 100 / total) as u32
        };
        Self {
            node: node.into(),
            current,
            total,
            pods_per_node,
            progress,
        }
    }
}

/// A notification about sweep progress, for whoever is watching.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Text(String),
    /// Show or hide a display section.
    ToggleDiv { div: String },
    /// Structure of the query about to be benchmarked.
    Diagram { query: String, diagram: Diagram },
    ScaleDeployments(ScaleProgress),
}

impl ProgressEvent {
    pub fn text(text: impl Into<String>) -> Self {
        ProgressEvent::Text(text.into())
    }

    pub fn toggle_div(div: impl Into<String>) -> Self {
        ProgressEvent::ToggleDiv { div: div.into() }
    }

    /// The wire frame. Text frames are the text itself, structured frames are JSON objects with a
    /// `type` tag.
    pub fn frame(&self) -> String {
        match self {
            ProgressEvent::Text(text) => text.clone(),
            ProgressEvent::ToggleDiv { div } => json!({"type": "toggleDiv", "div": div}).to_string(),
            ProgressEvent::Diagram { query, diagram } => {
                json!({"type": "diagram", "data": [diagram, query]}).to_string()
            }
            ProgressEvent::ScaleDeployments(progress) => {
                json!({"type": "scaleDeployments", "data": progress}).to_string()
            }
        }
    }
}

/// Sending side of the progress channel. Dropping every sender closes the channel, which is the
/// terminal frame for the transport.
#[derive(Debug, Clone)]
pub struct ProgressSender {
    sender: UnboundedSender<ProgressEvent>,
}

impl ProgressSender {
    /// Frames sent after the transport has gone away are dropped.
    pub fn send(&self, event: ProgressEvent) {
        if self.sender.send(event).is_err() {
            log::trace!("Progress transport closed, dropping frame");
        }
    }

    pub fn text(&self, text: impl Into<String>) {
        self.send(ProgressEvent::text(text));
    }
}

pub fn progress_channel() -> (ProgressSender, UnboundedReceiver<ProgressEvent>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (ProgressSender { sender }, receiver)
}

/// Drain the progress channel onto the console until every sender is dropped.
///
/// Text frames are logged. Deployment scaling drives a progress bar unless `show_bars` is off,
/// in which case those frames are logged like the other structured ones.
pub(crate) fn start_console_progress(
    mut receiver: UnboundedReceiver<ProgressEvent>,
    show_bars: bool,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("progress".to_string())
        .spawn(move || {
            let mut bar: Option<ProgressBar> = None;
            while let Some(event) = receiver.blocking_recv() {
                match event {
                    ProgressEvent::Text(text) => log::info!(target: "progress", "{text}"),
                    ProgressEvent::ScaleDeployments(progress) if show_bars => {
                        let pb = bar.get_or_insert_with(|| scale_bar(progress.total));
                        pb.set_position(progress.current as u64);
                        pb.set_message(progress.node.clone());
                        if progress.current >= progress.total {
                            pb.finish_and_clear();
                            bar = None;
                        }
                    }
                    other => log::debug!(target: "progress", "{}", other.frame()),
                }
            }
            if let Some(pb) = bar {
                pb.abandon();
            }
            log::trace!("Progress channel closed");
        })
        .expect("Failed to start progress thread")
}

fn scale_bar(total: usize) -> ProgressBar {
    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{wide_bar:.cyan/blue}] {pos}/{len} deployments {msg}",
        )
        .expect("Failed to set progress style")
        .progress_chars("#>-"),
    );
    pb
}
