//! notification-file - appends every delivered batch to a file
//!
//! Each batch is written as one JSON array followed by a newline. Configured
//! with an `output_file` parameter in the plugin's config section.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use claw_notify_proto::{serve, Alert, Notifier};
use serde_json::Value;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Default)]
struct FileNotifier {
    output: Option<(PathBuf, File)>,
}

impl Notifier for FileNotifier {
    fn configure(&mut self, config: Value) -> Result<(), String> {
        let path = config
            .get("output_file")
            .and_then(Value::as_str)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| "missing output_file".to_string())?;
        let path = PathBuf::from(path);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| format!("failed to open {}: {e}", path.display()))?;

        info!(output = %path.display(), "writing alerts");
        self.output = Some((path, file));
        Ok(())
    }

    fn notify(&mut self, plugin: &str, alerts: Vec<Alert>) -> Result<(), String> {
        let (path, file) = self
            .output
            .as_mut()
            .ok_or_else(|| "not configured".to_string())?;

        let mut line = serde_json::to_vec(&alerts).map_err(|e| e.to_string())?;
        line.push(b'\n');
        file.write_all(&line)
            .and_then(|()| file.flush())
            .map_err(|e| format!("failed to write {}: {e}", path.display()))?;

        info!(plugin = %plugin, alerts = alerts.len(), "batch written");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // stdout carries the protocol
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_ansi(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match serve(FileNotifier::default()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "notification-file stopped");
            eprintln!("notification-file: {e}");
            ExitCode::FAILURE
        }
    }
}
