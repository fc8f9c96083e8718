use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How an uploaded module will be served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AppType {
    Html,
    Node,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct UploadedApp {
    pub name: String,
    #[serde(rename = "type")]
    pub app_type: AppType,
    #[serde(rename = "mainFile")]
    pub main_file: String,
}

/// One line of the newline-delimited upload progress stream.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum UploadEvent {
    Installing { message: String },
    Building { message: String },
    Complete { message: String, app: UploadedApp },
    Error { error: String },
}

impl UploadEvent {
    /// Serialize as a single NDJSON line, newline included.
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"status":"error","error":"failed to encode event: {}"}}"#, e)
        });
        line.push('\n');
        line
    }
}

/// Await the background preparation of an upload and report a panicked or
/// cancelled task as an `error` line.
pub async fn report_failure(task: JoinHandle<()>, events: mpsc::Sender<UploadEvent>) {
    if let Err(e) = task.await {
        tracing::error!("Module preparation failed: {}", e);
        let _ = events
            .send(UploadEvent::Error {
                error: format!("Module preparation failed: {}", e),
            })
            .await;
    }
}
