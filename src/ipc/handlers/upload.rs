//! Multipart module upload with a streamed NDJSON progress body.

use std::convert::Infallible;

use axum::{
    body::Body,
    extract::{multipart::Field, Multipart, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};

use super::super::IPCServer;
use crate::supervisor::error::{SupervisorError, SupervisorResult};
use crate::supervisor::upload::report_failure;

/// Form field carrying the zip archive.
const FILE_FIELD: &str = "module";
/// Optional form field overriding the module name.
const NAME_FIELD: &str = "moduleName";

const PROGRESS_BUFFER: usize = 8;

struct ReceivedUpload {
    archive: NamedTempFile,
    file_name: Option<String>,
    module_name: Option<String>,
}

/// POST /api/upload
///
/// Validation failures are answered with a single JSON error. Once the
/// archive is extracted the response switches to `application/x-ndjson` and
/// streams install/build progress until a `complete` line.
pub async fn upload_module(State(state): State<IPCServer>, multipart: Multipart) -> Response {
    let upload = match receive_upload(&state, multipart).await {
        Ok(upload) => upload,
        Err(e) => return e.into_response(),
    };

    let name = match state
        .supervisor
        .accept_upload(
            upload.archive,
            upload.module_name.as_deref(),
            upload.file_name.as_deref(),
        )
        .await
    {
        Ok(name) => name,
        Err(e) => return e.into_response(),
    };
    tracing::info!("Module {} extracted", name);

    let (tx, rx) = mpsc::channel(PROGRESS_BUFFER);
    let supervisor = state.supervisor.clone();
    let progress = tx.clone();
    let task = tokio::spawn(async move {
        supervisor.prepare_module(&name, &progress).await;
    });
    tokio::spawn(report_failure(task, tx));

    let stream = ReceiverStream::new(rx).map(|event| Ok::<_, Infallible>(event.to_line()));
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(stream),
    )
        .into_response()
}

async fn receive_upload(
    state: &IPCServer,
    mut multipart: Multipart,
) -> SupervisorResult<ReceivedUpload> {
    let mut archive = None;
    let mut file_name = None;
    let mut module_name = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| SupervisorError::InvalidArchive(format!("malformed upload: {}", e)))?
    {
        match field.name() {
            Some(FILE_FIELD) => {
                file_name = field.file_name().map(str::to_string);
                let temp = state.supervisor.store.new_upload_file()?;
                write_field(field, &temp).await?;
                archive = Some(temp);
            }
            Some(NAME_FIELD) => {
                let value = field.text().await.map_err(|e| {
                    SupervisorError::InvalidArchive(format!("malformed upload: {}", e))
                })?;
                if !value.trim().is_empty() {
                    module_name = Some(value);
                }
            }
            other => tracing::debug!("Ignoring upload field {:?}", other),
        }
    }

    let archive = archive.ok_or(SupervisorError::MissingUpload)?;
    Ok(ReceivedUpload {
        archive,
        file_name,
        module_name,
    })
}

async fn write_field(mut field: Field<'_>, temp: &NamedTempFile) -> SupervisorResult<()> {
    let std_file = temp.as_file().try_clone().map_err(anyhow::Error::from)?;
    let mut file = tokio::fs::File::from_std(std_file);
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| SupervisorError::InvalidArchive(format!("upload interrupted: {}", e)))?
    {
        file.write_all(&chunk).await.map_err(anyhow::Error::from)?;
    }
    file.flush().await.map_err(anyhow::Error::from)?;
    Ok(())
}
