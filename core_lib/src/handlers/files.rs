use std::path::Path as FsPath;

use axum::{
    body::Body,
    extract::{multipart::Field, Multipart, Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tokio::{fs::File, io::AsyncWriteExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{AppError, Result},
    services::KeyPair,
    storage::StagedFile,
    AppState,
};

const FILE_FIELD: &str = "file";

pub async fn upload_file(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<KeyPair>> {
    let mut staged: Option<StagedFile> = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        AppError::BadRequest(format!("Failed to read multipart field: {}", e))
    })? {
        if field.name() != Some(FILE_FIELD) || field.file_name().is_none() {
            continue;
        }
        staged = Some(stage_field(field, &state.staging_dir).await?);
        break;
    }

    let staged = staged.ok_or_else(|| AppError::BadRequest("file is required".to_string()))?;
    let staged_path = staged.path.clone();

    match state.file_service.upload_file(staged).await {
        Ok(keys) => Ok(Json(keys)),
        Err(e) => {
            discard_staged(&staged_path).await;
            Err(e)
        }
    }
}

/// Spools one multipart field to a uniquely named file in the staging
/// directory. The partial file is removed if the body fails mid-stream.
async fn stage_field(mut field: Field<'_>, staging_dir: &FsPath) -> Result<StagedFile> {
    let original_name = field.file_name().unwrap_or(FILE_FIELD).to_string();
    let mime_type = field
        .content_type()
        .map(str::to_string)
        .unwrap_or_else(|| {
            mime_guess::from_path(&original_name)
                .first_or_octet_stream()
                .to_string()
        });

    let path = staging_dir.join(Uuid::new_v4().simple().to_string());
    let mut file = File::create(&path).await?;
    let mut size_bytes: u64 = 0;

    loop {
        let chunk = match field.chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(e) => {
                drop(file);
                discard_staged(&path).await;
                return Err(AppError::BadRequest(format!("Failed to read file data: {}", e)));
            }
        };

        if let Err(e) = file.write_all(&chunk).await {
            drop(file);
            discard_staged(&path).await;
            return Err(e.into());
        }
        size_bytes += chunk.len() as u64;
    }

    if let Err(e) = file.flush().await {
        drop(file);
        discard_staged(&path).await;
        return Err(e.into());
    }

    debug!(name = %original_name, size = size_bytes, "Upload staged");

    Ok(StagedFile {
        path,
        original_name,
        mime_type,
        size_bytes,
    })
}

async fn discard_staged(path: &FsPath) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove staged upload");
        }
    }
}

pub async fn download_file(
    State(state): State<AppState>,
    Path(public_key): Path<String>,
) -> Result<Response> {
    if !state.file_service.file_exists(&public_key).await? {
        return Err(file_not_found());
    }

    let download = match state.file_service.download_file(&public_key).await {
        Ok(download) => download,
        Err(e) if e.is_not_found() => return Err(file_not_found()),
        Err(e) => return Err(e),
    };

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&download.mime_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(download.size_bytes));
    headers.insert(
        header::CONTENT_DISPOSITION,
        content_disposition(&download.original_name),
    );

    Ok((StatusCode::OK, headers, Body::from_stream(download.stream)).into_response())
}

fn file_not_found() -> AppError {
    AppError::NotFound("file not found".to_string())
}

/// `attachment; filename="..."` with quotes and backslashes escaped. Control
/// characters cannot appear in a header value and are dropped.
fn content_disposition(original_name: &str) -> HeaderValue {
    let escaped: String = original_name
        .chars()
        .filter(|c| !c.is_control())
        .flat_map(|c| match c {
            '"' | '\\' => vec!['\\', c],
            _ => vec![c],
        })
        .collect();

    HeaderValue::from_bytes(format!("attachment; filename=\"{}\"", escaped).as_bytes())
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}

pub async fn delete_file(
    State(state): State<AppState>,
    Path(private_key): Path<String>,
) -> Result<Response> {
    if state.file_service.delete_file(&private_key).await? {
        info!("File deleted");
        Ok(Json(json!({ "message": "File deleted successfully" })).into_response())
    } else {
        Ok((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "File not found or invalid privateKey" })),
        )
            .into_response())
    }
}
