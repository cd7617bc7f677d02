use axum::{
    body::Body,
    extract::{Multipart, Path, State},
    http::{header, StatusCode},
    response::Response,
    Json,
};
use diesel::prelude::*;
use image::ImageFormat;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    auth::AnonymousUser,
    error::{AppError, AppResult},
    models::{NewUpload, Upload},
    schema::uploads,
    state::AppState,
    storage::upload_key,
};

pub const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

const ACCEPTED_FORMATS: &[ImageFormat] = &[ImageFormat::Jpeg, ImageFormat::Png, ImageFormat::WebP];

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub file_id: String,
    pub content_type: String,
    pub size: i64,
    pub original_name: String,
}

/// Sniffs the bytes rather than trusting the declared content type.
fn detect_image(bytes: &[u8]) -> Option<&'static str> {
    let format = image::guess_format(bytes).ok()?;
    ACCEPTED_FORMATS
        .contains(&format)
        .then(|| format.to_mime_type())
}

fn display_name(original: Option<&str>, content_type: &str) -> String {
    let cleaned: String = original
        .unwrap_or_default()
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .chars()
        .filter(|ch| !ch.is_control())
        .take(200)
        .collect();
    let cleaned = cleaned.trim();
    if !cleaned.is_empty() {
        return cleaned.to_string();
    }
    let extension = mime_guess::get_mime_extensions_str(content_type)
        .and_then(|extensions| extensions.first())
        .copied()
        .unwrap_or("img");
    format!("image.{extension}")
}

fn inline_content_disposition(filename: &str) -> String {
    let sanitized: String = filename
        .chars()
        .map(|ch| match ch {
            '"' | '\\' => '_',
            _ => ch,
        })
        .collect();
    let encoded =
        percent_encoding::utf8_percent_encode(&sanitized, percent_encoding::NON_ALPHANUMERIC);
    format!("inline; filename=\"{sanitized}\"; filename*=UTF-8''{encoded}")
}

pub async fn upload_file(
    State(state): State<AppState>,
    user: AnonymousUser,
    mut multipart: Multipart,
) -> AppResult<(StatusCode, Json<UploadResponse>)> {
    let mut file_bytes: Option<Vec<u8>> = None;
    let mut original_name: Option<String> = None;

    while let Some(field) = multipart.next_field().await.map_err(|err| {
        warn!(error = %err, "invalid multipart data");
        AppError::bad_request(format!("invalid multipart data: {err}"))
    })? {
        if field.name() != Some("file") {
            continue;
        }
        original_name = field.file_name().map(str::to_string);
        let data = field.bytes().await.map_err(|err| {
            warn!(error = %err, "failed to read upload bytes");
            AppError::bad_request(format!("failed to read file bytes: {err}"))
        })?;
        file_bytes = Some(data.to_vec());
    }

    let bytes = file_bytes.ok_or_else(|| AppError::bad_request("file field is required"))?;
    if bytes.is_empty() {
        return Err(AppError::bad_request("file field must not be empty"));
    }
    if bytes.len() > MAX_UPLOAD_BYTES {
        return Err(AppError::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            "image exceeds the 10 MiB limit",
        ));
    }
    let content_type = detect_image(&bytes)
        .ok_or_else(|| AppError::bad_request("only JPEG, PNG and WebP images are accepted"))?;

    let file_id = Uuid::new_v4().simple().to_string();
    let key = upload_key(&file_id);
    let original_name = display_name(original_name.as_deref(), content_type);
    let size = bytes.len() as i64;

    state
        .storage
        .put_object(&key, bytes, Some(content_type.to_string()))
        .await
        .map_err(|err| {
            error!(error = %format!("{err:#}"), key = %key, "failed to store upload");
            AppError::internal("failed to store upload")
        })?;

    let record = NewUpload {
        file_id: file_id.clone(),
        owner_id: user.user_id,
        s3_key: key.clone(),
        content_type: content_type.to_string(),
        size_bytes: size,
        original_name: original_name.clone(),
    };
    let inserted = {
        let mut conn = state.db()?;
        diesel::insert_into(uploads::table)
            .values(&record)
            .execute(&mut conn)
    };
    if let Err(err) = inserted {
        if let Err(cleanup) = state.storage.delete_object(&key).await {
            warn!(error = %format!("{cleanup:#}"), key = %key, "failed to remove orphaned upload");
        }
        return Err(err.into());
    }

    info!(file_id = %file_id, owner_id = %user.user_id, size, "stored upload");
    Ok((
        StatusCode::CREATED,
        Json(UploadResponse {
            file_id,
            content_type: content_type.to_string(),
            size,
            original_name,
        }),
    ))
}

fn owned_upload(state: &AppState, file_id: &str, user: &AnonymousUser) -> AppResult<Upload> {
    let mut conn = state.db()?;
    let upload: Upload = uploads::table
        .find(file_id)
        .first(&mut conn)
        .optional()?
        .ok_or_else(AppError::not_found)?;
    if upload.owner_id != user.user_id {
        return Err(AppError::forbidden());
    }
    Ok(upload)
}

pub async fn download_file(
    State(state): State<AppState>,
    user: AnonymousUser,
    Path(file_id): Path<String>,
) -> AppResult<Response> {
    let upload = owned_upload(&state, &file_id, &user)?;
    let object = state.storage.get_object(&upload.s3_key).await?;
    let content_type = object
        .content_type
        .unwrap_or_else(|| upload.content_type.clone());

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, object.bytes.len())
        .header(
            header::CONTENT_DISPOSITION,
            inline_content_disposition(&upload.original_name),
        )
        .header(header::CACHE_CONTROL, "private, max-age=300")
        .body(Body::from(object.bytes))
        .map_err(AppError::internal)
}

pub async fn delete_file(
    State(state): State<AppState>,
    user: AnonymousUser,
    Path(file_id): Path<String>,
) -> AppResult<StatusCode> {
    let upload = owned_upload(&state, &file_id, &user)?;
    state.storage.delete_object(&upload.s3_key).await?;
    {
        let mut conn = state.db()?;
        diesel::delete(uploads::table.find(&upload.file_id)).execute(&mut conn)?;
    }
    info!(file_id = %upload.file_id, owner_id = %user.user_id, "deleted upload");
    Ok(StatusCode::NO_CONTENT)
}
