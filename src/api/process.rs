//! `POST /process-cin/`: run one uploaded card image through the pipeline.

use axum::{
    extract::{multipart::MultipartRejection, Multipart, State},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use tracing::{debug, info};

use super::{ApiError, AppState};
use crate::pipeline::input::Document;

/// Multipart part carrying the image.
pub const FILE_PART: &str = "file";

/// Response header carrying the run id of a successful run.
pub const RUN_ID_HEADER: &str = "x-run-id";

/// The `file` part of a multipart upload.
#[derive(Debug)]
struct Upload {
    bytes: Vec<u8>,
    content_type: Option<String>,
    filename: Option<String>,
}

/// POST /process-cin/
///
/// Validates the upload before any stage runs, then hands it to the
/// coordinator. The response is the aggregated document with a `warnings`
/// array, or an error body mapped by [`ApiError`].
pub async fn process_cin(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, ApiError> {
    let mut multipart = multipart
        .map_err(|e| ApiError::Validation(format!("expected a multipart/form-data upload: {e}")))?;
    let upload = read_file_part(&mut multipart, state.max_upload_bytes).await?;
    info!(
        "Received upload {:?} ({} bytes, {})",
        upload.filename.as_deref().unwrap_or("<unnamed>"),
        upload.bytes.len(),
        upload.content_type.as_deref().unwrap_or("no content type")
    );

    let document = Document::from_upload(upload.bytes, upload.content_type.as_deref(), upload.filename)?;
    let output = state.coordinator.process(document).await?;
    let run_id = output.run_id.to_string();

    Ok(([(RUN_ID_HEADER, run_id)], Json(output.into_body())).into_response())
}

/// Find the `file` part; other parts are skipped.
async fn read_file_part(multipart: &mut Multipart, max_bytes: usize) -> Result<Upload, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::Validation(format!("malformed multipart body: {e}")))?
    {
        if field.name() != Some(FILE_PART) {
            debug!("Skipping multipart part {:?}", field.name());
            continue;
        }
        let content_type = field.content_type().map(str::to_owned);
        let filename = field.file_name().map(str::to_owned);
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::Validation(format!("could not read part '{FILE_PART}': {e}")))?;
        if bytes.len() > max_bytes {
            return Err(ApiError::Validation(format!(
                "file is {} bytes, limit is {max_bytes}",
                bytes.len()
            )));
        }
        return Ok(Upload {
            bytes: bytes.to_vec(),
            content_type,
            filename,
        });
    }
    Err(ApiError::Validation(format!("missing multipart part '{FILE_PART}'")))
}

/// The upload route, with and without the trailing slash.
pub fn process_routes() -> Router<AppState> {
    Router::new()
        .route("/process-cin/", post(process_cin))
        .route("/process-cin", post(process_cin))
}
