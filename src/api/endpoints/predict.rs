//! `POST /predict`: classify the turbidity of an uploaded water image.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::multipart::MultipartRejection;
use axum::extract::{Multipart, State};
use axum::Json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::context::{PredictionResult, ServiceContext};

/// Multipart field carrying the image.
pub const IMAGE_FIELD: &str = "image";

/// `POST /predict`: multipart upload with an `image` field.
///
/// Preprocessing and inference run on the blocking pool. A panic there
/// becomes a 500 for this request only.
pub async fn predict(
    State(ctx): State<Arc<ServiceContext>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<PredictionResult>, ApiError> {
    let request_id = Uuid::new_v4();
    let mut multipart = multipart?;

    let image = match read_image_field(&mut multipart).await? {
        Some(bytes) => bytes,
        None => {
            warn!(%request_id, "Request without image part");
            return Err(ApiError::NoImagePart);
        }
    };

    let size = image.len();
    let worker_ctx = Arc::clone(&ctx);
    let outcome = tokio::task::spawn_blocking(move || worker_ctx.predict(&image))
        .await
        .map_err(|e| ApiError::Internal(format!("request {request_id}: prediction task: {e}")))?;

    match outcome {
        Ok(result) => {
            info!(
                %request_id,
                size,
                class = %result.predicted_class,
                confidence = result.confidence,
                "Prediction complete"
            );
            Ok(Json(result))
        }
        Err(e) => {
            let err = ApiError::from(e);
            if let ApiError::CannotProcessImage(detail) = &err {
                warn!(%request_id, size, detail, "Image could not be decoded");
            } else {
                warn!(%request_id, size, "Prediction failed");
            }
            Err(err)
        }
    }
}

/// Bytes of the first `image` file part. Other fields, and an `image`
/// field sent without a filename (a plain form value), are skipped.
async fn read_image_field(multipart: &mut Multipart) -> Result<Option<Bytes>, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(ApiError::from_multipart)?
    {
        if field.name() == Some(IMAGE_FIELD) && field.file_name().is_some() {
            let bytes = field.bytes().await.map_err(ApiError::from_multipart)?;
            return Ok(Some(bytes));
        }
    }
    Ok(None)
}
