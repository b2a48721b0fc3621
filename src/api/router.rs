//! Prediction API router.
//!
//! Returns a composable `Router` that can be mounted on any axum server.
//!
//! Layers (outermost → innermost): request tracing → body limit → handler.

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::post;
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::api::endpoints;
use crate::context::ServiceContext;

/// Build the prediction router.
///
/// `max_upload_bytes` caps the whole request body; larger uploads get 413.
pub fn predict_router(ctx: Arc<ServiceContext>, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/predict", post(endpoints::predict::predict))
        .with_state(ctx)
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::response::Response;
    use http_body_util::BodyExt;
    use image::{DynamicImage, GrayImage, ImageOutputFormat, Luma, Rgb, RgbImage};
    use tower::ServiceExt;

    use crate::classifier::{ClassProbabilities, MockClassifier};
    use crate::config::MAX_UPLOAD_BYTES;
    use crate::preprocess::PreprocessingPipeline;
    use crate::turbidity::{ntu_range, ClassLabel};

    const BOUNDARY: &str = "turbidity-test-boundary";

    fn app_with(model: MockClassifier, max_upload_bytes: usize) -> Router {
        let ctx = ServiceContext::new(Box::new(PreprocessingPipeline::standard()), Box::new(model));
        predict_router(Arc::new(ctx), max_upload_bytes)
    }

    fn app() -> Router {
        app_with(MockClassifier::new(), MAX_UPLOAD_BYTES)
    }

    fn encode(dynamic: DynamicImage) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        dynamic.write_to(&mut cursor, ImageOutputFormat::Png).unwrap();
        cursor.into_inner()
    }

    fn make_test_image(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
        encode(DynamicImage::ImageRgb8(RgbImage::from_pixel(
            width,
            height,
            Rgb(color),
        )))
    }

    fn multipart_body(field: &str, bytes: &[u8]) -> Vec<u8> {
        let mut body = format!(
            "--{BOUNDARY}\r\n\
             Content-Disposition: form-data; name=\"{field}\"; filename=\"sample.png\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(bytes);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    /// A form value rather than a file: no `filename` parameter.
    fn text_field_body(field: &str, value: &str) -> Vec<u8> {
        format!(
            "--{BOUNDARY}\r\n\
             Content-Disposition: form-data; name=\"{field}\"\r\n\r\n\
             {value}\r\n--{BOUNDARY}--\r\n"
        )
        .into_bytes()
    }

    fn multipart_request(body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/predict")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn predict_request(field: &str, bytes: &[u8]) -> Request<Body> {
        multipart_request(multipart_body(field, bytes))
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn predict_returns_full_result() {
        let image = make_test_image(400, 300, [70, 130, 180]);
        let response = app().oneshot(predict_request("image", &image)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        let per_class = json["per_class_probs"].as_object().unwrap();
        assert_eq!(per_class.len(), ClassLabel::ALL.len());

        let total: f64 = per_class.values().map(|v| v.as_f64().unwrap()).sum();
        assert!((total - 1.0).abs() < 1e-4);

        let predicted = json["predicted_class"].as_str().unwrap();
        let label = ClassLabel::ALL
            .into_iter()
            .find(|l| l.as_str() == predicted)
            .unwrap();
        let best = per_class.values().map(|v| v.as_f64().unwrap()).fold(0.0, f64::max);
        assert_eq!(json["confidence"].as_f64().unwrap(), best);
        assert_eq!(per_class[predicted].as_f64().unwrap(), best);

        let range = ntu_range(label);
        assert_eq!(json["ntu_range"], serde_json::json!([range.min, range.max]));
    }

    #[tokio::test]
    async fn predicted_class_follows_model_output() {
        let probs = ClassProbabilities::from_probs(&[0.05, 0.05, 0.7, 0.1, 0.05, 0.05]).unwrap();
        let app = app_with(MockClassifier::fixed(probs), MAX_UPLOAD_BYTES);
        let image = make_test_image(64, 64, [120, 110, 90]);

        let json = body_json(app.oneshot(predict_request("image", &image)).await.unwrap()).await;
        assert_eq!(json["predicted_class"], "cloudy");
        assert_eq!(json["ntu_range"], serde_json::json!([600.0, 1200.0]));
    }

    #[tokio::test]
    async fn missing_image_field_returns_400() {
        let image = make_test_image(64, 64, [0, 0, 0]);
        let response = app().oneshot(predict_request("file", &image)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let json = body_json(response).await;
        assert_eq!(json, serde_json::json!({"error": "No image part"}));
    }

    #[tokio::test]
    async fn image_text_field_is_not_a_file() {
        let body = text_field_body("image", "not a file upload");
        let response = app().oneshot(multipart_request(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let json = body_json(response).await;
        assert_eq!(json, serde_json::json!({"error": "No image part"}));
    }

    #[tokio::test]
    async fn file_part_after_text_field_is_used() {
        let image = make_test_image(64, 64, [90, 90, 90]);
        let mut body = text_field_body("image", "caption");
        // Drop the closing boundary and append the file part.
        body.truncate(body.len() - format!("--{BOUNDARY}--\r\n").len());
        body.extend_from_slice(&multipart_body("image", &image));

        let response = app().oneshot(multipart_request(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn non_multipart_body_returns_400() {
        let req = Request::builder()
            .method("POST")
            .uri("/predict")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"image": "abc"}"#))
            .unwrap();

        let response = app().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "No image part");
    }

    #[tokio::test]
    async fn garbage_bytes_return_400() {
        let response = app()
            .oneshot(predict_request("image", b"this is not an image at all"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let json = body_json(response).await;
        assert_eq!(json["error"], "Cannot process image");
        assert!(json["detail"].is_string());
    }

    #[tokio::test]
    async fn extreme_aspect_ratio_returns_400() {
        let image = make_test_image(1, 5000, [70, 130, 180]);
        let response = app().oneshot(predict_request("image", &image)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let json = body_json(response).await;
        assert_eq!(json["error"], "Cannot process image");
        assert!(json["detail"].as_str().unwrap().contains("aspect ratio"));
    }

    #[tokio::test]
    async fn empty_image_field_returns_400() {
        let response = app().oneshot(predict_request("image", b"")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(response).await.get("error").is_some());
    }

    #[tokio::test]
    async fn same_image_twice_gives_same_answer() {
        let app = app();
        let image = make_test_image(300, 500, [200, 180, 150]);

        let first = body_json(
            app.clone()
                .oneshot(predict_request("image", &image))
                .await
                .unwrap(),
        )
        .await;
        let second = body_json(app.oneshot(predict_request("image", &image)).await.unwrap()).await;

        assert_eq!(first["predicted_class"], second["predicted_class"]);
        assert_eq!(first["confidence"], second["confidence"]);
        assert_eq!(first["ntu_range"], second["ntu_range"]);
    }

    #[tokio::test]
    async fn grayscale_image_is_accepted() {
        let gray = GrayImage::from_pixel(320, 240, Luma([128]));
        let image = encode(DynamicImage::ImageLuma8(gray));

        let response = app().oneshot(predict_request("image", &image)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn model_failure_returns_500() {
        let app = app_with(MockClassifier::failing(), MAX_UPLOAD_BYTES);
        let image = make_test_image(64, 64, [10, 10, 10]);

        let response = app.oneshot(predict_request("image", &image)).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body_json(response).await,
            serde_json::json!({"error": "Prediction failed"})
        );
    }

    #[tokio::test]
    async fn model_panic_returns_500_and_keeps_serving() {
        let app = app_with(MockClassifier::panicking(), MAX_UPLOAD_BYTES);
        let image = make_test_image(64, 64, [10, 10, 10]);

        let first = app
            .clone()
            .oneshot(predict_request("image", &image))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let second = app.oneshot(predict_request("image", &image)).await.unwrap();
        assert_eq!(second.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn oversized_upload_returns_413() {
        let app = app_with(MockClassifier::new(), 1024);
        let image = vec![0u8; 8 * 1024];

        let response = app.oneshot(predict_request("image", &image)).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body_json(response).await["error"], "Image too large");
    }

    #[tokio::test]
    async fn get_predict_is_not_allowed() {
        let req = Request::builder()
            .method("GET")
            .uri("/predict")
            .body(Body::empty())
            .unwrap();

        let response = app().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let req = Request::builder()
            .method("POST")
            .uri("/classify")
            .body(Body::empty())
            .unwrap();

        let response = app().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
