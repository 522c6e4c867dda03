use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::bail_service;
use crate::error::ServiceResult;
use crate::extractors::JsonBody;
use crate::inference::task::classify::{ClassifyHandler, ClassifyRequest, ClassifyResponse};

const INFERENCE_ERROR: &str = "Failed to process request";

#[derive(Clone)]
pub struct AppState {
    pub mood_score: Arc<dyn ClassifyHandler>,
    pub depress_check: Arc<dyn ClassifyHandler>,
    pub model_ids: Arc<[String]>,
}

#[derive(Deserialize, Serialize, Debug, PartialEq)]
pub struct HealthResponse {
    pub status: String,
    pub models: Vec<String>,
}

pub fn router(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/mood_score", post(handle_mood_score_request))
        .route("/depress_check", post(handle_depress_check_request))
        .route("/health", get(handle_health_request))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[axum_macros::debug_handler]
async fn handle_mood_score_request(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<ClassifyRequest>,
) -> ServiceResult<(StatusCode, Json<ClassifyResponse>)> {
    tracing::info!("Scoring mood, text length: {}", req.text.chars().count());
    tracing::debug!("Mood score input: {}", req.text);
    let response = classify(state.mood_score, req).await?;
    Ok((StatusCode::OK, Json(response)))
}

#[axum_macros::debug_handler]
async fn handle_depress_check_request(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<ClassifyRequest>,
) -> ServiceResult<(StatusCode, Json<ClassifyResponse>)> {
    tracing::info!(
        "Checking depression indicators, text length: {}",
        req.text.chars().count()
    );
    tracing::debug!("Depression check input: {}", req.text);
    let response = classify(state.depress_check, req).await?;
    Ok((StatusCode::OK, Json(response)))
}

#[axum_macros::debug_handler]
async fn handle_health_request(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
        models: state.model_ids.to_vec(),
    })
}

/// Runs the forward pass on the blocking pool, the handler only awaits the result.
async fn classify(
    model: Arc<dyn ClassifyHandler>,
    req: ClassifyRequest,
) -> ServiceResult<ClassifyResponse> {
    match tokio::task::spawn_blocking(move || model.run_classify(req)).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(err)) => {
            tracing::error!("Inference failed: {:#}", err);
            bail_service!(StatusCode::INTERNAL_SERVER_ERROR, INFERENCE_ERROR)
        }
        Err(err) => {
            tracing::error!("Inference task did not complete: {}", err);
            bail_service!(INFERENCE_ERROR)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::Mutex;

    use anyhow::{bail, Error};
    use axum::body::Body;
    use axum::http::{header, Request};
    use serde::de::DeserializeOwned;
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use tracing_subscriber::fmt::MakeWriter;

    use super::*;
    use crate::error::HttpErrorResponse;
    use crate::inference::classification_pipeline::tests::{cpu_config, write_tiny_checkpoint};
    use crate::inference::models::bert::BertClassifierModel;
    use crate::inference::models::model::{ModelBase, TextTask};
    use crate::inference::task::classify::Label;

    struct StubClassifier {
        model: &'static str,
        label: Label,
        score: f64,
    }

    impl ClassifyHandler for StubClassifier {
        fn run_classify(&self, request: ClassifyRequest) -> Result<ClassifyResponse, Error> {
            if request.text == "explode" {
                bail!("forward pass failed");
            }
            Ok(ClassifyResponse {
                label: self.label.clone(),
                score: self.score,
                model: self.model.into(),
            })
        }
    }

    fn app() -> Router {
        let state = AppState {
            mood_score: Arc::new(StubClassifier {
                model: "bert_4_moods",
                label: Label::Id(2),
                score: 0.91,
            }),
            depress_check: Arc::new(StubClassifier {
                model: "bert_depress_check",
                label: Label::Text("LABEL_1".into()),
                score: 0.64,
            }),
            model_ids: vec!["bert_4_moods".to_string(), "bert_depress_check".to_string()].into(),
        };
        router(state, 1024)
    }

    fn post_json(uri: &str, body: impl Into<Body>) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body.into())
            .unwrap()
    }

    async fn send<T: DeserializeOwned>(req: Request<Body>) -> (StatusCode, T) {
        send_to(app(), req).await
    }

    async fn send_to<T: DeserializeOwned>(app: Router, req: Request<Body>) -> (StatusCode, T) {
        let res = app.oneshot(req).await.unwrap();
        let status = res.status();
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn mood_score_returns_prediction() {
        let (status, body): (_, Value) = send(post_json(
            "/mood_score",
            json!({"text": "I had a calm day", "score_type": "mood"}).to_string(),
        ))
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({"label": 2, "score": 0.91, "model": "bert_4_moods"})
        );
    }

    #[tokio::test]
    async fn depress_check_returns_prediction() {
        let (status, body): (_, ClassifyResponse) = send(post_json(
            "/depress_check",
            json!({"text": "nothing matters"}).to_string(),
        ))
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.model, "bert_depress_check");
        assert_eq!(body.label, Label::Text("LABEL_1".into()));
        assert!((0.0..=1.0).contains(&body.score));
    }

    #[tokio::test]
    async fn malformed_json_is_a_client_error() {
        let (status, body): (_, HttpErrorResponse) =
            send(post_json("/mood_score", "{\"text\": ")).await;
        assert!(status.is_client_error());
        assert!(!body.error.is_empty());
    }

    #[tokio::test]
    async fn missing_text_is_a_client_error() {
        let (status, _): (_, HttpErrorResponse) = send(post_json(
            "/depress_check",
            json!({"content": "hello"}).to_string(),
        ))
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn missing_content_type_is_rejected() {
        let req = Request::post("/mood_score")
            .body(Body::from(json!({"text": "hi"}).to_string()))
            .unwrap();
        let (status, _): (_, HttpErrorResponse) = send(req).await;
        assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let text = "a".repeat(4096);
        let res = app()
            .oneshot(post_json("/mood_score", json!({"text": text}).to_string()))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn inference_failure_is_a_server_error() {
        let (status, body): (_, HttpErrorResponse) =
            send(post_json("/mood_score", json!({"text": "explode"}).to_string())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.error, INFERENCE_ERROR);
    }

    #[tokio::test]
    async fn health_lists_models() {
        let req = Request::get("/health").body(Body::empty()).unwrap();
        let (status, body): (_, HealthResponse) = send(req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.status, "ok");
        assert_eq!(body.models, vec!["bert_4_moods", "bert_depress_check"]);
    }

    #[tokio::test]
    async fn unknown_route_is_not_found() {
        let res = app()
            .oneshot(post_json("/sentiment", json!({"text": "hi"}).to_string()))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    fn load_tiny_model(dir: &std::path::Path, task: TextTask, id2label: Value) -> BertClassifierModel {
        write_tiny_checkpoint(dir, id2label, true);
        let base = ModelBase::for_task(task, dir.to_string_lossy());
        BertClassifierModel::new(base, &cpu_config()).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_share_the_loaded_models() {
        let mood_dir = tempfile::tempdir().unwrap();
        let depress_dir = tempfile::tempdir().unwrap();
        let state = AppState {
            mood_score: Arc::new(load_tiny_model(
                mood_dir.path(),
                TextTask::MoodScore,
                json!({"0": 0, "1": 1, "2": 2, "3": 3}),
            )),
            depress_check: Arc::new(load_tiny_model(
                depress_dir.path(),
                TextTask::DepressCheck,
                json!({"0": 0, "1": 1}),
            )),
            model_ids: vec!["bert_4_moods".to_string(), "bert_depress_check".to_string()].into(),
        };
        let app = router(state, 1 << 20);

        let texts = ["i feel happy today .", "i feel sad", ""];
        let mut tasks = Vec::new();
        for round in 0..32 {
            let (uri, model) = if round % 2 == 0 {
                ("/mood_score", "bert_4_moods")
            } else {
                ("/depress_check", "bert_depress_check")
            };
            let text = texts[round % texts.len()];
            let app = app.clone();
            tasks.push(tokio::spawn(async move {
                let req = post_json(uri, json!({"text": text}).to_string());
                let (status, body): (_, Value) = send_to(app, req).await;
                (uri, model, text, status, body)
            }));
        }

        let mut seen: std::collections::HashMap<(&str, &str), Value> = Default::default();
        for task in tasks {
            let (uri, model, text, status, body) = task.await.unwrap();
            assert_eq!(status, StatusCode::OK);
            let fields: Vec<&str> = body.as_object().unwrap().keys().map(String::as_str).collect();
            assert_eq!(fields.len(), 3);
            assert_eq!(body["model"], model);
            assert!(body["label"].is_i64());
            let score = body["score"].as_f64().unwrap();
            assert!((0.0..=1.0).contains(&score));
            let first = seen.entry((uri, text)).or_insert_with(|| body.clone());
            assert_eq!(*first, body);
        }
        assert_eq!(seen.len(), 6);
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for CapturedLogs {
        type Writer = Self;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[tokio::test]
    async fn handlers_log_the_input_text_at_debug() {
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(logs.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        for (uri, text) in [("/mood_score", "calm waters"), ("/depress_check", "grey skies")] {
            let (status, _): (_, Value) =
                send(post_json(uri, json!({"text": text}).to_string())).await;
            assert_eq!(status, StatusCode::OK);
        }

        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("Mood score input: calm waters"));
        assert!(output.contains("Depression check input: grey skies"));
    }
}
