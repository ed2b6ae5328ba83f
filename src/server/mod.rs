//! HTTP 接口 (axum)
//!
//! 管线列表 / 启停 / MJPEG 推流 / 快照 / 配置 / 健康检查 / 指标。
//! 管线操作是阻塞调用, 统一放到 spawn_blocking 中执行。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_stream::stream;
use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::broadcast::{mjpeg_part, Delivery, StreamOptions, DEFAULT_READ_TIMEOUT, STREAM_CONTENT_TYPE};
use crate::config::ConfigPatch;
use crate::error::PipelineError;
use crate::registry::PipelineRegistry;

type AppState = Arc<PipelineRegistry>;

/// 管线错误 → HTTP 响应
pub struct ApiError(PipelineError);

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            PipelineError::ConfigRejected(_) => StatusCode::BAD_REQUEST,
            PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
            PipelineError::SourceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({ "error": self.0.to_string(), "kind": self.0.kind() });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// 在阻塞线程池中执行管线操作
async fn blocking<T, F>(f: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> crate::error::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError(PipelineError::Spawn(e.to_string())))?
        .map_err(ApiError)
}

pub fn router(registry: Arc<PipelineRegistry>) -> Router {
    Router::new()
        .route("/pipelines", get(list_pipelines))
        .route("/pipelines/:name/start", post(start_pipeline))
        .route("/pipelines/:name/stop", post(stop_pipeline))
        .route("/pipelines/:name/stream", get(stream_pipeline))
        .route("/pipelines/:name/snapshot.jpg", get(snapshot))
        .route("/pipelines/:name/config", get(get_config).patch(patch_config))
        .route("/pipelines/:name/health", get(health))
        .route("/pipelines/:name/metrics", get(metrics))
        .route("/pipelines/:name/counts/reset", post(reset_counts))
        .with_state(registry)
}

/// 监听并服务, shutdown 完成后优雅退出
pub async fn serve<S>(bind: &str, registry: Arc<PipelineRegistry>, shutdown: S) -> anyhow::Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("监听失败: {}", bind))?;
    info!("🌐 HTTP 服务已启动: http://{}", listener.local_addr()?);
    axum::serve(listener, router(registry))
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP 服务异常退出")?;
    info!("🌐 HTTP 服务已关闭");
    Ok(())
}

async fn list_pipelines(State(registry): State<AppState>) -> impl IntoResponse {
    Json(registry.list())
}

async fn start_pipeline(
    State(registry): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    let pipeline = registry.get(&name)?;
    let report = blocking(move || {
        pipeline.start()?;
        Ok(pipeline.health())
    })
    .await?;
    Ok(Json(report).into_response())
}

async fn stop_pipeline(
    State(registry): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    let pipeline = registry.get(&name)?;
    let report = blocking(move || {
        pipeline.stop();
        Ok(pipeline.health())
    })
    .await?;
    Ok(Json(report).into_response())
}

#[derive(Debug, Default, Deserialize)]
struct StreamQuery {
    fps: Option<f64>,
    timeout_ms: Option<u64>,
}

async fn stream_pipeline(
    State(registry): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<StreamQuery>,
) -> ApiResult<Response> {
    let pipeline = registry.get(&name)?;
    let options = StreamOptions {
        fps: query.fps,
        read_timeout: query
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_READ_TIMEOUT),
    };
    let mut session = blocking(move || Ok(pipeline.attach(options))).await?;
    let client = session.id();

    let body = stream! {
        loop {
            // 会话在阻塞线程与流之间来回移交
            let waited = tokio::task::spawn_blocking(move || {
                let delivery = session.next();
                (session, delivery)
            })
            .await;
            let delivery = match waited {
                Ok((back, delivery)) => {
                    session = back;
                    delivery
                }
                Err(_) => break,
            };
            let jpeg = match delivery {
                Delivery::Frame(frame) => frame.data,
                Delivery::NoSignal(placeholder) => placeholder,
                Delivery::Closed => break,
            };
            yield Ok::<Bytes, std::io::Error>(Bytes::from(mjpeg_part(&jpeg)));
        }
        debug!("📺 客户端 #{} 推流结束", client);
    };

    Ok((
        [
            (header::CONTENT_TYPE, STREAM_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(body),
    )
        .into_response())
}

async fn snapshot(
    State(registry): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    let pipeline = registry.get(&name)?;
    let last = blocking(move || Ok(pipeline.last_frame())).await?;
    Ok(match last {
        Some(frame) => (
            [(header::CONTENT_TYPE, "image/jpeg")],
            Bytes::from(frame.data.to_vec()),
        )
            .into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

async fn get_config(
    State(registry): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    let pipeline = registry.get(&name)?;
    Ok(Json(pipeline.config().as_ref().clone()).into_response())
}

async fn patch_config(
    State(registry): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> ApiResult<Response> {
    let pipeline = registry.get(&name)?;
    let patch: ConfigPatch = serde_json::from_slice(&body)
        .map_err(|e| PipelineError::rejected(format!("配置格式错误: {}", e)))?;
    let config = blocking(move || pipeline.update_config(patch)).await?;
    Ok(Json(config.as_ref().clone()).into_response())
}

async fn health(
    State(registry): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    let pipeline = registry.get(&name)?;
    let report = blocking(move || Ok(pipeline.health())).await?;
    Ok(Json(report).into_response())
}

async fn metrics(
    State(registry): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    let pipeline = registry.get(&name)?;
    let report = blocking(move || Ok(pipeline.metrics())).await?;
    Ok(Json(report).into_response())
}

async fn reset_counts(
    State(registry): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    let pipeline = registry.get(&name)?;
    let counters = blocking(move || {
        pipeline.reset_counts();
        Ok(pipeline.metrics().counters)
    })
    .await?;
    Ok(Json(counters).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PipelineConfig, SourceSpec};
    use crate::detection::ModelRegistry;
    use crate::frame::testing::solid_jpeg;
    use axum::http::Request;
    use std::io::Write;
    use tower::ServiceExt;

    fn registry_with(name: &str, config: PipelineConfig) -> Arc<PipelineRegistry> {
        let registry = PipelineRegistry::new(Arc::new(ModelRegistry::new()));
        registry.create(name, config).unwrap();
        registry
    }

    fn missing_file() -> PipelineConfig {
        PipelineConfig::new(SourceSpec::File {
            path: "/nonexistent/clip.mjpg".into(),
            fps: None,
        })
    }

    async fn call(app: Router, method: &str, uri: &str, body: Body) -> (StatusCode, Bytes) {
        let resp = app
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(body)
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, bytes)
    }

    #[tokio::test]
    async fn test_list_and_not_found() {
        let app = router(registry_with("gate", missing_file()));

        let (status, body) = call(app.clone(), "GET", "/pipelines", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        let list: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(list[0]["name"], "gate");
        assert_eq!(list[0]["running"], false);

        let (status, body) = call(app, "GET", "/pipelines/nope/health", Body::empty()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let err: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(err["kind"], "not_found");
    }

    #[tokio::test]
    async fn test_patch_config_validates() {
        let app = router(registry_with("gate", missing_file()));

        let (status, _) = call(
            app.clone(),
            "PATCH",
            "/pipelines/gate/config",
            Body::from(r#"{"queue_dpth": 3}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            app.clone(),
            "PATCH",
            "/pipelines/gate/config",
            Body::from(r#"{"models": [{"id": "no-such-model"}]}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(
            app.clone(),
            "PATCH",
            "/pipelines/gate/config",
            Body::from(r#"{"jpeg_quality": 55, "models": [{"id": "passthrough"}]}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let config: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(config["jpeg_quality"], 55);

        let (_, body) = call(app, "GET", "/pipelines/gate/config", Body::empty()).await;
        let config: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(config["models"][0]["id"], "passthrough");
    }

    #[tokio::test]
    async fn test_start_unavailable_source_and_empty_snapshot() {
        let app = router(registry_with("gate", missing_file()));

        let (status, body) = call(app.clone(), "POST", "/pipelines/gate/start", Body::empty()).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let err: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(err["kind"], "source_unavailable");

        let (status, _) = call(app.clone(), "GET", "/pipelines/gate/snapshot.jpg", Body::empty()).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = call(app, "GET", "/pipelines/gate/health", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(health["running"], false);
        assert_eq!(health["frames_received"], 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_health_answers_while_start_is_connecting() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/video", listener.local_addr().unwrap());
        let app = router(registry_with(
            "remote",
            PipelineConfig::new(SourceSpec::Stream {
                url,
                timeout_ms: Some(1500),
            }),
        ));

        // 上游只接受连接不响应, start 会一直等到超时
        let starting = tokio::spawn(call(app.clone(), "POST", "/pipelines/remote/start", Body::empty()));
        tokio::time::sleep(Duration::from_millis(200)).await;

        for uri in ["/pipelines/remote/health", "/pipelines/remote/metrics"] {
            let (status, _) = tokio::time::timeout(
                Duration::from_millis(500),
                call(app.clone(), "GET", uri, Body::empty()),
            )
            .await
            .unwrap();
            assert_eq!(status, StatusCode::OK);
        }

        let (status, _) = starting.await.unwrap();
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        drop(listener);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stream_serves_multipart_until_stop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mjpg");
        let mut file = std::fs::File::create(&path).unwrap();
        for v in [40u8, 80, 120] {
            file.write_all(&solid_jpeg(32, 24, v)).unwrap();
        }
        drop(file);

        let registry = registry_with(
            "cam",
            PipelineConfig::new(SourceSpec::File {
                path,
                fps: Some(20.0),
            }),
        );
        let pipeline = registry.get("cam").unwrap();
        let app = router(registry);

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/pipelines/cam/stream?timeout_ms=100")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], STREAM_CONTENT_TYPE);

        let stopper = std::thread::spawn(move || {
            pipeline.start().unwrap();
            std::thread::sleep(Duration::from_millis(400));
            pipeline.stop();
        });
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        stopper.join().unwrap();

        assert!(body.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: "));
        assert!(body.windows(2).any(|w| w == [0xFF, 0xD8]));
    }
}
