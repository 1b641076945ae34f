// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Ways of starting a pipeline run: a fixed interval timer and an HTTP/1 endpoint.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::service::service_fn;
use hyper::{http, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use reqwest::Client;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::arm::ArmClient;
use crate::config::{ResourceManagerSettings, TierMultipliers};
use crate::error::FleetError;
use crate::hub_capacity::CapacityPipeline;
use crate::pipeline::{Pipeline, PipelineRun, RunOptions};
use crate::publisher::TelemetryBackend;

pub const CONNECTIVITY_PATH: &str = "/api/connectivity";
pub const CAPACITY_PATH: &str = "/api/capacity";
const ACCESS_TOKEN_HEADER: &str = "access_token";

const CONNECTIVITY_SUCCESS: &str = "DeviceConnectivity function executed successfully.";
const CAPACITY_SUCCESS: &str = "IoTHubCapacityExporter function executed successfully.";

/// Builds a capacity pipeline bound to the management-plane token of one request.
pub type CapacityFactory =
    Arc<dyn Fn(&str) -> Result<Arc<dyn Pipeline>, FleetError> + Send + Sync>;

/// Pipelines reachable over HTTP. A missing entry disables its route.
#[derive(Clone, Default)]
pub struct Triggers {
    pub connectivity: Option<Arc<dyn Pipeline>>,
    pub capacity: Option<CapacityFactory>,
}

/// Capacity factory talking to the resource manager with the caller's bearer token.
pub fn arm_capacity_factory(
    client: Client,
    settings: ResourceManagerSettings,
    backend: Arc<dyn TelemetryBackend>,
    multipliers: TierMultipliers,
    options: RunOptions,
) -> CapacityFactory {
    Arc::new(move |access_token: &str| {
        let arm = ArmClient::new(client.clone(), &settings, access_token)?;
        let pipeline: Arc<dyn Pipeline> = Arc::new(CapacityPipeline::new(
            Arc::new(arm),
            Arc::clone(&backend),
            settings.scope.clone(),
            multipliers.clone(),
            options,
        ));
        Ok(pipeline)
    })
}

/// Runs `pipeline` every `period` until `cancel` fires. The first run starts immediately.
pub async fn run_on_interval(
    pipeline: Arc<dyn Pipeline>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval(period);
    // A run longer than the period delays the next one instead of queueing a burst.
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(
        "{}: scheduled every {} s",
        pipeline.name(),
        period.as_secs()
    );

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                info!("{}: timer stopped", pipeline.name());
                break;
            }
            _ = ticker.tick() => {
                debug!("{}: timer fired", pipeline.name());
                pipeline.run(cancel.child_token()).await;
            }
        }
    }
}

/// Logs `message` and returns it as the JSON body `{"message": ...}`.
fn log_and_create_http_response(
    message: &str,
    status: StatusCode,
) -> http::Result<Response<Full<Bytes>>> {
    if status.is_success() {
        debug!("{message}");
    } else {
        error!("{message}");
    }
    let body = json!({ "message": message }).to_string();
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
}

fn run_response(run: &PipelineRun, success: &str) -> http::Result<Response<Full<Bytes>>> {
    match &run.error {
        Some(e) => log_and_create_http_response(
            &format!("{} run failed: {e}", run.name),
            StatusCode::INTERNAL_SERVER_ERROR,
        ),
        None => log_and_create_http_response(success, StatusCode::OK),
    }
}

/// Routes one request. The body is never read.
pub async fn handle_request<B>(
    req: Request<B>,
    triggers: &Triggers,
    cancel: CancellationToken,
) -> http::Result<Response<Full<Bytes>>> {
    if !matches!(*req.method(), Method::GET | Method::POST) {
        return log_and_create_http_response(
            &format!("{} is not supported", req.method()),
            StatusCode::METHOD_NOT_ALLOWED,
        );
    }

    match req.uri().path() {
        CONNECTIVITY_PATH => match &triggers.connectivity {
            Some(pipeline) => run_response(&pipeline.run(cancel).await, CONNECTIVITY_SUCCESS),
            None => not_configured(CONNECTIVITY_PATH),
        },
        CAPACITY_PATH => {
            let Some(factory) = &triggers.capacity else {
                return not_configured(CAPACITY_PATH);
            };
            let token = req
                .headers()
                .get(ACCESS_TOKEN_HEADER)
                .and_then(|value| value.to_str().ok())
                .filter(|value| !value.trim().is_empty());
            let Some(token) = token else {
                return log_and_create_http_response(
                    "ACCESS_TOKEN is missing",
                    StatusCode::BAD_REQUEST,
                );
            };
            match factory(token) {
                Ok(pipeline) => run_response(&pipeline.run(cancel).await, CAPACITY_SUCCESS),
                Err(e) => log_and_create_http_response(
                    &format!("ACCESS_TOKEN is not usable: {e}"),
                    StatusCode::BAD_REQUEST,
                ),
            }
        }
        path => log_and_create_http_response(
            &format!("{path} not found"),
            StatusCode::NOT_FOUND,
        ),
    }
}

fn not_configured(path: &str) -> http::Result<Response<Full<Bytes>>> {
    log_and_create_http_response(&format!("{path} is not configured"), StatusCode::NOT_FOUND)
}

/// Serves the request trigger on `listener` until `cancel` fires.
pub async fn serve(
    listener: TcpListener,
    triggers: Triggers,
    cancel: CancellationToken,
) -> Result<(), io::Error> {
    let triggers = Arc::new(triggers);
    let server = hyper::server::conn::http1::Builder::new();
    let mut joinset = JoinSet::new();
    if let Ok(addr) = listener.local_addr() {
        info!("Request trigger listening on {addr}");
    }

    loop {
        let conn = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            con_res = listener.accept() => match con_res {
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionAborted
                            | io::ErrorKind::ConnectionReset
                            | io::ErrorKind::ConnectionRefused
                    ) =>
                {
                    continue;
                }
                Err(e) => {
                    error!("Server error: {e}");
                    return Err(e);
                }
                Ok((conn, _)) => conn,
            },
            finished = async {
                match joinset.join_next().await {
                    Some(finished) => finished,
                    None => std::future::pending().await,
                }
            } => match finished {
                Err(e) if e.is_panic() => {
                    error!("Connection handler panicked: {e:?}");
                    continue;
                }
                Ok(()) | Err(_) => continue,
            },
        };

        let conn = TokioIo::new(conn);
        let server = server.clone();
        let triggers = Arc::clone(&triggers);
        let cancel = cancel.clone();
        let service = service_fn(move |req| {
            let triggers = Arc::clone(&triggers);
            let cancel = cancel.child_token();
            async move { handle_request(req, &triggers, cancel).await }
        });
        joinset.spawn(async move {
            if let Err(e) = server.serve_connection(conn, service).await {
                error!("Connection error: {e}");
            }
        });
    }

    info!("Request trigger shutting down");
    joinset.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UpstreamError;
    use async_trait::async_trait;
    use http_body_util::BodyExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Instant;

    struct FakePipeline {
        fail: bool,
        runs: AtomicUsize,
    }

    impl FakePipeline {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                fail,
                runs: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Pipeline for FakePipeline {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn run(&self, _cancel: CancellationToken) -> PipelineRun {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let started = Instant::now();
            if self.fail {
                return PipelineRun::failed(
                    "fake",
                    FleetError::Enumeration(UpstreamError::Decode("boom".into())),
                    started,
                );
            }
            PipelineRun {
                name: "fake",
                state: crate::pipeline::Stage::Done,
                outcomes: Vec::new(),
                error: None,
                elapsed: started.elapsed(),
            }
        }
    }

    fn recording_factory(
        pipeline: Arc<FakePipeline>,
        seen: Arc<Mutex<Vec<String>>>,
    ) -> CapacityFactory {
        Arc::new(move |token: &str| {
            seen.lock().unwrap().push(token.to_string());
            let pipeline: Arc<dyn Pipeline> = pipeline.clone();
            Ok(pipeline)
        })
    }

    async fn body_message(response: Response<Full<Bytes>>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        value["message"].as_str().unwrap().to_string()
    }

    fn request(path: &str) -> hyper::http::request::Builder {
        Request::builder().method(Method::POST).uri(path)
    }

    #[tokio::test]
    async fn test_connectivity_route_runs_pipeline() {
        let pipeline = FakePipeline::new(false);
        let triggers = Triggers {
            connectivity: Some(pipeline.clone()),
            capacity: None,
        };
        let response = handle_request(
            request(CONNECTIVITY_PATH).body(()).unwrap(),
            &triggers,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_message(response).await, CONNECTIVITY_SUCCESS);
        assert_eq!(pipeline.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_capacity_requires_access_token() {
        let pipeline = FakePipeline::new(false);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let triggers = Triggers {
            connectivity: None,
            capacity: Some(recording_factory(pipeline.clone(), seen.clone())),
        };
        let response = handle_request(
            request(CAPACITY_PATH).body(()).unwrap(),
            &triggers,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_message(response).await, "ACCESS_TOKEN is missing");
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(pipeline.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_capacity_passes_token_through() {
        let pipeline = FakePipeline::new(false);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let triggers = Triggers {
            connectivity: None,
            capacity: Some(recording_factory(pipeline.clone(), seen.clone())),
        };
        let response = handle_request(
            request(CAPACITY_PATH)
                .header("ACCESS_TOKEN", "eyJ0eXAi")
                .body(())
                .unwrap(),
            &triggers,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_message(response).await, CAPACITY_SUCCESS);
        assert_eq!(*seen.lock().unwrap(), vec!["eyJ0eXAi".to_string()]);
    }

    #[tokio::test]
    async fn test_enumeration_failure_is_500() {
        let triggers = Triggers {
            connectivity: Some(FakePipeline::new(true)),
            capacity: None,
        };
        let response = handle_request(
            request(CONNECTIVITY_PATH).body(()).unwrap(),
            &triggers,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_unknown_and_unconfigured_routes() {
        let triggers = Triggers::default();
        for path in ["/api/other", CONNECTIVITY_PATH, CAPACITY_PATH] {
            let response = handle_request(
                request(path).body(()).unwrap(),
                &triggers,
                CancellationToken::new(),
            )
            .await
            .unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{path}");
        }

        let response = handle_request(
            Request::builder()
                .method(Method::DELETE)
                .uri(CONNECTIVITY_PATH)
                .body(())
                .unwrap(),
            &triggers,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_serve_until_cancelled() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let pipeline = FakePipeline::new(false);
        let triggers = Triggers {
            connectivity: Some(pipeline.clone()),
            capacity: None,
        };
        let cancel = CancellationToken::new();
        let server = tokio::spawn(serve(listener, triggers, cancel.clone()));

        let response = reqwest::Client::new()
            .get(format!("http://{addr}{CONNECTIVITY_PATH}"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
        assert_eq!(pipeline.runs.load(Ordering::SeqCst), 1);

        cancel.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_runs_until_cancelled() {
        let pipeline = FakePipeline::new(false);
        let cancel = CancellationToken::new();
        let timer = tokio::spawn(run_on_interval(
            pipeline.clone(),
            Duration::from_secs(300),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(650)).await;
        cancel.cancel();
        timer.await.unwrap();
        assert_eq!(pipeline.runs.load(Ordering::SeqCst), 3);
    }
}
