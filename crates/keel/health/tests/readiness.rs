//! Readiness prober against a local HTTP server and the simulated engine.

use axum::extract::State as AxumState;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use keel_engine::{ContainerEngine, LifecycleState, SimulatedEngine};
use keel_health::{BackoffConfig, HealthError, Outcome, Progress, ProgressMessage, ReadinessProber, Reporter};
use keel_types::{Container, ContainerDefinition, HttpMethod, NodeId, ProbeKind, ReadinessSpec};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn fast() -> BackoffConfig {
    BackoffConfig {
        initial: Duration::from_millis(10),
        max: Duration::from_millis(20),
        multiplier: 2.0,
    }
}

fn container() -> Container {
    Container::new("keel", ContainerDefinition::new("app", "web", "nginx"), 1, NodeId::new(1))
}

fn channel_reporter(container: &Container, token: &CancellationToken) -> (Reporter, mpsc::Receiver<ProgressMessage>) {
    let (tx, rx) = mpsc::channel(256);
    (Reporter::new(container.key(), tx, token.clone()), rx)
}

async fn drain(mut rx: mpsc::Receiver<ProgressMessage>) -> Vec<Progress> {
    let mut seen = Vec::new();
    while let Some(message) = rx.recv().await {
        seen.push(message.progress);
    }
    seen
}

fn terminal_count(seen: &[Progress]) -> usize {
    seen.iter().filter(|p| **p != Progress::Checking).count()
}

/// Serves `/healthy` (always 200), `/flaky` (503 for the first calls) and
/// `/echo` (200 only when the JSON body carries `status = up`).
async fn serve() -> (String, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));

    async fn flaky(AxumState(hits): AxumState<Arc<AtomicUsize>>) -> StatusCode {
        if hits.fetch_add(1, Ordering::SeqCst) < 3 {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            StatusCode::OK
        }
    }

    async fn echo(Json(body): Json<BTreeMap<String, String>>) -> StatusCode {
        match body.get("status").map(String::as_str) {
            Some("up") => StatusCode::OK,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    let app = Router::new()
        .route("/healthy", get(|| async { StatusCode::OK }))
        .route("/flaky", get(flaky))
        .route("/echo", post(echo))
        .with_state(hits.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{addr}"), hits)
}

#[tokio::test]
async fn url_probe_succeeds_on_200() {
    let (base, _) = serve().await;
    let prober = ReadinessProber::new(Arc::new(SimulatedEngine::new()), fast());
    let container = container();
    let token = CancellationToken::new();
    let (reporter, rx) = channel_reporter(&container, &token);

    let spec = ReadinessSpec::url("http", format!("{base}/healthy"));
    let outcome = prober.ready(reporter, &container, &[spec]).await;

    assert_eq!(outcome, Outcome::Success);
    assert_eq!(drain(rx).await, vec![Progress::Success]);
}

#[tokio::test]
async fn url_probe_retries_until_200() {
    let (base, hits) = serve().await;
    let prober = ReadinessProber::new(Arc::new(SimulatedEngine::new()), fast());
    let container = container();
    let token = CancellationToken::new();
    let (reporter, rx) = channel_reporter(&container, &token);

    let spec = ReadinessSpec::url("flaky", format!("{base}/flaky")).with_timeout(Duration::from_secs(5));
    let outcome = prober.ready(reporter, &container, &[spec]).await;

    assert_eq!(outcome, Outcome::Success);
    assert_eq!(hits.load(Ordering::SeqCst), 4);
    let seen = drain(rx).await;
    assert_eq!(seen, vec![Progress::Checking, Progress::Checking, Progress::Checking, Progress::Success]);
}

#[tokio::test]
async fn url_probe_posts_json_body() {
    let (base, _) = serve().await;
    let prober = ReadinessProber::new(Arc::new(SimulatedEngine::new()), fast());
    let container = container();
    let token = CancellationToken::new();

    let mut body = BTreeMap::new();
    body.insert("status".to_string(), "up".to_string());
    let spec = ReadinessSpec {
        name: "echo".into(),
        kind: ProbeKind::Url {
            url: format!("{base}/echo"),
            method: HttpMethod::Post,
            body,
        },
        timeout_ms: Some(2_000),
    };

    let (reporter, _rx) = channel_reporter(&container, &token);
    assert_eq!(prober.ready(reporter, &container, &[spec]).await, Outcome::Success);
}

#[tokio::test]
async fn url_probe_fails_after_deadline_with_single_terminal_message() {
    let (base, _) = serve().await;
    let prober = ReadinessProber::new(Arc::new(SimulatedEngine::new()), fast());
    let container = container();
    let token = CancellationToken::new();
    let (reporter, rx) = channel_reporter(&container, &token);

    let spec = ReadinessSpec::url("missing", format!("{base}/missing")).with_timeout(Duration::from_millis(150));
    let outcome = prober.ready(reporter, &container, &[spec]).await;

    match outcome {
        Outcome::Failed(HealthError::Timeout { last_error, .. }) => assert!(last_error.contains("404")),
        other => panic!("unexpected outcome {other:?}"),
    }
    let seen = drain(rx).await;
    assert_eq!(terminal_count(&seen), 1);
    assert_eq!(seen.last(), Some(&Progress::Failed));
}

#[tokio::test]
async fn command_probe_requires_running_container() {
    let engine = Arc::new(SimulatedEngine::new());
    let prober = ReadinessProber::new(engine.clone(), fast());
    let container = container();
    let token = CancellationToken::new();

    let spec = ReadinessSpec::command("exec", vec!["true".into()]).with_timeout(Duration::from_millis(100));

    let (reporter, _rx) = channel_reporter(&container, &token);
    let outcome = prober.ready(reporter, &container, &[spec.clone()]).await;
    match outcome {
        Outcome::Failed(HealthError::Timeout { last_error, .. }) => assert!(last_error.contains("not running")),
        other => panic!("unexpected outcome {other:?}"),
    }

    engine.run(&container).await.unwrap();
    let (reporter, _rx) = channel_reporter(&container, &token);
    assert_eq!(prober.ready(reporter, &container, &[spec]).await, Outcome::Success);
}

#[tokio::test]
async fn command_probe_requires_zero_exit_code() {
    let engine = Arc::new(SimulatedEngine::new());
    let prober = ReadinessProber::new(engine.clone(), fast());
    let container = container();
    engine.run(&container).await.unwrap();
    engine.set_exec_exit_code(1);

    let token = CancellationToken::new();
    let (reporter, _rx) = channel_reporter(&container, &token);
    let spec = ReadinessSpec::command("exec", vec!["false".into()]).with_timeout(Duration::from_millis(80));

    let outcome = prober.ready(reporter, &container, &[spec]).await;
    match outcome {
        Outcome::Failed(HealthError::Timeout { last_error, .. }) => assert!(last_error.contains("code 1")),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(engine.state_of(&container.generated_name()), LifecycleState::Running);
}

#[tokio::test]
async fn checks_run_in_order_and_all_must_pass() {
    let (base, _) = serve().await;
    let engine = Arc::new(SimulatedEngine::new());
    let prober = ReadinessProber::new(engine.clone(), fast());
    let container = container();
    engine.run(&container).await.unwrap();

    let token = CancellationToken::new();
    let (reporter, _rx) = channel_reporter(&container, &token);
    let specs = [
        ReadinessSpec::url("http", format!("{base}/healthy")),
        ReadinessSpec::command("exec", vec!["true".into()]),
    ];

    assert_eq!(prober.ready(reporter, &container, &specs).await, Outcome::Success);
    assert_eq!(engine.calls("exec"), 1);
}

#[tokio::test]
async fn cancel_suppresses_terminal_message() {
    let prober = ReadinessProber::new(Arc::new(SimulatedEngine::new()), fast());
    let container = container();
    let token = CancellationToken::new();
    let (reporter, rx) = channel_reporter(&container, &token);

    let spec = ReadinessSpec::command("exec", vec!["true".into()]);
    let canceller = tokio::spawn({
        let token = token.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            token.cancel();
        }
    });

    let outcome = prober.ready(reporter, &container, &[spec]).await;
    canceller.await.unwrap();

    assert_eq!(outcome, Outcome::Cancelled);
    assert_eq!(terminal_count(&drain(rx).await), 0);
}
