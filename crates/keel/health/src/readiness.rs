//! Readiness prober
//!
//! Runs a container's readiness checks in declaration order. Each check gets a
//! fresh deadline and is retried with backoff until it passes or expires.

use keel_engine::{ContainerEngine, LifecycleState};
use keel_types::{Container, HttpMethod, ProbeKind, ReadinessSpec};
use reqwest::StatusCode;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::backoff::{retry_within, BackoffConfig};
use crate::error::{HealthError, Result};
use crate::progress::{Outcome, Reporter};

pub struct ReadinessProber {
    engine: Arc<dyn ContainerEngine>,
    client: reqwest::Client,
    backoff: BackoffConfig,
}

impl ReadinessProber {
    pub fn new(engine: Arc<dyn ContainerEngine>, backoff: BackoffConfig) -> Self {
        Self {
            engine,
            client: reqwest::Client::new(),
            backoff,
        }
    }

    /// Probe `container` until every spec passes.
    ///
    /// `specs` must already have their bodies resolved. Sends exactly one
    /// `SUCCESS` or `FAILED`, unless the reporter's token is cancelled first.
    pub async fn ready(&self, reporter: Reporter, container: &Container, specs: &[ReadinessSpec]) -> Outcome {
        let result = self.probe_all(&reporter, container, specs).await;

        match &result {
            Ok(()) => info!(container = %reporter.key(), checks = specs.len(), "Container ready"),
            Err(HealthError::Cancelled) => debug!(container = %reporter.key(), "Readiness wait cancelled"),
            Err(err) => warn!(container = %reporter.key(), error = %err, "Readiness failed"),
        }

        reporter.finish(result).await
    }

    async fn probe_all(&self, reporter: &Reporter, container: &Container, specs: &[ReadinessSpec]) -> Result<()> {
        for spec in specs {
            if reporter.is_cancelled() {
                return Err(HealthError::Cancelled);
            }

            retry_within(reporter, self.backoff, spec.timeout(), move || self.probe(container, spec)).await?;
            debug!(container = %reporter.key(), check = %spec.name, "Readiness check passed");
        }
        Ok(())
    }

    #[instrument(skip_all, fields(check = %spec.name))]
    async fn probe(&self, container: &Container, spec: &ReadinessSpec) -> Result<()> {
        match &spec.kind {
            ProbeKind::Url { url, method, body } => self.probe_url(url, *method, body).await,
            ProbeKind::Command { command } => self.probe_command(container, command).await,
        }
    }

    async fn probe_url(&self, url: &str, method: HttpMethod, body: &BTreeMap<String, String>) -> Result<()> {
        let request = match method {
            HttpMethod::Get => self.client.get(url),
            HttpMethod::Post => self.client.post(url),
        };

        let response = request.json(body).send().await?;
        match response.status() {
            StatusCode::OK => Ok(()),
            status => Err(HealthError::UnexpectedStatus(status.as_u16())),
        }
    }

    async fn probe_command(&self, container: &Container, command: &[String]) -> Result<()> {
        let observed = self.engine.state(container).await;
        if observed.state != LifecycleState::Running {
            return Err(HealthError::NotRunning(observed.state.to_string()));
        }

        let result = self.engine.exec(container, command).await?;
        match result.exit_code {
            0 => Ok(()),
            code => Err(HealthError::ExitCode(code)),
        }
    }
}
