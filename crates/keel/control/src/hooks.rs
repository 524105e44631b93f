//! Pre-run and post-run hooks
//!
//! Pre-run resolves the definition's templated values into the container's
//! runtime section and lets the engine prepare resources. Post-run publishes
//! service discovery records once the container passed readiness.

use keel_engine::{ContainerEngine, DnsCache, EngineError, TemplateResolver};
use keel_types::{Container, DependencySpec, ProbeKind, ReadinessSpec};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub struct Hooks {
    engine: Arc<dyn ContainerEngine>,
    dns: Arc<dyn DnsCache>,
    templates: Arc<dyn TemplateResolver>,
    dependency_timeout: Duration,
    readiness_timeout: Duration,
}

impl Hooks {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        dns: Arc<dyn DnsCache>,
        templates: Arc<dyn TemplateResolver>,
        dependency_timeout: Duration,
        readiness_timeout: Duration,
    ) -> Self {
        Self {
            engine,
            dns,
            templates,
            dependency_timeout,
            readiness_timeout,
        }
    }

    /// Resolve configuration, environment and readiness targets, then run the
    /// engine's own pre-run step. The container is only modified on success.
    pub async fn pre_run(&self, container: &mut Container) -> Result<(), EngineError> {
        let spec = &container.definition.spec;

        let mut values = identity(container);
        let mut configuration = BTreeMap::new();
        let mut object_dependencies = Vec::new();
        for (key, raw) in &spec.configuration {
            let resolved = self.templates.parse(key, raw, &values)?;
            merge(&mut object_dependencies, resolved.object_dependencies);
            configuration.insert(key.clone(), resolved.value);
        }
        values.extend(configuration.clone());

        let mut env = Vec::with_capacity(spec.env.len());
        for entry in &spec.env {
            let key = entry.split_once('=').map(|(k, _)| k).unwrap_or(entry);
            let resolved = self.templates.parse(key, entry, &values)?;
            merge(&mut object_dependencies, resolved.object_dependencies);
            env.push(resolved.value);
        }

        let mut readiness = Vec::with_capacity(spec.readiness.len());
        for check in &spec.readiness {
            readiness.push(self.resolve_readiness(check, &values)?);
        }

        let mut prepared = container.clone();
        prepared.runtime.configuration = configuration;
        prepared.runtime.object_dependencies = object_dependencies;
        prepared.runtime.env = env;
        prepared.runtime.readiness = readiness;

        self.engine.pre_run(&prepared).await?;
        debug!(container = %prepared.key(), "Pre-run hook completed");

        *container = prepared;
        Ok(())
    }

    fn resolve_readiness(
        &self,
        check: &ReadinessSpec,
        values: &BTreeMap<String, String>,
    ) -> Result<ReadinessSpec, EngineError> {
        let mut resolved = check.clone();
        if resolved.timeout_ms.is_none() {
            resolved = resolved.with_timeout(self.readiness_timeout);
        }

        if let ProbeKind::Url { url, body, .. } = &mut resolved.kind {
            *url = self.templates.parse(&check.name, url, values)?.value;
            for (key, value) in body.iter_mut() {
                *value = self.templates.parse(key, value, values)?.value;
            }
        }
        Ok(resolved)
    }

    /// Dependencies with the node's default deadline filled in.
    pub fn dependencies(&self, container: &Container) -> Vec<DependencySpec> {
        container
            .definition
            .spec
            .dependencies
            .iter()
            .map(|dependency| match dependency.timeout_ms {
                Some(_) => dependency.clone(),
                None => dependency.clone().with_timeout(self.dependency_timeout),
            })
            .collect()
    }

    pub async fn init(&self, container: &Container) -> Result<(), EngineError> {
        self.engine.init_container(container).await
    }

    pub async fn post_run(&self, container: &Container) -> Result<(), EngineError> {
        self.engine.post_run(container).await?;
        self.engine.update_dns(container, self.dns.as_ref()).await
    }

    pub async fn remove_dns(&self, container: &Container) -> Result<(), EngineError> {
        self.engine.remove_dns(container, self.dns.as_ref()).await
    }
}

/// Values every template can reference.
fn identity(container: &Container) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("group".to_string(), container.id.group.clone()),
        ("name".to_string(), container.id.name.clone()),
        ("index".to_string(), container.id.index.to_string()),
        ("hostname".to_string(), container.generated_name()),
    ])
}

fn merge(into: &mut Vec<String>, from: Vec<String>) {
    for dependency in from {
        if !into.contains(&dependency) {
            into.push(dependency);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_engine::{FailurePoint, InMemoryDnsCache, PlaceholderResolver, SimulatedEngine};
    use keel_types::{ContainerDefinition, HttpMethod, NodeId};

    fn hooks(engine: Arc<SimulatedEngine>) -> Hooks {
        Hooks::new(
            engine,
            Arc::new(InMemoryDnsCache::new()),
            Arc::new(PlaceholderResolver),
            Duration::from_secs(7),
            Duration::from_secs(9),
        )
    }

    #[tokio::test]
    async fn test_pre_run_resolves_templates() {
        let mut definition = ContainerDefinition::new("app", "web", "nginx")
            .with_configuration("port", "8080")
            .with_configuration("url", "http://{{ hostname }}:80")
            .with_readiness(ReadinessSpec {
                name: "http".into(),
                kind: ProbeKind::Url {
                    url: "http://127.0.0.1:{{ port }}/health".into(),
                    method: HttpMethod::Post,
                    body: BTreeMap::from([("who".to_string(), "{{ hostname }}".to_string())]),
                },
                timeout_ms: None,
            });
        definition.spec.env.push("PORT={{ port }}".to_string());

        let mut container = Container::new("keel", definition, 1, NodeId::new(1));
        hooks(Arc::new(SimulatedEngine::new()))
            .pre_run(&mut container)
            .await
            .unwrap();

        let runtime = &container.runtime;
        assert_eq!(runtime.configuration["url"], "http://app-web-1:80");
        assert_eq!(runtime.env, vec!["PORT=8080".to_string()]);
        assert_eq!(runtime.readiness[0].timeout(), Duration::from_secs(9));
        match &runtime.readiness[0].kind {
            ProbeKind::Url { url, body, .. } => {
                assert_eq!(url, "http://127.0.0.1:8080/health");
                assert_eq!(body["who"], "app-web-1");
            }
            other => panic!("unexpected probe {other:?}"),
        }
        assert!(runtime.object_dependencies.contains(&"port".to_string()));
    }

    #[tokio::test]
    async fn test_pre_run_failure_leaves_container_untouched() {
        let mut definition = ContainerDefinition::new("app", "web", "nginx");
        definition.spec.env.push("SECRET={{ missing }}".to_string());
        let mut container = Container::new("keel", definition, 1, NodeId::new(1));
        let before = container.clone();

        let result = hooks(Arc::new(SimulatedEngine::new())).pre_run(&mut container).await;
        assert!(matches!(result, Err(EngineError::Template { .. })));
        assert_eq!(container, before);

        let engine = Arc::new(SimulatedEngine::new());
        engine.inject_failure(FailurePoint::PreRun);
        let mut container = Container::new("keel", ContainerDefinition::new("app", "web", "nginx"), 1, NodeId::new(1));
        assert!(hooks(engine).pre_run(&mut container).await.is_err());
        assert!(container.runtime.readiness.is_empty());
    }

    #[test]
    fn test_dependencies_get_default_deadline() {
        let definition = ContainerDefinition::new("app", "web", "nginx")
            .with_dependency(DependencySpec::new("db", "*"))
            .with_dependency(DependencySpec::new("db", "db-pg-1").with_timeout(Duration::from_secs(1)));
        let container = Container::new("keel", definition, 1, NodeId::new(1));

        let dependencies = hooks(Arc::new(SimulatedEngine::new())).dependencies(&container);
        assert_eq!(dependencies[0].timeout(), Duration::from_secs(7));
        assert_eq!(dependencies[1].timeout(), Duration::from_secs(1));
    }
}
