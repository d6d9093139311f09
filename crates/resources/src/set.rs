//! Registry of resources available to a session.

use std::{collections::HashMap, sync::Arc};

use {
    scriptbox_common::{Reply, Resource, ResourceContext, split_request_name},
    scriptbox_config::ResourcesConfig,
    serde_json::Value,
    tracing::{debug, error, info},
};

use crate::{
    file_config::FileConfigResource,
    kv::KvResource,
    log::{LogSink, LoggingResource},
    metric::{FacadeMetricsSink, MetricsResource},
    outbound::{OutboundResource, TracingOutboundSink},
};

/// Named resources, looked up by the prefix of a request name.
#[derive(Default, Clone)]
pub struct ResourceSet {
    resources: HashMap<String, Arc<dyn Resource>>,
}

impl ResourceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the resources enabled in `config`. Outbound messages go to
    /// tracing; register an [`OutboundResource`] to deliver them elsewhere.
    ///
    /// Fails when an enabled resource is missing required settings.
    pub fn from_config(config: &ResourcesConfig, log_sink: Arc<dyn LogSink>) -> anyhow::Result<Self> {
        let mut set = Self::new();
        if config.log.enabled {
            set.register(Arc::new(LoggingResource::new(log_sink)));
        }
        if config.kv.enabled {
            set.register(Arc::new(KvResource::from_config(&config.kv)));
        }
        if config.metrics.enabled {
            let Some(prefix) = config.metrics.prefix.as_deref().filter(|p| !p.is_empty()) else {
                anyhow::bail!("metrics resource enabled without resources.metrics.prefix");
            };
            set.register(Arc::new(MetricsResource::new(
                prefix,
                Box::new(FacadeMetricsSink),
            )));
        }
        if config.config.enabled {
            set.register(Arc::new(FileConfigResource::new(config.config.keys.clone())));
        }
        if config.outbound.enabled {
            set.register(Arc::new(OutboundResource::from_config(
                &config.outbound,
                Arc::new(TracingOutboundSink),
            )));
        }
        Ok(set)
    }

    /// Register a resource, replacing any resource with the same name.
    pub fn register(&mut self, resource: Arc<dyn Resource>) {
        let name = resource.name().to_string();
        info!(resource = %name, "sandbox resource registered");
        self.resources.insert(name, resource);
    }

    /// Builder-style [`register`](Self::register).
    #[must_use]
    pub fn with(mut self, resource: Arc<dyn Resource>) -> Self {
        self.register(resource);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.resources.contains_key(name)
    }

    /// Registered resource names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.resources.keys().cloned().collect();
        names.sort();
        names
    }

    /// Route `"<resource>.<operation>"` to its resource.
    ///
    /// Never fails: unknown names and resource errors become failed replies.
    pub async fn dispatch(&self, ctx: &ResourceContext, request: &str, payload: Value) -> Reply {
        let Some((name, operation)) = split_request_name(request) else {
            return Reply::failure(format!("Invalid request name: {request}"));
        };
        let Some(resource) = self.resources.get(name) else {
            debug!(sandbox = %ctx.sandbox_id, request, "request for unknown resource");
            return Reply::failure(format!("Unknown resource: {name}"));
        };
        match resource.handle(ctx, operation, payload).await {
            Ok(reply) => reply,
            Err(e) => {
                error!(sandbox = %ctx.sandbox_id, request, error = %e, "resource failed");
                Reply::failure(e.to_string())
            },
        }
    }
}
