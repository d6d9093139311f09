//! Metrics resource.
//!
//! `metrics.fire {store, metric, value, agg}` validates the event and hands it
//! to a [`MetricsSink`]. The default sink publishes through the `metrics`
//! facade, so whichever recorder the host installed receives the values.

use std::{fmt, str::FromStr, sync::OnceLock};

use {
    anyhow::Result,
    async_trait::async_trait,
    regex::Regex,
    scriptbox_common::{Reply, Resource, ResourceContext},
    serde_json::Value,
    tracing::debug,
};

fn name_pattern() -> Option<&'static Regex> {
    static NAME: OnceLock<Option<Regex>> = OnceLock::new();
    NAME.get_or_init(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9._-]{0,100}$").ok())
        .as_ref()
}

// ── Aggregator ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregator {
    Sum,
    Avg,
    Min,
    Max,
    Last,
}

impl Aggregator {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Avg => "avg",
            Self::Min => "min",
            Self::Max => "max",
            Self::Last => "last",
        }
    }
}

impl fmt::Display for Aggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Aggregator {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "sum" => Ok(Self::Sum),
            "avg" => Ok(Self::Avg),
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            "last" => Ok(Self::Last),
            other => Err(format!("Invalid metric aggregator {other:?}.")),
        }
    }
}

// ── MetricEvent ─────────────────────────────────────────────────────────────

/// A validated metric value fired by a script.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricEvent {
    pub store: String,
    pub metric: String,
    pub value: f64,
    pub agg: Aggregator,
}

impl MetricEvent {
    fn parse_name(value: Option<&Value>, kind: &str) -> std::result::Result<String, String> {
        let Some(value) = value else {
            return Err(format!("Missing {kind} name."));
        };
        let Some(name) = value.as_str() else {
            return Err(format!("Invalid type for {kind} name: {value}"));
        };
        if !name_pattern().is_some_and(|re| re.is_match(name)) {
            return Err(format!("Invalid {kind} name: {name:?}."));
        }
        Ok(name.to_string())
    }

    fn parse_value(value: Option<&Value>) -> std::result::Result<f64, String> {
        let parsed = match value {
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        parsed.ok_or_else(|| {
            format!(
                "Invalid metric value {}.",
                value.cloned().unwrap_or(Value::Null)
            )
        })
    }

    /// Build an event from a `metrics.fire` payload.
    pub fn from_payload(payload: &Value) -> std::result::Result<Self, String> {
        let default_store = Value::String("default".into());
        let store = Self::parse_name(Some(payload.get("store").unwrap_or(&default_store)), "store")?;
        let metric = Self::parse_name(payload.get("metric"), "metric")?;
        let value = Self::parse_value(payload.get("value"))?;
        let agg = match payload.get("agg") {
            Some(Value::String(agg)) => agg.parse::<Aggregator>()?,
            other => {
                return Err(format!(
                    "Invalid metric aggregator {}",
                    other.cloned().unwrap_or(Value::Null)
                ));
            },
        };
        Ok(Self {
            store,
            metric,
            value,
            agg,
        })
    }
}

// ── MetricsSink ─────────────────────────────────────────────────────────────

/// Destination for fired metric events.
pub trait MetricsSink: Send + Sync {
    fn publish(&self, prefix: &str, event: &MetricEvent);
}

/// Publishes events through the `metrics` facade as
/// `<prefix>.stores.<store>.<metric>` gauges labelled with the aggregator.
#[derive(Debug, Default)]
pub struct FacadeMetricsSink;

impl MetricsSink for FacadeMetricsSink {
    fn publish(&self, prefix: &str, event: &MetricEvent) {
        let name = format!("{prefix}.stores.{}.{}", event.store, event.metric);
        ::metrics::gauge!(name, "agg" => event.agg.as_str()).set(event.value);
    }
}

/// The `metrics` resource.
pub struct MetricsResource {
    prefix: String,
    sink: Box<dyn MetricsSink>,
}

impl MetricsResource {
    pub fn new(prefix: impl Into<String>, sink: Box<dyn MetricsSink>) -> Self {
        Self {
            prefix: prefix.into(),
            sink,
        }
    }
}

#[async_trait]
impl Resource for MetricsResource {
    fn name(&self) -> &str {
        "metrics"
    }

    async fn handle(&self, ctx: &ResourceContext, operation: &str, payload: Value) -> Result<Reply> {
        if operation != "fire" {
            return Ok(Reply::failure(format!(
                "Unknown operation: metrics.{operation}"
            )));
        }
        match MetricEvent::from_payload(&payload) {
            Ok(event) => {
                debug!(sandbox = %ctx.sandbox_id, metric = %event.metric, agg = %event.agg, "firing metric");
                self.sink.publish(&self.prefix, &event);
                Ok(Reply::ok())
            },
            Err(reason) => Ok(Reply::failure(reason)),
        }
    }
}
