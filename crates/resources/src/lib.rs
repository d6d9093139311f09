//! Host-side resources for sandboxed scripts.
//!
//! Each resource implements [`scriptbox_common::Resource`] and is registered
//! in a [`ResourceSet`] under its name. Scripts reach them through the
//! `request` intrinsic (`"kv.set"`) or the logging shorthands (`log_info`).

pub mod file_config;
pub mod kv;
pub mod log;
pub mod metric;
pub mod outbound;
pub mod set;

pub use {
    file_config::FileConfigResource,
    kv::KvResource,
    log::{LogLevel, LogSink, LoggingResource, MemoryLogSink, TracingLogSink},
    metric::{Aggregator, FacadeMetricsSink, MetricEvent, MetricsResource, MetricsSink},
    outbound::{
        MemoryOutboundSink, OutboundKind, OutboundMessage, OutboundResource, OutboundSink,
        TracingOutboundSink,
    },
    set::ResourceSet,
};
