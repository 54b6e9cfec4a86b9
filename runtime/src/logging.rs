//! Structured logging.
//!
//! Every log line that concerns a pod or container carries its ID so logs
//! can be correlated with the gRPC status the caller saw.

#[doc(hidden)]
pub use tracing::{event, Level};

/// The most basic requirements for emitting a log:
/// - Log level.
/// - Pod or container ID, when the event concerns one.
/// - A format string plus irritants, as for [`tracing::event!`].
#[macro_export]
macro_rules! log {
    ($level:expr, pod: $pod:expr, $($arg:tt)+) => {{
        let pod: &$crate::ids::PodId = $pod;
        $crate::logging::event!($level, pod_id = %pod, $($arg)+);
    }};
    ($level:expr, container: $container:expr, $($arg:tt)+) => {{
        let container: &$crate::ids::ContainerId = $container;
        $crate::logging::event!($level, container_id = %container, $($arg)+);
    }};
}

#[macro_export]
macro_rules! log_error {
    (pod: $pod:expr, $($arg:tt)+) => {
        $crate::log!($crate::logging::Level::ERROR, pod: $pod, $($arg)+)
    };
    (container: $container:expr, $($arg:tt)+) => {
        $crate::log!($crate::logging::Level::ERROR, container: $container, $($arg)+)
    };
}

#[macro_export]
macro_rules! log_warn {
    (pod: $pod:expr, $($arg:tt)+) => {
        $crate::log!($crate::logging::Level::WARN, pod: $pod, $($arg)+)
    };
    (container: $container:expr, $($arg:tt)+) => {
        $crate::log!($crate::logging::Level::WARN, container: $container, $($arg)+)
    };
}

#[macro_export]
macro_rules! log_info {
    (pod: $pod:expr, $($arg:tt)+) => {
        $crate::log!($crate::logging::Level::INFO, pod: $pod, $($arg)+)
    };
    (container: $container:expr, $($arg:tt)+) => {
        $crate::log!($crate::logging::Level::INFO, container: $container, $($arg)+)
    };
}

/// Log an error when there is no pod/container ID to attach yet, such as
/// a request that failed to parse before an ID was known.
/// Prefer [`log_error`] whenever an ID is available.
#[macro_export]
macro_rules! log_error_globally {
    ($($arg:tt)+) => {
        $crate::logging::event!($crate::logging::Level::ERROR, $($arg)+);
    };
}

/// See [`log_error_globally`].
#[macro_export]
macro_rules! log_info_globally {
    ($($arg:tt)+) => {
        $crate::logging::event!($crate::logging::Level::INFO, $($arg)+);
    };
}

/// Install the global `tracing` subscriber, with an OpenTelemetry log bridge
/// so runtime logs and any future trace export share one pipeline.
pub fn init(log_level: &str) -> anyhow::Result<opentelemetry_sdk::logs::LoggerProvider> {
    use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, Layer};

    let exporter = opentelemetry_stdout::LogExporter::default();
    let provider = opentelemetry_sdk::logs::LoggerProvider::builder()
        .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
        .build();
    let otel_layer = OpenTelemetryTracingBridge::new(&provider);

    let make_filter = || EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_filter(make_filter());

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(otel_layer.with_filter(make_filter()))
        .try_init()
        .map_err(|error| anyhow::anyhow!("Failed installing tracing subscriber: {error}"))?;

    Ok(provider)
}
