use std::{error::Error, sync::Arc};

use opentelemetry::{global, propagation::TextMapCompositePropagator, trace::TraceError, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{propagation::TraceContextPropagator, runtime, trace, Resource};
use tracing_core::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::{
    config::{ReporterKind, TraceConfig},
    reporter::{LogReporter, OtelReporter, Reporter},
    tracer::{Engine, Tracer},
};

/// Sets up logging, trace propagation and the transaction engine described
/// by `config`, see [`TraceConfig::from_env`].
///
/// With [`ReporterKind::Otlp`] transactions and `tracing` spans are exported
/// to `config.endpoint`; with [`ReporterKind::Log`] transactions are logged.
/// A disabled config still installs logging but returns
/// [`Engine::Disabled`].
///
/// This should generally be the first statement of any server binary's main
/// function.
pub fn setup(config: &TraceConfig) -> Result<Engine, Box<dyn Error>> {
    global::set_text_map_propagator(TextMapCompositePropagator::new(vec![
        Box::new(TraceContextPropagator::new()),
        Box::new(opentelemetry_jaeger_propagator::Propagator::new()),
    ]));

    if !config.enabled {
        init_subscriber(None)?;
        tracing::info!("transaction tracing disabled");
        return Ok(Engine::Disabled);
    }

    let reporter: Arc<dyn Reporter> = match config.reporter {
        ReporterKind::Otlp => {
            let tracer = init_tracer(&config.service_name, &config.endpoint)?;
            init_subscriber(Some(tracer))?;
            Arc::new(OtelReporter::new())
        }
        ReporterKind::Log => {
            init_subscriber(None)?;
            Arc::new(LogReporter)
        }
    };

    let tracer = Tracer::builder()
        .service_name(config.service_name.clone())
        .reporter(reporter)
        .build();

    tracing::info!(
        service = %config.service_name,
        reporter = ?config.reporter,
        "starting server"
    );
    Ok(Engine::from(tracer))
}

fn init_tracer(service: &str, endpoint: &str) -> Result<trace::Tracer, TraceError> {
    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .with_trace_config(trace::config().with_resource(Resource::new(vec![KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_NAME,
            service.to_string(),
        )])))
        .install_batch(runtime::Tokio)
}

fn init_subscriber(tracer: Option<trace::Tracer>) -> Result<(), Box<dyn Error>> {
    let telemetry = tracer.map(|tracer| tracing_opentelemetry::layer().with_tracer(tracer));

    Registry::default()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy()
        }))
        .with(tracing_subscriber::fmt::layer())
        .with(telemetry)
        .try_init()?;

    Ok(())
}

/// Flushes and shuts down the exporter pipeline installed by [`setup`].
pub fn teardown() {
    global::shutdown_tracer_provider();
}
