//! micro-server binary
//!
//! Hosts the built-in gateway routes (metrics, docs, static files) without
//! any gRPC service; useful as a static file server and for smoke tests.

use micro_server::{Service, Settings, init_telemetry};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration first (needed for logging settings)
    let settings = match Settings::load() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            eprintln!("Using default configuration");
            Settings::default()
        }
    };

    let level = settings.logging.level.as_deref().unwrap_or("info");
    if let Err(e) = common::logging::init_with_level(level, settings.logging.format) {
        eprintln!("{}", e);
    }

    let telemetry = init_telemetry(&settings.telemetry.service_name, settings.telemetry.enabled);

    tracing::info!("micro-server starting");

    let mut builder = Service::builder().settings(&settings).on_shutdown(|| {
        tracing::info!("micro-server shut down");
    });
    if let Some(guard) = &telemetry {
        builder = builder.tracer(guard.tracer("micro-server"));
    }

    let service = builder.build();
    service
        .start(
            settings.server.http_port,
            settings.server.rpc_port,
            |_mux, _endpoint| Ok(()),
        )
        .await?;

    // Telemetry guard shuts the provider down on drop
    Ok(())
}
