//! Subscription Service entry point.

use service_core::middleware::metrics::install_recorder;
use service_core::observability::init_tracing;
use subscription_service::config::SubscriptionConfig;
use subscription_service::services::init_metrics;
use subscription_service::startup::Application;
use tokio::signal;

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let config = SubscriptionConfig::load().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        std::io::Error::other(format!("Configuration error: {}", e))
    })?;

    init_tracing(
        &config.service_name,
        &config.common.log_level,
        config.common.otlp_endpoint.as_deref(),
    );

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting subscription-service");

    install_recorder();
    init_metrics();

    // Secrets stay out of the log.
    tracing::info!(
        service_name = %config.service_name,
        http_port = config.common.port,
        store = ?config.store,
        currency = %config.billing.currency,
        free_storage_gb = config.billing.free_storage_gb,
        checkout_timeout_minutes = config.billing.checkout_timeout_minutes,
        renewal_grace_days = config.billing.renewal_grace_days,
        razorpay_api = %config.razorpay.api_base_url,
        "Configuration loaded"
    );

    let app = Application::build(config).await.map_err(|e| {
        tracing::error!(error = %e, "Failed to build application");
        std::io::Error::other(format!("Application build error: {}", e))
    })?;

    tokio::select! {
        result = app.run_until_stopped() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Server error");
                return Err(e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("Shutting down");
        }
    }

    Ok(())
}
