//! Real-time Acute Kidney Injury alerting over HL7/MLLP.
//!
//! The service holds one outbound MLLP session to the hospital integration
//! engine, keeps an in-memory patient record with a durable SQLite snapshot,
//! derives creatinine features for every incoming lab result, classifies
//! them with a pre-trained decision model, and pages the on-call team for
//! every positive prediction. Undelivered pages are queued on disk and
//! retried, so delivery is at-least-once across restarts.

use std::sync::Arc;

use log::{info, warn};
use tokio::sync::watch;

// Module declarations
pub mod config;
pub mod error;
pub mod metrics;
pub mod model;
pub mod protocol;
pub mod service;
pub mod storage;

use config::Config;
use error::Result;
use metrics::Metrics;
use protocol::mllp::MllpTransport;
use service::pager::{HttpPageSink, PagerDispatcher};
use service::predictor::{DecisionTreeModel, Predictor};
use service::supervisor::Supervisor;
use storage::store::PatientStore;

/// Wires the components together and runs the service until shutdown.
pub async fn run(config: Config) -> Result<()> {
    let metrics = Arc::new(Metrics::new()?);
    {
        let exported = Arc::clone(&metrics);
        let port = config.metrics_port;
        tokio::spawn(async move {
            if let Err(e) = metrics::serve(exported, port).await {
                warn!("Metrics server stopped: {}", e);
            }
        });
    }

    // The model must load before anything touches the wire.
    let predictor: Arc<dyn Predictor> = Arc::new(DecisionTreeModel::load(&config.model_path)?);

    let store = PatientStore::open(&config.db_path, &config.history_path).await?;
    if store.loaded() {
        info!("Database loaded correctly");
    } else {
        warn!("Database loaded without any test results");
    }

    let pager = PagerDispatcher::load(
        HttpPageSink::new(&config.pager.host, config.pager.port),
        &config.pager_queue_path,
    )?;

    let transport = MllpTransport::connect(&config.mllp.host, config.mllp.port).await;
    metrics.socket_reconnections.inc();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_listener(shutdown_tx);

    let mut supervisor = Supervisor::new(
        config,
        transport,
        store,
        predictor,
        pager,
        metrics,
        shutdown_rx,
    );
    supervisor.run().await
}

/// Translates SIGINT/SIGTERM into a shutdown notification for the main
/// loop; the handler itself does nothing else, so it stays re-entrant.
fn spawn_signal_listener(shutdown: watch::Sender<bool>) {
    tokio::spawn(async move {
        let interrupted = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut terminate = match signal(SignalKind::terminate()) {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Cannot install the SIGTERM handler: {}", e);
                    return;
                }
            };
            tokio::select! {
                _ = interrupted => {},
                _ = terminate.recv() => {},
            }
        }
        #[cfg(not(unix))]
        {
            let _ = interrupted.await;
        }
        info!("Shutdown signal received");
        let _ = shutdown.send(true);
    });
}
