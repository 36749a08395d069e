use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, error, info, warn};
use tokio::sync::watch;

use crate::config::Config;
use crate::error::Result;
use crate::metrics::Metrics;
use crate::model::patient::{DEFAULT_AGE, DEFAULT_SEX};
use crate::model::test_result::{parse_timestamp, CANONICAL_FORMAT};
use crate::protocol::error::ProtocolError;
use crate::protocol::hl7::{self, SystemMessage};
use crate::protocol::mllp::{self, MllpTransport};
use crate::service::features;
use crate::service::pager::{PageSink, PagerDispatcher};
use crate::service::predictor::{Label, Predictor};
use crate::storage::store::PatientStore;

/// LIMS messages slower than this end-to-end are counted separately.
const LATENCY_THRESHOLD_SECS: f64 = 3.0;

const DEBUG_REPORT_PATH: &str = "aki_predicted.csv";

/// Running aggregates backing the averaged gauges.
#[derive(Debug, Default)]
struct RunningStats {
    blood_sum: f64,
    blood_count: u64,
    aki_count: u64,
    latency_sum: f64,
}

/// Debug-mode capture: per-LIMS latencies and the pages we decided to send.
#[derive(Debug, Default)]
struct DebugRecorder {
    latencies: Vec<f64>,
    positives: Vec<(String, String)>,
}

/// Owns the per-message pipeline: read a frame, classify, mutate the store,
/// page on positives, persist, acknowledge. Single writer for clinical
/// state; errors never cross a message boundary.
pub struct Supervisor<S: PageSink> {
    config: Config,
    transport: MllpTransport,
    store: PatientStore,
    predictor: Arc<dyn Predictor>,
    pager: PagerDispatcher<S>,
    metrics: Arc<Metrics>,
    shutdown: watch::Receiver<bool>,
    stats: RunningStats,
    recorder: Option<DebugRecorder>,
}

impl<S: PageSink> Supervisor<S> {
    pub fn new(
        config: Config,
        transport: MllpTransport,
        store: PatientStore,
        predictor: Arc<dyn Predictor>,
        pager: PagerDispatcher<S>,
        metrics: Arc<Metrics>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let recorder = config.debug.then(DebugRecorder::default);
        Self {
            config,
            transport,
            store,
            predictor,
            pager,
            metrics,
            shutdown,
            stats: RunningStats::default(),
            recorder,
        }
    }

    /// Runs until a shutdown signal arrives. An in-flight read is abandoned
    /// on shutdown; everything else runs to completion first.
    pub async fn run(&mut self) -> Result<()> {
        loop {
            let (frame, reconnect_needed) = tokio::select! {
                _ = self.shutdown.changed() => break,
                read = self.transport.read_frame() => read,
            };

            if reconnect_needed {
                self.transport =
                    MllpTransport::connect(&self.config.mllp.host, self.config.mllp.port).await;
                self.metrics.socket_reconnections.inc();
                continue;
            }

            let Some(buffer) = frame else {
                warn!("No data received.");
                continue;
            };
            let Some(payload) = mllp::unframe(&buffer) else {
                warn!("No valid MLLP message received.");
                continue;
            };

            if let Err(e) = self.handle_message(&payload).await {
                self.metrics.failures.inc();
                error!("There was an exception in the main loop: {}", e);
            }
        }
        self.shutdown_cleanly().await;
        Ok(())
    }

    /// One message end to end. Nothing is acknowledged until the store has
    /// persisted the mutation, so a restart never loses an acked message.
    async fn handle_message(&mut self, payload: &[u8]) -> Result<()> {
        let text = std::str::from_utf8(payload).map_err(|_| ProtocolError::InvalidEncoding)?;
        let message = hl7::classify(text)?;
        debug!("Parsed message: {:?}", message);
        self.metrics.messages.inc();

        match message {
            SystemMessage::Admit { mrn, age, sex } => {
                self.metrics.patients_admitted.inc();
                info!("PAS-admit: inserting {} into the store...", mrn);
                self.store.insert_patient(&mrn, age, sex);
                if self.store.get_patient(&mrn).is_none() {
                    warn!("Failed to insert patient {}, trying once more", mrn);
                    self.store.insert_patient(&mrn, age, sex);
                }
            }
            SystemMessage::Discharge { mrn } => {
                self.metrics.patients_discharged.inc();
                info!("PAS-discharge: discharging {}...", mrn);
                self.store.discharge_patient(&mrn);
                if self.store.get_patient(&mrn).is_some() {
                    warn!("Failed to discharge patient {}, trying once more", mrn);
                    self.store.discharge_patient(&mrn);
                }
            }
            SystemMessage::LabResult {
                mrn,
                observed_at,
                creatinine,
            } => {
                self.handle_lab_result(&mrn, &observed_at, creatinine).await?;
            }
        }

        self.store.persist().await?;
        debug!("Sending ACK message...");
        self.transport.send(&hl7::acknowledgement()).await?;
        Ok(())
    }

    async fn handle_lab_result(
        &mut self,
        mrn: &str,
        observed_at: &str,
        creatinine: f64,
    ) -> Result<()> {
        let start = Instant::now();
        info!("Message from LIMS; retrieving patient history...");
        let observed = parse_timestamp(observed_at)
            .map_err(|e| ProtocolError::InvalidTimestamp(e.0))?;
        let history = self.store.get_patient_history(mrn);

        self.stats.blood_sum += creatinine;
        self.stats.blood_count += 1;
        self.metrics.blood_tests.inc();
        self.metrics
            .blood_test_average
            .set(self.stats.blood_sum / self.stats.blood_count as f64);

        let label = if let Some(first) = history.first() {
            debug!("Patient history found");
            let row = features::feature_row(first.age, first.sex, creatinine, observed, &history);
            self.predictor.predict(&row)
        } else if let Some(patient) = self.store.get_patient(mrn) {
            debug!("Patient {} has no prior test results", mrn);
            let (age, sex) = (patient.age, patient.sex);
            let row = features::feature_row(age, sex, creatinine, observed, &history);
            self.predictor.predict(&row)
        } else {
            info!(
                "No such patient in the patients table; inserting {} with default values",
                mrn
            );
            self.store.insert_patient(mrn, DEFAULT_AGE, DEFAULT_SEX);
            Label::NotAki
        };

        if label.is_positive() {
            let delivered = self.pager.dispatch(mrn, observed_at).await?;
            if !delivered {
                self.metrics.failures.inc();
            }
            self.metrics.positive_akis.inc();
            self.stats.aki_count += 1;
            self.metrics
                .positive_aki_rate
                .set(self.stats.aki_count as f64 / self.stats.blood_count as f64);
            if let Some(recorder) = self.recorder.as_mut() {
                recorder
                    .positives
                    .push((mrn.to_string(), observed_at.to_string()));
            }
        }

        let latency = start.elapsed().as_secs_f64();
        if latency > LATENCY_THRESHOLD_SECS {
            self.metrics.latency_exceeded.inc();
        }
        self.stats.latency_sum += latency;
        self.metrics
            .latency_average
            .set(self.stats.latency_sum / self.stats.blood_count as f64);
        if let Some(recorder) = self.recorder.as_mut() {
            recorder.latencies.push(latency);
        }

        self.store.insert_test_result(mrn, observed, creatinine);
        if self.store.get_test_result(mrn, observed).is_none() {
            warn!(
                "Failed to insert test result for {} at {}, trying once more",
                mrn, observed_at
            );
            self.store.insert_test_result(mrn, observed, creatinine);
        }
        Ok(())
    }

    /// Persist, flush the pager queue and close the socket. Best effort:
    /// failures are logged, the process still exits cleanly.
    async fn shutdown_cleanly(&mut self) {
        info!("Graceful shutdown procedure started.");
        if let Err(e) = self.store.persist().await {
            error!("Failed to persist the store during shutdown: {}", e);
        } else {
            info!("Database persisted.");
        }
        self.store.close().await;
        if let Err(e) = self.pager.flush() {
            error!("Failed to write the pager queue during shutdown: {}", e);
        }
        if self.pager.pending() > 0 {
            warn!("Shutting down with {} undelivered pages", self.pager.pending());
        }
        self.transport.close().await;
        info!("MLLP connection closed.");
        if let Some(recorder) = self.recorder.take() {
            if let Err(e) = write_debug_report(&recorder) {
                error!("Failed to write the debug report: {}", e);
            }
        }
    }
}

/// Logs a latency summary and writes the predicted positives to CSV.
fn write_debug_report(recorder: &DebugRecorder) -> Result<()> {
    if !recorder.latencies.is_empty() {
        let mut sorted = recorder.latencies.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
        let mean = sorted.iter().sum::<f64>() / sorted.len() as f64;
        let median = features::median(sorted.clone());
        let p99_index = ((sorted.len() as f64 * 0.99).ceil() as usize)
            .saturating_sub(1)
            .min(sorted.len() - 1);
        info!(
            "Latency over {} LIMS messages: mean={:.4}s median={:.4}s min={:.4}s max={:.4}s p99={:.4}s",
            sorted.len(),
            mean,
            median,
            sorted[0],
            sorted[sorted.len() - 1],
            sorted[p99_index]
        );
    }

    let mut writer =
        csv::Writer::from_path(DEBUG_REPORT_PATH).map_err(|e| crate::error::Error::Internal(e.to_string()))?;
    writer
        .write_record(["mrn", "date"])
        .map_err(|e| crate::error::Error::Internal(e.to_string()))?;
    for (mrn, date) in &recorder.positives {
        let normalized = parse_timestamp(date)
            .map(|d| d.format(CANONICAL_FORMAT).to_string())
            .unwrap_or_else(|_| date.clone());
        writer
            .write_record([mrn.as_str(), normalized.as_str()])
            .map_err(|e| crate::error::Error::Internal(e.to_string()))?;
    }
    writer.flush()?;
    info!(
        "Wrote {} predicted positives to {}",
        recorder.positives.len(),
        DEBUG_REPORT_PATH
    );
    Ok(())
}

// ============================================================================
// INTEGRATION-STYLE TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Endpoint;
    use crate::model::features::FeatureRow;
    use crate::protocol::mllp;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    struct AlwaysPositive;

    impl Predictor for AlwaysPositive {
        fn predict(&self, _row: &FeatureRow) -> Label {
            Label::Aki
        }
    }

    /// Sink that accepts every page and records the bodies it saw.
    struct RecordingSink {
        sent: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingSink {
        fn new() -> (Self, Arc<Mutex<Vec<String>>>) {
            let sent = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    sent: Arc::clone(&sent),
                },
                sent,
            )
        }
    }

    #[async_trait]
    impl PageSink for RecordingSink {
        async fn post(&self, body: &str) -> std::result::Result<u16, String> {
            self.sent.lock().unwrap().push(body.to_string());
            Ok(200)
        }
    }

    fn test_config(dir: &TempDir, mllp_port: u16) -> Config {
        Config {
            history_path: dir.path().join("history.csv"),
            mllp: Endpoint {
                host: "127.0.0.1".to_string(),
                port: mllp_port,
            },
            pager: Endpoint {
                host: "127.0.0.1".to_string(),
                port: 0,
            },
            db_path: dir.path().join("database.db"),
            pager_queue_path: dir.path().join("pager.pkl"),
            model_path: dir.path().join("dt_model.json"),
            metrics_port: 0,
            debug: false,
        }
    }

    async fn read_ack(upstream: &mut TcpStream) -> String {
        let mut buffer = Vec::new();
        let mut chunk = [0u8; 1024];
        while !buffer.contains(&mllp::MLLP_END_BLOCK) {
            let n = upstream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "upstream closed before the ACK arrived");
            buffer.extend_from_slice(&chunk[..n]);
        }
        String::from_utf8(mllp::unframe(&buffer).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_admit_then_lab_result_pages_and_persists() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("history.csv"),
            "mrn,creatinine_date_0,creatinine_result_0\n",
        )
        .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = test_config(&dir, port);

        let store = PatientStore::open(&config.db_path, &config.history_path)
            .await
            .unwrap();
        let (sink, sent) = RecordingSink::new();
        let pager = PagerDispatcher::load(sink, &config.pager_queue_path).unwrap();
        let transport_task = tokio::spawn(MllpTransport::connect("127.0.0.1", port));
        let (mut upstream, _) = listener.accept().await.unwrap();
        let transport = transport_task.await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut supervisor = Supervisor::new(
            config,
            transport,
            store,
            Arc::new(AlwaysPositive),
            pager,
            Arc::new(Metrics::new().unwrap()),
            shutdown_rx,
        );
        let service = tokio::spawn(async move {
            supervisor.run().await.unwrap();
            supervisor
        });

        let admit = "MSH|^~\\&|SIMULATION|SOUTH RIVERSIDE|||20240924102800||ADT^A01|||2.5\rPID|1||722269||SAFFRON CURTIS||19891008|F";
        upstream.write_all(&mllp::frame(admit)).await.unwrap();
        assert!(read_ack(&mut upstream).await.contains("MSA|AA|"));

        let lab = "MSH|^~\\&|SIMULATION|SOUTH RIVERSIDE|||20240924153600||ORU^R01|||2.5\rPID|1||722269\rOBR|1||||||20240924153600\rOBX|1|SN|CREATININE||120.5";
        upstream.write_all(&mllp::frame(lab)).await.unwrap();
        assert!(read_ack(&mut upstream).await.contains("MSA|AA|"));

        shutdown_tx.send(true).unwrap();
        let supervisor = service.await.unwrap();
        assert_eq!(*sent.lock().unwrap(), vec!["722269,20240924153600"]);
        assert_eq!(supervisor.metrics.positive_akis.get(), 1);
        assert_eq!(supervisor.metrics.messages.get(), 2);

        // Acknowledged mutations must be visible after a restart.
        let reopened = PatientStore::open(
            &dir.path().join("database.db"),
            &dir.path().join("history.csv"),
        )
        .await
        .unwrap();
        let patient = reopened.get_patient("722269").unwrap();
        assert_eq!(patient.sex, crate::model::patient::Sex::Female);
        assert_eq!(
            reopened.get_test_result("722269", parse_timestamp("20240924153600").unwrap()),
            Some(120.5)
        );
    }

    #[tokio::test]
    async fn test_unknown_mrn_lab_result_defaults_and_does_not_page() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("history.csv"),
            "mrn,creatinine_date_0,creatinine_result_0\n",
        )
        .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = test_config(&dir, port);

        let store = PatientStore::open(&config.db_path, &config.history_path)
            .await
            .unwrap();
        let (sink, sent) = RecordingSink::new();
        let pager = PagerDispatcher::load(sink, &config.pager_queue_path).unwrap();
        let transport_task = tokio::spawn(MllpTransport::connect("127.0.0.1", port));
        let (mut upstream, _) = listener.accept().await.unwrap();
        let transport = transport_task.await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut supervisor = Supervisor::new(
            config,
            transport,
            store,
            // Even an always-positive model must not page for an unknown MRN.
            Arc::new(AlwaysPositive),
            pager,
            Arc::new(Metrics::new().unwrap()),
            shutdown_rx,
        );
        let service = tokio::spawn(async move {
            supervisor.run().await.unwrap();
            supervisor
        });

        let lab = "MSH|^~\\&|SIMULATION|SOUTH RIVERSIDE|||20240924153600||ORU^R01|||2.5\rPID|1||99999\rOBR|1||||||20240924153600\rOBX|1|SN|CREATININE||120.5";
        upstream.write_all(&mllp::frame(lab)).await.unwrap();
        assert!(read_ack(&mut upstream).await.contains("MSA|AA|"));

        shutdown_tx.send(true).unwrap();
        let supervisor = service.await.unwrap();
        assert!(sent.lock().unwrap().is_empty());
        assert_eq!(supervisor.metrics.positive_akis.get(), 0);

        let reopened = PatientStore::open(
            &dir.path().join("database.db"),
            &dir.path().join("history.csv"),
        )
        .await
        .unwrap();
        let patient = reopened.get_patient("99999").unwrap();
        assert_eq!(patient.age, DEFAULT_AGE);
        assert_eq!(patient.sex, DEFAULT_SEX);
    }

    #[tokio::test]
    async fn test_malformed_message_counts_a_failure_and_sends_no_ack() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("history.csv"),
            "mrn,creatinine_date_0,creatinine_result_0\n",
        )
        .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = test_config(&dir, port);

        let store = PatientStore::open(&config.db_path, &config.history_path)
            .await
            .unwrap();
        let (sink, sent) = RecordingSink::new();
        let pager = PagerDispatcher::load(sink, &config.pager_queue_path).unwrap();
        let transport_task = tokio::spawn(MllpTransport::connect("127.0.0.1", port));
        let (mut upstream, _) = listener.accept().await.unwrap();
        let transport = transport_task.await.unwrap();

        let metrics = Arc::new(Metrics::new().unwrap());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut supervisor = Supervisor::new(
            config,
            transport,
            store,
            Arc::new(AlwaysPositive),
            pager,
            Arc::clone(&metrics),
            shutdown_rx,
        );
        let service = tokio::spawn(async move {
            supervisor.run().await.unwrap();
            supervisor
        });

        // A one-segment message cannot be classified; it is dropped without
        // an ACK.
        upstream
            .write_all(&mllp::frame("MSH|...|..."))
            .await
            .unwrap();
        while metrics.failures.get() == 0 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        // A valid discharge afterwards proves the loop survived.
        let discharge = "MSH|^~\\&|SIMULATION|SOUTH RIVERSIDE|||20240924153400||ADT^A03|||2.5\rPID|1||853518";
        upstream.write_all(&mllp::frame(discharge)).await.unwrap();
        let ack = read_ack(&mut upstream).await;
        assert!(ack.contains("MSA|AA|"));

        shutdown_tx.send(true).unwrap();
        service.await.unwrap();
        assert_eq!(metrics.failures.get(), 1);
        assert_eq!(metrics.messages.get(), 1);
        assert!(sent.lock().unwrap().is_empty());
    }
}
