use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::NaiveDateTime;
use log::{debug, info};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::model::patient::{Patient, Sex};
use crate::model::test_result::{parse_timestamp, TestResult, CANONICAL_FORMAT};
use crate::storage::bootstrap;

const CREATE_PATIENTS: &str = "
    CREATE TABLE IF NOT EXISTS patients (
        mrn TEXT PRIMARY KEY,
        age INTEGER,
        sex TEXT
    )
";

const CREATE_TEST_RESULTS: &str = "
    CREATE TABLE IF NOT EXISTS test_results (
        mrn TEXT,
        date TEXT,
        result REAL,
        PRIMARY KEY (mrn, date)
    )
";

/// One row of the patients/test_results join, ordered by test date.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRow {
    pub mrn: String,
    pub age: i64,
    pub sex: Sex,
    pub date: NaiveDateTime,
    pub result: f64,
}

/// Authoritative in-memory patient and test-result tables with a durable
/// SQLite snapshot. All reads and writes go through the in-memory working
/// set; `persist` replaces the on-disk copy with a full snapshot inside one
/// transaction, so a crash mid-persist leaves the previous snapshot intact.
pub struct PatientStore {
    patients: HashMap<String, Patient>,
    test_results: HashMap<String, BTreeMap<NaiveDateTime, f64>>,
    /// MRNs whose rows still have to be deleted from the on-disk copy.
    discharge_queue: HashSet<String>,
    disk: SqlitePool,
    disk_lock: Mutex<()>,
    /// Advisory telemetry only; correctness depends on the lock alone.
    disk_in_use: AtomicBool,
}

impl PatientStore {
    /// Opens the store: loads the snapshot if one exists on disk, otherwise
    /// seeds the test-result table from the history CSV and persists once so
    /// a snapshot file always exists. The CSV is read before the snapshot
    /// file is created, so a failed bootstrap leaves nothing behind.
    pub async fn open(snapshot_path: &Path, history_path: &Path) -> Result<Self> {
        let snapshot_existed = snapshot_path.exists();
        let seed = if snapshot_existed {
            None
        } else {
            info!(
                "No snapshot found; loading history from {}",
                history_path.display()
            );
            Some(bootstrap::load_history(history_path)?)
        };

        if let Some(parent) = snapshot_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(snapshot_path)
            .create_if_missing(true);
        let disk = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        sqlx::query(CREATE_PATIENTS).execute(&disk).await?;
        sqlx::query(CREATE_TEST_RESULTS).execute(&disk).await?;

        let mut store = Self {
            patients: HashMap::new(),
            test_results: HashMap::new(),
            discharge_queue: HashSet::new(),
            disk,
            disk_lock: Mutex::new(()),
            disk_in_use: AtomicBool::new(false),
        };

        match seed {
            None => {
                info!("Loading the on-disk snapshot into memory");
                store.load_snapshot().await?;
            }
            Some(results) => {
                for result in results {
                    store.insert_test_result(&result.mrn, result.date, result.result);
                }
                store.persist().await?;
            }
        }
        Ok(store)
    }

    async fn load_snapshot(&mut self) -> Result<()> {
        let rows = sqlx::query("SELECT mrn, age, sex FROM patients")
            .fetch_all(&self.disk)
            .await?;
        for row in rows {
            let mrn: String = row.get("mrn");
            let age: i64 = row.get("age");
            let sex: String = row.get("sex");
            let sex = sex
                .chars()
                .next()
                .and_then(Sex::from_letter)
                .ok_or_else(|| {
                    Error::Database(format!("corrupt snapshot: bad sex code for {}", mrn))
                })?;
            self.patients.insert(mrn.clone(), Patient { mrn, age, sex });
        }

        let rows = sqlx::query("SELECT mrn, date, result FROM test_results")
            .fetch_all(&self.disk)
            .await?;
        for row in rows {
            let mrn: String = row.get("mrn");
            let date: String = row.get("date");
            let result: f64 = row.get("result");
            let date = parse_timestamp(&date)
                .map_err(|e| Error::Database(format!("corrupt snapshot: {}", e)))?;
            self.test_results.entry(mrn).or_default().insert(date, result);
        }
        Ok(())
    }

    /// Inserts a patient; inserting an existing MRN is a no-op. A pending
    /// on-disk delete for the MRN is cancelled (re-admission).
    pub fn insert_patient(&mut self, mrn: &str, age: i64, sex: Sex) {
        self.discharge_queue.remove(mrn);
        if self.patients.contains_key(mrn) {
            debug!("Patient {} is already in the patients table", mrn);
            return;
        }
        self.patients.insert(
            mrn.to_string(),
            Patient {
                mrn: mrn.to_string(),
                age,
                sex,
            },
        );
    }

    /// Removes the patient from the active set and queues the on-disk
    /// delete. Test results are kept for historic data.
    pub fn discharge_patient(&mut self, mrn: &str) {
        self.discharge_queue.insert(mrn.to_string());
        self.patients.remove(mrn);
    }

    pub fn get_patient(&self, mrn: &str) -> Option<&Patient> {
        self.patients.get(mrn)
    }

    /// Records a test result; a duplicate `(mrn, date)` is dropped silently.
    pub fn insert_test_result(&mut self, mrn: &str, date: NaiveDateTime, result: f64) {
        let results = self.test_results.entry(mrn.to_string()).or_default();
        if results.contains_key(&date) {
            debug!(
                "Test result at {} for {} is already in the test_results table",
                date, mrn
            );
            return;
        }
        results.insert(date, result);
    }

    pub fn get_test_result(&self, mrn: &str, date: NaiveDateTime) -> Option<f64> {
        self.test_results.get(mrn)?.get(&date).copied()
    }

    pub fn get_test_results(&self, mrn: &str) -> Vec<TestResult> {
        self.test_results
            .get(mrn)
            .map(|results| {
                results
                    .iter()
                    .map(|(date, result)| TestResult {
                        mrn: mrn.to_string(),
                        date: *date,
                        result: *result,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Patient info joined with every test result, ordered by date
    /// ascending. Empty when the patient is not in the active set.
    pub fn get_patient_history(&self, mrn: &str) -> Vec<HistoryRow> {
        let Some(patient) = self.patients.get(mrn) else {
            return Vec::new();
        };
        self.test_results
            .get(mrn)
            .map(|results| {
                results
                    .iter()
                    .map(|(date, result)| HistoryRow {
                        mrn: patient.mrn.clone(),
                        age: patient.age,
                        sex: patient.sex,
                        date: *date,
                        result: *result,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether any test results are present (startup sanity probe).
    pub fn loaded(&self) -> bool {
        self.test_results.values().any(|results| !results.is_empty())
    }

    /// Writes a complete snapshot of the in-memory tables to disk in one
    /// transaction, applies queued discharges against the disk copy, then
    /// clears the discharge queue. Safe to re-run after a failure: the
    /// queued deletes are idempotent.
    pub async fn persist(&mut self) -> Result<()> {
        let _guard = self.disk_lock.lock().await;
        self.disk_in_use.store(true, Ordering::SeqCst);
        let outcome = self.write_snapshot().await;
        self.disk_in_use.store(false, Ordering::SeqCst);
        outcome?;
        self.discharge_queue.clear();
        Ok(())
    }

    async fn write_snapshot(&self) -> Result<()> {
        let mut tx = self.disk.begin().await?;
        sqlx::query("DELETE FROM patients").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM test_results")
            .execute(&mut *tx)
            .await?;
        for patient in self.patients.values() {
            sqlx::query("INSERT INTO patients (mrn, age, sex) VALUES (?, ?, ?)")
                .bind(&patient.mrn)
                .bind(patient.age)
                .bind(patient.sex.as_letter())
                .execute(&mut *tx)
                .await?;
        }
        for (mrn, results) in &self.test_results {
            for (date, result) in results {
                sqlx::query("INSERT INTO test_results (mrn, date, result) VALUES (?, ?, ?)")
                    .bind(mrn)
                    .bind(date.format(CANONICAL_FORMAT).to_string())
                    .bind(*result)
                    .execute(&mut *tx)
                    .await?;
            }
        }
        for mrn in &self.discharge_queue {
            sqlx::query("DELETE FROM patients WHERE mrn = ?")
                .bind(mrn)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.disk.close().await;
    }
}

// ============================================================================
// UNIT TESTS
// ============================================================================
