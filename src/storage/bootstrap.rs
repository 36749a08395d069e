use std::path::Path;

use log::info;

use crate::error::{Error, Result};
use crate::model::test_result::{parse_timestamp, TestResult};

/// Reads the historical test results CSV. Each row is
/// `mrn, date_1, result_1, date_2, result_2, …` with a variable number of
/// pairs and trailing empty cells. Patients are never populated from the
/// CSV; they materialize via PAS admissions only.
pub fn load_history(path: &Path) -> Result<Vec<TestResult>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .map_err(|e| {
            Error::Bootstrap(format!("cannot open history file {}: {}", path.display(), e))
        })?;

    let mut results = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| Error::Bootstrap(e.to_string()))?;
        let mut fields: Vec<&str> = record.iter().collect();
        while fields.last().is_some_and(|field| field.is_empty()) {
            fields.pop();
        }
        let Some((mrn, pairs)) = fields.split_first() else {
            continue;
        };
        if pairs.len() % 2 != 0 {
            return Err(Error::Bootstrap(format!(
                "history row for {} has a date without a result",
                mrn
            )));
        }
        for pair in pairs.chunks(2) {
            let date = parse_timestamp(pair[0])
                .map_err(|e| Error::Bootstrap(format!("history row for {}: {}", mrn, e)))?;
            let result: f64 = pair[1].parse().map_err(|_| {
                Error::Bootstrap(format!(
                    "history row for {} has a non-numeric result: {}",
                    mrn, pair[1]
                ))
            })?;
            results.push(TestResult {
                mrn: mrn.to_string(),
                date,
                result,
            });
        }
    }
    info!("Loaded {} historical test results from CSV", results.len());
    Ok(results)
}
