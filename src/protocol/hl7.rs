use chrono::{Datelike, Local, NaiveDate};

use super::error::{ProtocolError, Result};
use super::mllp;
use crate::model::patient::Sex;

// ============================================================================
// MESSAGE CLASSIFICATION
// ============================================================================

/// A classified upstream message. Classification is structural (segment and
/// field counts), not by message-type code: the upstream feed only ever
/// carries PAS admissions, PAS discharges and LIMS creatinine results.
#[derive(Debug, Clone, PartialEq)]
pub enum SystemMessage {
    Admit { mrn: String, age: i64, sex: Sex },
    Discharge { mrn: String },
    LabResult {
        mrn: String,
        observed_at: String,
        creatinine: f64,
    },
}

impl SystemMessage {
    pub fn mrn(&self) -> &str {
        match self {
            SystemMessage::Admit { mrn, .. } => mrn,
            SystemMessage::Discharge { mrn } => mrn,
            SystemMessage::LabResult { mrn, .. } => mrn,
        }
    }
}

/// Lab-result messages carry MSH, PID, OBR and OBX; PAS messages stop at PID.
const LAB_RESULT_SEGMENT_COUNT: usize = 4;

/// An admission PID carries name, birthdate and sex past the MRN; a
/// discharge PID stops at the MRN.
const ADMIT_PID_FIELD_COUNT: usize = 4;

fn field<'a>(fields: &[&'a str], segment: &'static str, index: usize) -> Result<&'a str> {
    fields
        .get(index)
        .copied()
        .filter(|value| !value.is_empty())
        .ok_or(ProtocolError::MissingField { segment, index })
}

fn segment_fields<'a>(segments: &[&'a str], index: usize) -> Result<Vec<&'a str>> {
    let segment = segments
        .get(index)
        .ok_or(ProtocolError::MissingSegment(index))?;
    Ok(segment.split('|').collect())
}

/// Classifies a raw HL7 payload (CR-separated segments) into a
/// [`SystemMessage`].
pub fn classify(payload: &str) -> Result<SystemMessage> {
    let segments: Vec<&str> = payload
        .split('\r')
        .map(|segment| segment.trim_start_matches('\n'))
        .collect();

    let pid_fields = segment_fields(&segments, 1)?;
    if segments.len() < LAB_RESULT_SEGMENT_COUNT {
        if pid_fields.len() > ADMIT_PID_FIELD_COUNT {
            let mrn = field(&pid_fields, "PID", 3)?;
            let date_of_birth = field(&pid_fields, "PID", 7)?;
            let sex_field = field(&pid_fields, "PID", 8)?;
            let age = age_on_current_date(date_of_birth)?;
            let sex_letter = sex_field
                .chars()
                .next()
                .ok_or(ProtocolError::MissingField { segment: "PID", index: 8 })?;
            let sex = Sex::from_letter(sex_letter)
                .ok_or_else(|| ProtocolError::InvalidSexCode(sex_letter.to_string()))?;
            Ok(SystemMessage::Admit {
                mrn: mrn.to_string(),
                age,
                sex,
            })
        } else {
            let mrn = field(&pid_fields, "PID", 3)?;
            Ok(SystemMessage::Discharge {
                mrn: mrn.to_string(),
            })
        }
    } else {
        let mrn = field(&pid_fields, "PID", 3)?;
        let obr_fields = segment_fields(&segments, 2)?;
        let observed_at = field(&obr_fields, "OBR", 7)?;
        let obx_fields = segment_fields(&segments, 3)?;
        let value = field(&obx_fields, "OBX", 5)?;
        let creatinine: f64 = value.parse().map_err(|_| ProtocolError::InvalidNumber {
            segment: "OBX",
            index: 5,
            value: value.to_string(),
        })?;
        if !creatinine.is_finite() || creatinine < 0.0 {
            return Err(ProtocolError::InvalidNumber {
                segment: "OBX",
                index: 5,
                value: value.to_string(),
            });
        }
        Ok(SystemMessage::LabResult {
            mrn: mrn.to_string(),
            observed_at: observed_at.to_string(),
            creatinine,
        })
    }
}

// ============================================================================
// AGE CALCULATION
// ============================================================================

fn age_on_current_date(date_of_birth: &str) -> Result<i64> {
    let dob = NaiveDate::parse_from_str(date_of_birth, "%Y%m%d")
        .map_err(|_| ProtocolError::InvalidTimestamp(date_of_birth.to_string()))?;
    Ok(age_at(dob, Local::now().date_naive()))
}

/// Full years between birth and `today`, adjusting for whether the birthday
/// has passed this year.
pub fn age_at(dob: NaiveDate, today: NaiveDate) -> i64 {
    let mut age = i64::from(today.year() - dob.year());
    if (today.month(), today.day()) < (dob.month(), dob.day()) {
        age -= 1;
    }
    age
}

// ============================================================================
// ACKNOWLEDGEMENT
// ============================================================================

/// Builds the MLLP-framed ACK the upstream expects after every accepted
/// message.
pub fn acknowledgement() -> Vec<u8> {
    let timestamp = Local::now().format("%Y%m%d%H%M%S");
    let ack = format!("MSH|^~\\&|||||{}||ACK||P|2.5\rMSA|AA|\r", timestamp);
    mllp::frame(&ack)
}

// ============================================================================
// UNIT TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pas_admit_message() {
        let message = "MSH|^~\\&|SIMULATION|SOUTH RIVERSIDE|||20240924102800||ADT^A01|||2.5\rPID|1||722269||SAFFRON CURTIS||19891008|F";
        let expected_age = age_at(
            NaiveDate::from_ymd_opt(1989, 10, 8).unwrap(),
            Local::now().date_naive(),
        );
        let parsed = classify(message).unwrap();
        assert_eq!(
            parsed,
            SystemMessage::Admit {
                mrn: "722269".to_string(),
                age: expected_age,
                sex: Sex::Female,
            }
        );
    }

    #[test]
    fn test_pas_discharge_message() {
        let message = "MSH|^~\\&|SIMULATION|SOUTH RIVERSIDE|||20240924153400||ADT^A03|||2.5\rPID|1||853518";
        let parsed = classify(message).unwrap();
        assert_eq!(
            parsed,
            SystemMessage::Discharge {
                mrn: "853518".to_string(),
            }
        );
    }

    #[test]
    fn test_lims_message() {
        let message = "MSH|^~\\&|SIMULATION|SOUTH RIVERSIDE|||20240924153600||ORU^R01|||2.5\rPID|1||54229\rOBR|1||||||20240924153600\rOBX|1|SN|CREATININE||103.56923163550283";
        let parsed = classify(message).unwrap();
        assert_eq!(
            parsed,
            SystemMessage::LabResult {
                mrn: "54229".to_string(),
                observed_at: "20240924153600".to_string(),
                creatinine: 103.56923163550283,
            }
        );
    }

    #[test]
    fn test_trailing_segment_separator_is_tolerated() {
        let message = "MSH|^~\\&|SIMULATION|SOUTH RIVERSIDE|||20240924153400||ADT^A03|||2.5\rPID|1||853518\r";
        assert_eq!(classify(message).unwrap().mrn(), "853518");
    }

    #[test]
    fn test_incomplete_message_surfaces_parse_error() {
        assert!(classify("MSH|...|...").is_err());
        // Lab-result shaped message with no creatinine value.
        let message = "MSH|1\rPID|1||54229\rOBR|1||||||20240924153600\rOBX|1|SN|CREATININE";
        assert!(matches!(
            classify(message),
            Err(ProtocolError::MissingField { segment: "OBX", index: 5 })
        ));
    }

    #[test]
    fn test_non_numeric_creatinine_is_rejected() {
        let message = "MSH|1\rPID|1||54229\rOBR|1||||||20240924153600\rOBX|1|SN|CREATININE||high";
        assert!(matches!(
            classify(message),
            Err(ProtocolError::InvalidNumber { .. })
        ));
    }

    #[test]
    fn test_age_counts_full_years_only() {
        let today = NaiveDate::from_ymd_opt(2021, 5, 21).unwrap();
        let cases = [
            ("19890521", 32), // birthday earlier today
            ("19890522", 31), // birthday tomorrow
            ("20001231", 20), // birthday later in the year
        ];
        for (dob, expected) in cases {
            let dob = NaiveDate::parse_from_str(dob, "%Y%m%d").unwrap();
            assert_eq!(age_at(dob, today), expected);
        }
    }

    #[test]
    fn test_acknowledgement_is_a_framed_hl7_ack() {
        let framed = acknowledgement();
        let payload = mllp::unframe(&framed).unwrap();
        let text = String::from_utf8(payload).unwrap();
        assert!(text.starts_with("MSH|^~\\&|"));
        assert!(text.contains("||ACK||P|2.5\r"));
        assert!(text.contains("MSA|AA|"));
    }
}
