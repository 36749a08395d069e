use std::fmt::{Display, Formatter, Result};

use serde::{Deserialize, Serialize};

/// Age assigned when a lab result arrives for an MRN never seen on PAS.
pub const DEFAULT_AGE: i64 = 35;

/// Sex assigned when a lab result arrives for an MRN never seen on PAS.
pub const DEFAULT_SEX: Sex = Sex::Female;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sex {
    Male,
    Female,
}

impl Sex {
    /// Parses the single-letter code from PAS messages, case-insensitively.
    pub fn from_letter(letter: char) -> Option<Self> {
        match letter {
            'M' | 'm' => Some(Sex::Male),
            'F' | 'f' => Some(Sex::Female),
            _ => None,
        }
    }

    pub fn as_letter(&self) -> &'static str {
        match self {
            Sex::Male => "M",
            Sex::Female => "F",
        }
    }

    /// Label encoding expected by the trained model.
    pub fn encode(&self) -> f64 {
        match self {
            Sex::Male => 0.0,
            Sex::Female => 1.0,
        }
    }
}

impl Display for Sex {
    fn fmt(&self, f: &mut Formatter) -> Result {
        write!(f, "{}", self.as_letter())
    }
}

/// An active patient known from a PAS admission (or the LIMS default
/// fallback). Test results outlive this record after discharge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patient {
    pub mrn: String,
    pub age: i64,
    pub sex: Sex,
}
