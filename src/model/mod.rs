pub mod features;
pub mod patient;
pub mod test_result;

pub use features::FeatureRow;
pub use patient::{Patient, Sex};
pub use test_result::TestResult;
