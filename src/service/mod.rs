// Service layer implementations

pub mod features;
pub mod pager;
pub mod predictor;
pub mod supervisor;

// Re-exports
pub use pager::{HttpPageSink, PagerDispatcher};
pub use predictor::{DecisionTreeModel, Predictor};
pub use supervisor::Supervisor;
