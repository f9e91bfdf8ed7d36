pub mod types;
pub mod utils;

pub use types::{ExecutionOutcome, ExecutionRequest, ExecutionResult, UserStats};
