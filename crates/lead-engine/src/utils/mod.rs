//! Utilities module - message signal detection and input validation

pub mod signal_extractor;
pub mod validation;

pub use signal_extractor::{DetectedSignals, SignalExtractor};
pub use validation::validate_session_id;
