pub mod escape_analysis;

use serde::Deserialize;

pub use escape_analysis::{EscapeAnalysis, EscapeAnalysisError};

/// Flags controlling the optimization passes in this crate.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct PassConfig {
    /// Emit a `tracing` event for every state transition of the escape
    /// analysis (forwarded states, copies, merges, escape transitions).
    #[serde(default)]
    pub trace_escape_analysis: bool,
}
