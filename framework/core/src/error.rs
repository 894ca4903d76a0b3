/// Failures that abort the current topology/store-variant combination.
///
/// The orchestrator recovers from these at the sweep level only. Everything that is not a
/// [StageError] is absorbed where it happens and reported as a progress frame.
#[derive(derive_more::Error, derive_more::Display, Debug)]
pub enum StageError {
    /// Topology definitions are missing or a cluster could not be created.
    #[display("provisioning failed: {reason}")]
    Provisioning { reason: String },
    #[display("store variant '{variant}' is not supported")]
    UnsupportedVariant { variant: String },
    /// The store never accepted a connection within the retry budget.
    #[display("could not connect to {variant} after {attempts} attempts: {last_error}")]
    Connection {
        variant: String,
        attempts: u32,
        last_error: String,
    },
    /// The ingestion process kept failing to launch or watch.
    #[display("ingestion failed after {attempts} attempts: {last_error}")]
    Ingestion { attempts: u32, last_error: String },
    /// Ingestion finished but the graph holds nothing to benchmark against.
    #[display("graph did not populate properly: {reason}")]
    EmptyGraph { reason: String },
}

/// Returned by waits that were interrupted by the cancellation signal.
#[derive(derive_more::Error, derive_more::Display, Debug)]
pub struct CancelledError {
    msg: String,
}

impl Default for CancelledError {
    fn default() -> Self {
        Self {
            msg: "Sweep cancelled".to_string(),
        }
    }
}
