//! Host-surfaced errors.
//!
//! Pool exhaustion (`OutOfPairs` / `OutOfSlabs` in protocol terms) is *not*
//! an error here: it is reported per element — the affected lane finishes
//! its protocol loop with a not-inserted outcome and the rest of the batch
//! is unaffected. The facade logs a warning when a batch hits it.

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Construction-time misconfiguration (zero sizes, handle-space
    /// overflow).
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// A bulk operation was handed arrays of different lengths.
    #[error("batch length mismatch: {keys} keys vs {outputs} outputs")]
    LengthMismatch { keys: usize, outputs: usize },

    /// Surface-level failure from the device runtime (allocation, launch,
    /// sync).
    #[cfg(feature = "cuda")]
    #[error("device error: {0}")]
    Device(#[from] cust::error::CudaError),
}
