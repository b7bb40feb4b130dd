use thiserror::Error;

/// Errors surfaced to clients of the driver.
///
/// Hardware timeouts and FIFO faults are deliberately absent: bounded polls
/// that expire and FIFO overrun/underrun conditions are logged and execution
/// continues, they never fail an operation.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SsiError {
    /// The requested stream is already held by another client.
    #[error("stream already held")]
    Busy,
    /// The requested sample rate conflicts with the rate locked in by the
    /// active opposite direction.
    #[error("sample rate conflicts with active direction")]
    RateConflict,
    /// DMA-safe memory or descriptor allocation failed.
    #[error("dma-safe memory exhausted")]
    NoMemory,
    /// A configuration value is out of range or unparseable.
    #[error("invalid parameter")]
    InvalidParameter,
    /// The DMA service rejected an operation.
    #[error("dma service failure")]
    Dma,
    /// The request has no implementation on this device.
    #[error("operation not supported")]
    Unsupported,
}
