use std::io;

use thiserror::Error;

/// Errors returned by the context and scatter-gather pools.
///
/// Pool exhaustion is not an error: `get_free_context` returns `None` and the
/// caller backs off. Deferred release is reported through
/// [`Release::Retiring`](crate::Release::Retiring).
#[derive(Debug, Error)]
pub enum Error {
    /// The context arena cannot supply the requested number of contexts.
    #[error("context arena exhausted: requested {requested}, available {available}")]
    OutOfCapacity { requested: usize, available: usize },
    /// Fragment description inconsistent with the declared packet.
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    /// Configuration value out of range.
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    /// DMA memory mapping failed.
    #[error("DMA mapping: {0}")]
    Dma(#[from] io::Error),
    /// The DMA cursor has too little memory left.
    #[error("DMA region exhausted: requested {requested} bytes, {remaining} remaining")]
    DmaExhausted { requested: usize, remaining: usize },
}
