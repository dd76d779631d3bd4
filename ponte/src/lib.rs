pub mod codec;
pub mod cors;
pub mod director;
pub mod framing;
pub mod observe;
mod pump;
pub mod service;

/// Boxed error used in the body bounds shared across the crate.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
