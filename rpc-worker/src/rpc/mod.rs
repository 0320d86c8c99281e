//! Request/reply correlation over the broker.
//!
//! A [`Producer`] registers a correlation id in the [`CorrelationRegistry`],
//! publishes the call and waits. The consumer loop later hands the matching
//! reply to the registry, which wakes exactly that caller.

pub mod producer;
pub mod registry;

pub use producer::Producer;
pub use registry::CorrelationRegistry;
