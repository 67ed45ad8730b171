//! Tracing attribute keys and test capture helpers.
//! Nothing is emitted unless the host installs a `tracing` subscriber.

pub mod keys;
#[cfg(test)]
pub mod test_span;

pub use keys::*;
