pub mod cli;
pub mod context;
pub mod crypto;
pub mod error;
pub mod node;
pub mod settings;
pub mod transport;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
