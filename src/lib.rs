pub mod config;
pub mod csi;
pub mod error;
pub mod mount;
pub mod options;
pub mod protocol;
pub mod sidecar;
pub mod token;
pub mod webhook;

pub use error::FailureKind;
