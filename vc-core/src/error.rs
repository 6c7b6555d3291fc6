//! Error types re-exported from vc-error

pub use vc_error::{Result, VortecError};
