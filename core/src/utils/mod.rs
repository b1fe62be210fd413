//! Utility modules for KeyRecorder.
//!
//! # Modules
//!
//! - [`debounce`]: Quiet-period buffer that batches records before they hit disk

pub mod debounce;

pub use debounce::{Debouncer, DEFAULT_DEBOUNCE_MS};
