//! # Cell Model
//!
//! Host-side cell state for the GPU cell simulator: the attribute layout shared
//! with the compute kernels, the host mirror, and the snapshot formats.

pub mod cell;
pub mod constants;
pub mod error;
pub mod export;

pub use cell::*;
pub use constants::*;
pub use error::*;
pub use export::*;
