//! Wire bridge between the channel and the worker subprocess.
//!
//! - **codec**: newline framing over the worker's stdio
//! - **protocol**: typed request/response messages and their JSON forms

pub mod codec;
pub mod protocol;
