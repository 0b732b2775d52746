//! voxlet: worker-channel runtime for speech synthesis models.
//!
//! Owns a long-lived Python bridge subprocess hosting a slow-to-load TTS
//! model and exchanges newline-delimited JSON request/response pairs with it
//! over the worker's stdin/stdout. One [`Channel`] owns one worker; scale by
//! running more channels.

pub mod bridge;
mod channel;
mod process;

pub use channel::{
    Channel, ChannelConfig, ChannelError, GenerateRequest, DEFAULT_CALL_TIMEOUT,
    DEFAULT_INIT_TIMEOUT,
};
pub use process::{
    BridgeSpawner, CommandSpawner, ProcessError, ProcessEvent, SpawnError, WorkerProcess,
    WorkerSpawner,
};
