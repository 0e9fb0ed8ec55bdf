//! Docflow Worker Library
//!
//! The upload queue: a fixed pool of workers pulling file tasks from a FIFO,
//! streaming them to storage, recording them and handing them to the
//! processing dispatcher.

pub mod context;
mod pipeline;
pub mod queue;

pub use context::DispatchContext;
pub use queue::UploadQueue;
