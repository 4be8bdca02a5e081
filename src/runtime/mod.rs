//! Async handle over a shared store and its event stream.

/// Event stream types emitted by the handle.
pub mod events;
/// Handle, deferred connection and blocking-pool dispatch.
pub mod handle;
