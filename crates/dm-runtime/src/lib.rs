//! Session runtime for the direct-messaging core.
//!
//! [`spawn_session`] starts the actor that drives a user's messaging session
//! over the backend ports in [`dm_core::ports`]. [`InMemoryBackend`] is a
//! complete in-process implementation of those ports used by tests and the
//! smoke binary.

mod memory;
mod runtime;

pub use memory::InMemoryBackend;
pub use runtime::{SessionHandle, SessionServices, spawn_session};
