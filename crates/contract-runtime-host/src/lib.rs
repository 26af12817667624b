//! Host functions linked into contract instances.
//!
//! Contracts import these from module `env`:
//!
//! - [`logging`]: Guest log lines emitted through `tracing`
//! - [`linker`]: Registration of `log` and `set_output` on a Wasmtime linker
//!
//! All host functions validate guest pointers before touching memory and
//! only affect the state of the calling instance.

pub mod linker;
pub mod logging;

pub use linker::{create_linker, register_all};
pub use logging::GuestLogLevel;
