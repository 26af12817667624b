//! Guest logging.
//!
//! Contracts log through the `env::log` import. Lines are emitted through
//! `tracing` tagged with the contract and the context handle of the call
//! that produced them; nothing is kept in the instance.

use contract_runtime_core::InstanceState;
use tracing::{debug, error, info, warn};

/// Severity of a guest log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestLogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Emit one guest log line.
pub fn log(state: &InstanceState, level: GuestLogLevel, message: &str) {
    let contract = &state.contract;
    let ctx_ptr = state.context_ptr;
    match level {
        GuestLogLevel::Debug => debug!(%contract, ctx_ptr, guest_log = true, "{}", message),
        GuestLogLevel::Info => info!(%contract, ctx_ptr, guest_log = true, "{}", message),
        GuestLogLevel::Warn => warn!(%contract, ctx_ptr, guest_log = true, "{}", message),
        GuestLogLevel::Error => error!(%contract, ctx_ptr, guest_log = true, "{}", message),
    }
}

/// Convert a numeric log level (0=debug, 1=info, 2=warn, 3=error).
///
/// Unknown values map to [`GuestLogLevel::Info`].
pub fn level_from_i32(level: i32) -> GuestLogLevel {
    match level {
        0 => GuestLogLevel::Debug,
        2 => GuestLogLevel::Warn,
        3 => GuestLogLevel::Error,
        _ => GuestLogLevel::Info,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contract_runtime_common::ContractId;

    #[test]
    fn test_level_from_i32() {
        assert_eq!(level_from_i32(0), GuestLogLevel::Debug);
        assert_eq!(level_from_i32(1), GuestLogLevel::Info);
        assert_eq!(level_from_i32(2), GuestLogLevel::Warn);
        assert_eq!(level_from_i32(3), GuestLogLevel::Error);
        assert_eq!(level_from_i32(99), GuestLogLevel::Info);
        assert_eq!(level_from_i32(-1), GuestLogLevel::Info);
    }

    #[test]
    fn test_log_leaves_state_untouched() {
        let mut state = InstanceState::new(ContractId::new("counter", "1.0.0"), 1024);
        state.begin_call(3);

        log(&state, GuestLogLevel::Warn, "balance low");

        assert_eq!(state.context_ptr, 3);
        assert!(state.output().is_none());
    }
}
