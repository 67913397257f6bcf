//! Generation orchestration core: turns a slow, cancellable, externally
//! provided generate operation into a rate-limited, lock-protected action on
//! shared editing state.

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod lock;
pub mod middleware;
pub mod processing;
pub mod provider;
pub mod quick_actions;
pub mod store;
