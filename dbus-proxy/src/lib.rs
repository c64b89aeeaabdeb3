//! Library half of the filtering D-Bus proxy: everything `main.rs` wires together,
//! exposed so integration tests under `tests/` can drive a [`proxy::Proxy`] end to end
//! without a real bus daemon (§10.6).

pub mod auth;
pub mod cli;
pub mod client;
pub mod error;
pub mod event_loop;
pub mod logging;
pub mod policy;
pub mod proxy;
pub mod rewrite;
pub mod side;
