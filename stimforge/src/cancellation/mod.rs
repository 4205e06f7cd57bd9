//! Cooperative cancellation for batch runs.
//!
//! A batch owns one root token; every unit runs under a child of it, so a
//! unit can be cancelled alone or together with the whole batch. Tokens are
//! only consulted between stages: a call that has already been admitted
//! always runs to completion or timeout.

mod token;

pub use token::CancellationToken;
