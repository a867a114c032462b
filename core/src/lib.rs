//! Session/expression execution engine for driving computer-algebra
//! backends as child processes.
//!
//! The engine spawns a backend, serializes a strictly-FIFO queue of
//! commands to it, incrementally parses the unframed output stream into
//! per-command boundaries using backend-specific prompt markers, and
//! exposes each command as an observable [`expression::Expression`].
//! Backend differences live behind [`backend::BackendStrategy`] profiles.

pub mod backend;
pub mod backends;
pub mod config;
pub mod error;
pub mod expression;
pub mod process;
pub mod prompt;
pub mod session;
pub mod variables;

pub use abacus_protocol as protocol;
pub use backend::BackendStrategy;
pub use config::BackendConfig;
pub use error::EngineError;
pub use error::Result;
pub use expression::Expression;
pub use session::Session;
