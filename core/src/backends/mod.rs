//! Concrete backend profiles.
//!
//! A backend is data plus a handful of parsing decisions, captured behind
//! [`crate::backend::BackendStrategy`]. `maxima` is the full-featured
//! adapter; `generic` is a regex-configured profile for simple line-oriented
//! interpreters and for driving scripted fake backends in tests.

mod generic;
mod maxima;

pub use generic::GenericStrategy;
pub use maxima::MaximaStrategy;
