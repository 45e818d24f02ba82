//! Core library for gadfly, a grey-box fuzzer for web applications.
//!
//! Gadfly drives an instrumented target with HTTP requests, reads the
//! per-request coverage feedback it emits, and evolves a prioritised corpus
//! of requests to maximise coverage while flagging reflected XSS along the
//! way. This crate holds the whole feedback loop; the CLI binary only parses
//! arguments, sets up logging and hands control to the [`supervisor`].
pub mod config;
pub mod corpus;
pub mod crawler;
pub mod detector;
pub mod error;
pub mod html;
pub mod instrument;
pub mod mutator;
pub mod request;
pub mod scheduler;
pub mod session;
pub mod signal;
pub mod stats;
pub mod supervisor;
pub mod worker;

pub use error::*;

/// Returns the version of the gadfly-core library.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
