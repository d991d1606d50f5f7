//! Library target for the `hikfetch` package.
//!
//! The deliverable is the `hikfetch` binary (`src/main.rs`); its argument
//! parsing, config loading, logging and report output live here so they can
//! be unit tested and doc tested.

pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod output;
pub mod utils;

#[doc(hidden)]
pub use hikfetch_engine;
