//! swaphost Library
//!
//! Signed deploy packages, blue/green worker supervision and atomic reloads of an
//! application's serving state.

pub mod app;
pub mod appconf;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod handler;
pub mod host;
pub mod keys;
pub mod logs;
pub mod package;
pub mod reload;
pub mod schema;
pub mod server;
pub mod srvman;
pub mod storage;
pub mod utils;

/// Macro for creating trace information
#[macro_export]
macro_rules! trace {
    () => {
        format!("{}:{}", file!(), line!())
    };
}
