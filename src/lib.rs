#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions
)]

pub mod client;
pub mod config;
pub mod connection;
pub mod credentials;
pub mod error;
pub mod queue;
pub mod refcount;
pub mod session;
pub mod utils;
pub mod watcher;
