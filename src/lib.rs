pub mod app;
pub mod archive;
pub mod cancel;
pub mod config;
pub mod domain;
pub mod downloads;
pub mod error;
pub mod fixes;
pub mod fixlog;
pub mod fs_util;
pub mod http;
pub mod library;
pub mod manifest;
pub mod names;
pub mod output;
pub mod roster;
pub mod status;
pub mod store;
pub mod stream;
