pub mod backend;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod fs_util;
pub mod manifest;
pub mod output;
pub mod pipeline;
pub mod sim;
pub mod snapshot;
pub mod task;
pub mod transfer;
