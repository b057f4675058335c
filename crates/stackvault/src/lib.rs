//! Chain-based snapshot backup and restore for a docker-compose application
//! stack: a PostgreSQL dump, tracked data directories and the stack's
//! configuration, pushed to an rclone remote (or a local directory).

pub mod archiver;
pub mod catalog;
pub mod config;
pub mod database;
pub mod error;
pub mod exec;
pub mod fsutil;
pub mod manifest;
pub mod remote;
pub mod restore;
pub mod retention;
pub mod retry;
pub mod stack;
pub mod staging;
pub mod verify;
pub mod writer;

pub use error::{Error, ErrorKind, Result};
