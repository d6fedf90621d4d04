pub mod config;
pub mod error;
pub mod feed;
pub mod layout;
pub mod models;
pub mod parser;
pub mod photos;
pub mod schema;
pub mod service;
pub mod stale;
pub mod storage;
pub mod sync;

pub use error::{Result, SyncError};
