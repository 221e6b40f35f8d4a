pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod indicators;
pub mod scorer;
pub mod stats;
pub mod types;
