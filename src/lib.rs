//! Stockpile: watches for media files and builds B-roll projects from them.

pub mod admission;
pub mod app;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod watcher;
