//! Marquee — task scheduling and execution engine for a personal media
//! library server.

pub mod config;
pub mod error;
pub mod handlers;
pub mod store;
pub mod tasks;
