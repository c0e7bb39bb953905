pub mod app;
pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod event;
pub mod server;
pub mod service;
pub mod session;
pub mod timeline;
pub mod util;
