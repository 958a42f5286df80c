pub mod chat_log;
pub mod config;
pub mod detector;
pub mod domain;
pub mod error;
pub mod grammar;
pub mod host;
pub mod runtime;
pub mod scheduler;
pub mod widgets;
pub mod writeback;
