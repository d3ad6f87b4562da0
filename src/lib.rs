pub mod app;
pub mod config;
pub mod domain;
pub mod download;
pub mod error;
pub mod index;
pub mod lookup;
pub mod matcher;
pub mod output;
pub mod resolver;
pub mod scanner;
pub mod scirex;
pub mod store;
