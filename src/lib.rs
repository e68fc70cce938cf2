pub mod auth;
pub mod catalog;
pub mod config;
pub mod connection;
pub mod context;
pub mod engine;
pub mod frontend;
pub mod repository;
pub mod sync;
