pub mod api;
pub mod app_state;
pub mod blob;
pub mod cache;
pub mod config;
pub mod error;
pub mod grpc;
pub mod metadata;
pub mod model;
pub mod service;
