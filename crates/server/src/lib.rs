//! HTTP API server for courier.
//!
//! This crate provides:
//! - The upload session registry and its eviction sweep
//! - Chunk assembly with optional streaming compression
//! - Single-shot uploads
//! - Code resolution, groups and file streaming

pub mod assembler;
pub mod clock;
pub mod compression;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod registry;
pub mod retrieval;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use routes::create_router;
pub use state::AppState;
