//! Core domain types and shared logic for the courier file sharing service.
//!
//! This crate defines the data model used across all other crates:
//! - Upload session identifiers and declared parameters
//! - Wire request/response types for the upload and retrieval API
//! - Share code generation
//! - Configuration

pub mod code;
pub mod config;
pub mod error;
pub mod upload;

pub use code::{CODE_ALPHABET, DEFAULT_CODE_LENGTH, ShareCode, random_code};
pub use error::{Error, Result};
pub use upload::{SessionParams, UploadId};

/// Uploads smaller than this are never compressed: 10 KiB.
pub const COMPRESSION_THRESHOLD: u64 = 10 * 1024;

/// Default maximum size of a single chunk: 16 MiB.
pub const DEFAULT_MAX_CHUNK_SIZE: u64 = 16 * 1024 * 1024;

/// Default maximum size of a complete file: 2 GiB.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// Default upper bound on the number of chunks one session may declare.
pub const DEFAULT_MAX_CHUNKS_PER_UPLOAD: u32 = 100_000;
