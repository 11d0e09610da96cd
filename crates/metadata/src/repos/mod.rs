//! Repository traits for metadata operations.

pub mod files;
pub mod groups;

pub use files::FileRepo;
pub use groups::GroupRepo;
