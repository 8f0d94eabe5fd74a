//! Data ingestion module - functional pipeline from open-data portal to object store

pub mod extract;
pub mod fetch;
pub mod manifest;
pub mod pipeline;
pub mod publish;
pub mod retry;
pub mod types;
pub mod utils;

pub use types::*;
