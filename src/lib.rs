// Configuration
pub mod config;

// Core types
pub mod core;

// Transaction ingestion
pub mod ingest;

// Pattern detection
pub mod strategy;

// Trade execution and accounting
pub mod trading;

// Re-export commonly used types for convenience
pub use crate::core::*;
