//! Read/write operations grouped by entity.

pub mod reports;
pub mod sections;
pub mod sessions;
pub mod summaries;
