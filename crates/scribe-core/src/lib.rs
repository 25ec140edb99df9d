//! Hierarchical generation pipeline.
//!
//! Turns one prompt into a long, streamed document while keeping every
//! call to the generation capability under a fixed token ceiling:
//!
//! ```text
//! Coordinator
//!     |-- OutlinePlanner ----> Accepted(Outline) | Fallback
//!     |
//!     |   for each section, in outline order:
//!     |-- BudgetGuard::admit (trim context if rejected)
//!     |-- SectionGenerator --> Increment* -> Completed | Failed
//!     |-- SummaryRefresher --> GlobalSummary v+1 (bounded)
//!     |
//!     `-- CoherenceChecker --> CoherenceReport
//! ```

pub mod budget;
pub mod capability;
pub mod coherence;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod outline;
pub mod section;
pub mod state;
pub mod summary;
pub mod tokens;

pub use config::PipelineConfig;
pub use coordinator::{Coordinator, DocumentRequest, SessionHandle, SessionOutcome};
pub use error::PipelineError;
