//! Outline planning.
//!
//! ```text
//! (prompt, template) --build_planning_prompt--> Generator::generate
//!        |                                             |
//!        |                                      parse_outline
//!        |                                             |
//!        |                                  QualityGate::assess
//!        |                                   /               \
//!        |                          no issues                 issues
//!        |                              |                        |
//!        |                   Accepted(Outline)       retry once, then Fallback
//! ```

pub mod parser;
pub mod planner;
pub mod quality;
pub mod templates;

pub use parser::{OutlineParseError, parse_outline};
pub use planner::{MAX_PLAN_ATTEMPTS, OutlinePlanner, PlanOutcome, PlannerConfig};
pub use quality::{QualityGate, QualityIssue};
