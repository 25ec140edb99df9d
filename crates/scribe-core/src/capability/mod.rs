//! Abstract capabilities the pipeline consumes, plus local adapters.
//!
//! ```text
//! Coordinator
//!     |
//!     |-- &dyn Generator --generate(request)--> String
//!     |                  --stream(request)----> Stream<Result<chunk>>
//!     |
//!     `-- &dyn Retriever --retrieve(query, limit)--> Vec<Passage> (best first)
//! ```
//!
//! The pipeline never implements generation or retrieval itself. The
//! adapters here exist so the binary can run against a local command and
//! a directory of reference notes.

pub mod command;
pub mod retrieval;
pub mod trait_def;

pub use command::{CommandGenerator, OutputFormat};
pub use retrieval::{KeywordRetriever, NoRetrieval};
pub use trait_def::{ChunkStream, GenerationRequest, Generator, Passage, Retriever};
