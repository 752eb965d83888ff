//! Knowledge sink: where successful step results are offered for storage.
//!
//! The engine never waits on the sink. Recording happens in a detached task
//! and a failure is only logged.

pub mod memory;
pub mod sink;

pub use memory::InMemoryKnowledgeSink;
pub use sink::{BoxKnowledgeSink, KnowledgeError, KnowledgeSink};
