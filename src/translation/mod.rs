/*!
 * Batch translation of stored sentences.
 *
 * This module contains the translation pipeline, split into several
 * submodules:
 *
 * - `scheduler`: Packing sentences into bounded batches
 * - `codec`: Prompt encoding, response decoding and structural validation
 * - `context`: Optional per-paragraph reference text
 * - `client`: One bounded call against a text provider
 * - `ledger`: Sentences already confirmed written during the run
 * - `orchestrator`: Worker pool, retry loop and per-book deadline
 */

// Re-export main types for easier usage
pub use self::client::{CallFailure, CallResponse, TranslationClient};
pub use self::codec::{DecodeError, LineElement, ParagraphContext, StructuralMismatch};
pub use self::context::{ContextSource, NoContext, SqliteContextSource};
pub use self::orchestrator::{
    AttemptOutcome, BatchDisposition, BatchReport, BookJob, BookOrchestrator, BookReport, DroppedBatch,
};
pub use self::scheduler::{Batch, BatchLine, ChunkScheduler};

// Submodules
pub mod client;
pub mod codec;
pub mod context;
pub mod ledger;
pub mod orchestrator;
pub mod scheduler;
