/*!
 * Sentence store access.
 *
 * - `selector` reads untranslated sentences once at the start of a run
 * - `writer` is the only component that mutates the store
 * - `schema` verifies the layout and configures connections
 */

pub mod models;
pub mod schema;
pub mod selector;
pub mod writer;

// Re-export main types
pub use models::{LineRef, Sentence, TranslatedLine};
pub use selector::{SentenceStore, SentencesByBook};
pub use writer::{PendingWrite, PersistenceWriter, WriterHandle, WriterOptions, WriterStats};
