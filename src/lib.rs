/*!
 * # corpus-translator - bulk sentence translation with an LLM backend
 *
 * A Rust library for translating every untranslated sentence of a SQLite
 * sentence store, book by book.
 *
 * ## Features
 *
 * - Greedy packing of consecutive sentences into bounded batches
 * - One streamed generation call per batch, bounded by a timeout
 * - Strict structural validation: a response is only accepted when its
 *   element ids are exactly the batch's ids
 * - Retries with a shrinking credential pool (quota-exhausted keys are removed)
 * - A bounded worker pool per book and a per-book deadline
 * - All store writes serialized through a single writer thread
 *
 * ## Architecture
 *
 * The library is organized in these main modules:
 * - `app_config`: Configuration management
 * - `credentials`: Shared credential pool
 * - `database`: Sentence selection, store layout and the persistence writer
 * - `translation`: The batch pipeline:
 *   - `translation::scheduler`: Batch packing
 *   - `translation::codec`: Prompt encoding and response validation
 *   - `translation::client`: Bounded calls with failure classification
 *   - `translation::orchestrator`: Worker pool, retries and deadlines
 * - `providers`: Text generation backends (Gemini, mock)
 * - `diagnostics`: Drop report and raw response capture
 * - `app_controller`: Main application controller
 * - `errors`: Custom error types for the application
 */

// Global lints configuration
// These lints will be allowed but not auto-fixed
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::redundant_closure_for_method_calls)]

// Public modules
pub mod app_config;
pub mod app_controller;
pub mod credentials;
pub mod database;
pub mod diagnostics;
pub mod errors;
pub mod providers;
pub mod translation;

// Re-export main types for easier usage
pub use app_config::Config;
pub use app_controller::{Controller, RunOutcome, RunServices, RunSummary};
pub use credentials::{Credential, CredentialPool};
pub use errors::{AppError, ProviderError, RunError, StoreError};
