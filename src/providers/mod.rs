/*!
 * Text generation backends.
 *
 * This module contains client implementations for the services a batch can be
 * sent to:
 * - Gemini: Google generative language API, streamed over SSE
 * - Mock: scripted in-process backend used by the test suite
 */

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt::Debug;

use crate::credentials::Credential;
use crate::errors::ProviderError;

/// Ordered fragments of generated text as they arrive
pub type TextStream = BoxStream<'static, Result<String, ProviderError>>;

/// Common trait for all text generation backends
///
/// A backend only streams text; deadlines, credential choice and failure
/// classification are handled by the translation client.
#[async_trait]
pub trait TextProvider: Send + Sync + Debug {
    /// Start a generation call for `prompt` authenticated with `credential`
    ///
    /// # Returns
    /// * `Result<TextStream, ProviderError>` - The fragment stream, or the error
    ///   raised before the first fragment
    async fn stream(&self, credential: &Credential, prompt: &str) -> Result<TextStream, ProviderError>;

    /// Short backend name for logs
    fn name(&self) -> &str;
}

pub mod gemini;
pub mod mock;

pub use gemini::GeminiProvider;
pub use mock::{MockProvider, MockReply};
