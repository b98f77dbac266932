/*!
 * Mock provider for testing.
 *
 * Replies are scripted per call and consumed in order; once the script is
 * exhausted the fallback reply is used for every further call:
 * - `MockReply::Echo` - answers every line of the request with a translation
 * - `MockReply::EchoMissing(n)` - like `Echo` but leaves out the last `n` lines
 * - `MockReply::Fail` - fails the call with the given error
 * - `MockReply::Delayed` / `MockReply::Hang` - simulate slow backends
 */

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::credentials::Credential;
use crate::errors::ProviderError;
use crate::providers::{TextProvider, TextStream};
use crate::translation::codec::{RequestPayload, ResponsePayload};

/// Prefix added to every echoed translation
pub const ECHO_PREFIX: &str = "[translated] ";

/// What the mock does for one call
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Return this text as a single fragment
    Text(String),
    /// Return these fragments in order
    Chunks(Vec<String>),
    /// Translate every line of the request
    Echo,
    /// Translate the request but leave out its last `n` lines
    EchoMissing(usize),
    /// Fail before any fragment is produced
    Fail(ProviderError),
    /// Wait, then behave like the inner reply
    Delayed(Duration, Box<MockReply>),
    /// Never answer
    Hang,
}

impl MockReply {
    pub fn delayed(delay: Duration, reply: MockReply) -> Self {
        Self::Delayed(delay, Box::new(reply))
    }

    /// Quota exhaustion as the real backend reports it
    pub fn quota_exhausted() -> Self {
        Self::Fail(ProviderError::RateLimitExceeded(
            "429 RESOURCE_EXHAUSTED: quota exceeded".to_string(),
        ))
    }
}

/// A call received by the mock
#[derive(Debug, Clone)]
pub struct MockCall {
    pub credential: Credential,
    pub prompt: String,
}

/// Mock provider for testing translation behavior
#[derive(Debug)]
pub struct MockProvider {
    script: Mutex<VecDeque<MockReply>>,
    fallback: MockReply,
    calls: Mutex<Vec<MockCall>>,
    /// Calls currently in flight
    active: AtomicUsize,
    /// Highest number of calls in flight at once
    peak: AtomicUsize,
}

/// Keeps the in-flight counter right when a call is cancelled
struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockProvider {
    /// Create a mock that plays `script` first, then `fallback`
    pub fn new(script: Vec<MockReply>, fallback: MockReply) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            calls: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// A mock that translates every request correctly
    pub fn echo() -> Self {
        Self::new(Vec::new(), MockReply::Echo)
    }

    /// A mock that plays `script` and then translates correctly
    pub fn scripted(script: Vec<MockReply>) -> Self {
        Self::new(script, MockReply::Echo)
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn next_reply(&self) -> MockReply {
        self.script.lock().pop_front().unwrap_or_else(|| self.fallback.clone())
    }

    /// Build the response the real backend would give for `prompt`,
    /// leaving out the last `missing` lines
    pub fn echo_response(prompt: &str, missing: usize) -> Result<String, ProviderError> {
        let request = RequestPayload::from_prompt(prompt)
            .ok_or_else(|| ProviderError::ParseError("prompt carries no request payload".to_string()))?;

        let mut response = ResponsePayload::from_lines(
            request
                .lines
                .into_iter()
                .map(|mut line| {
                    line.text = format!("{}{}", ECHO_PREFIX, line.text);
                    line
                })
                .collect(),
        );
        let keep = response.lines.len().saturating_sub(missing);
        response.lines.truncate(keep);

        serde_json::to_string(&response).map_err(|e| ProviderError::ParseError(e.to_string()))
    }
}

#[async_trait]
impl TextProvider for MockProvider {
    async fn stream(&self, credential: &Credential, prompt: &str) -> Result<TextStream, ProviderError> {
        self.calls.lock().push(MockCall {
            credential: credential.clone(),
            prompt: prompt.to_string(),
        });

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = ActiveGuard(&self.active);

        let mut reply = self.next_reply();
        let fragments = loop {
            match reply {
                MockReply::Delayed(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    reply = *inner;
                }
                MockReply::Text(text) => break vec![text],
                MockReply::Chunks(chunks) => break chunks,
                MockReply::Echo => break vec![Self::echo_response(prompt, 0)?],
                MockReply::EchoMissing(n) => break vec![Self::echo_response(prompt, n)?],
                MockReply::Fail(err) => return Err(err),
                MockReply::Hang => break futures::future::pending().await,
            }
        };

        Ok(futures::stream::iter(fragments.into_iter().map(Ok)).boxed())
    }

    fn name(&self) -> &str {
        "mock"
    }
}
