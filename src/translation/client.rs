/*!
 * Translation client.
 *
 * Performs one bounded call: draws a credential, streams the response to
 * completion within the timeout and classifies the failure if there is one.
 */

use futures::StreamExt;
use log::{debug, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::credentials::{Credential, CredentialPool};
use crate::errors::ProviderError;
use crate::providers::TextProvider;

/// Text of a completed call
#[derive(Debug, Clone)]
pub struct CallResponse {
    pub text: String,
    pub credential: Credential,
    pub elapsed: Duration,
}

/// Why a call produced no response text
#[derive(Debug, Clone)]
pub enum CallFailure {
    /// The whole call did not finish within the timeout
    TimedOut(Duration),
    /// The service reported the credential's quota as used up
    QuotaExhausted(Credential),
    /// Any other transport or service failure
    Network(String),
    /// No credential left to draw
    PoolExhausted,
}

/// Issues bounded calls against a text provider using the shared pool
#[derive(Debug, Clone)]
pub struct TranslationClient {
    provider: Arc<dyn TextProvider>,
    pool: Arc<CredentialPool>,
}

impl TranslationClient {
    pub fn new(provider: Arc<dyn TextProvider>, pool: Arc<CredentialPool>) -> Self {
        Self { provider, pool }
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    /// Send `prompt` and accumulate the streamed fragments
    ///
    /// The timeout covers the whole exchange, stream included.
    pub async fn call(&self, prompt: &str, timeout: Duration) -> Result<CallResponse, CallFailure> {
        let credential = self.pool.draw().map_err(|_| CallFailure::PoolExhausted)?;
        let started = Instant::now();

        let exchange = async {
            let mut stream = self.provider.stream(&credential, prompt).await?;
            let mut text = String::new();
            let mut fragments = 0usize;
            while let Some(fragment) = stream.next().await {
                text.push_str(&fragment?);
                fragments += 1;
            }
            debug!("Received {} fragment(s) from {}", fragments, self.provider.name());
            Ok::<_, ProviderError>(text)
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(text)) => Ok(CallResponse {
                text,
                credential,
                elapsed: started.elapsed(),
            }),
            Ok(Err(e)) if e.is_quota_exhausted() => {
                warn!("Credential {} reported quota exhaustion: {}", credential.redacted(), e);
                Err(CallFailure::QuotaExhausted(credential))
            }
            Ok(Err(e)) => Err(CallFailure::Network(e.to_string())),
            Err(_) => Err(CallFailure::TimedOut(timeout)),
        }
    }
}
