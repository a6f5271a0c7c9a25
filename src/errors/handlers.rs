use std::future::Future;
use std::time::Duration;

use tracing::{error, info, warn};

use super::CollectionError;

/// Retries retryable collection failures a bounded number of times.
#[derive(Debug, Clone)]
pub struct RetryHandler {
    max_retries: u32,
    backoff: Duration,
}

impl RetryHandler {
    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    pub async fn handle<T, F, Fut>(&self, mut operation: F) -> Result<T, CollectionError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CollectionError>>,
    {
        let mut retries = 0;
        loop {
            match operation().await {
                Ok(result) => {
                    if retries > 0 {
                        info!(retries, "Operation succeeded after retries");
                    }
                    return Ok(result);
                }
                Err(e) if e.is_retryable() && retries < self.max_retries => {
                    retries += 1;
                    warn!(
                        error = %e,
                        retry_count = retries,
                        max_retries = self.max_retries,
                        "Operation failed, retrying"
                    );
                    tokio::time::sleep(self.backoff * retries).await;
                }
                Err(e) => {
                    if e.is_retryable() {
                        error!(error = %e, "Maximum retries reached, operation failed");
                    }
                    return Err(e);
                }
            }
        }
    }
}
