//! Bounded exponential backoff for gateway calls.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::repo::{GatewayError, GatewayResult};

/// Retry a gateway operation on transient failures with exponential
/// backoff (base, 2×base, 4×base, ...). Permanent failures and the final
/// transient failure propagate unchanged.
pub async fn gateway_with_backoff<T, F, Fut>(
    label: &str,
    max_retries: u32,
    base_delay: Duration,
    mut op: F,
) -> GatewayResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = GatewayResult<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < max_retries => {
                let delay = base_delay * 2u32.saturating_pow(attempt);
                warn!(op = label, attempt, ?delay, error = %e, "transient gateway failure, backing off");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
