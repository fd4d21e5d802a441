use std::future::Future;
use std::time::Duration;

/// Retries the async operation built by `f` after `interval` has elapsed,
/// until `max_attempts` is reached. Returns the first successful result or
/// the latest error when all attempts fail.
pub async fn retry_async<F, Fut, T, E>(
    max_attempts: usize,
    interval: Duration,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut last_err = None;
    for attempt in 1..=max_attempts {
        match f().await {
            Ok(result) => return Ok(result),
            Err(err) => {
                last_err = Some(err);
                if attempt < max_attempts {
                    tokio::time::sleep(interval).await;
                }
            }
        }
    }
    Err(last_err.expect("some error must exist at this point"))
}
