//! Bound on concurrent whole-file crypto jobs.

use crate::error::{ApiError, ApiResult};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Semaphore sized to the CPU count; each whole-file encrypt or decrypt holds one permit.
#[derive(Clone)]
pub struct CryptoPermits {
    semaphore: Arc<Semaphore>,
}

impl CryptoPermits {
    pub fn new(permits: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(permits.max(1))),
        }
    }

    pub fn from_cpus() -> Self {
        Self::new(num_cpus::get())
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Run blocking `job` on the blocking pool while holding a permit.
    pub async fn run<F, T>(&self, job: F) -> ApiResult<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| ApiError::Internal("crypto permits closed".to_string()))?;
        Ok(tokio::task::spawn_blocking(job).await?)
    }
}

impl Default for CryptoPermits {
    fn default() -> Self {
        Self::from_cpus()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn jobs_never_exceed_permits() {
        let permits = CryptoPermits::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let permits = permits.clone();
            let running = running.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                permits
                    .run(move || {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(30));
                        running.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(permits.available(), 2);
    }
}
