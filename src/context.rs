use crate::config::AppConfig;
use crate::core::retry::{RetryBudget, RetryPolicy};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

/// Everything a migration run needs besides the storage clients and the
/// progress store, passed explicitly instead of living in globals.
#[derive(Clone)]
pub struct MigrationContext {
    pub run_id: Uuid,
    pub config: Arc<AppConfig>,
    pub policy: RetryPolicy,
    pub budget: Arc<RetryBudget>,
    /// Cancelled on operator interrupt; checked before each file starts.
    pub cancel: CancellationToken,
}

impl MigrationContext {
    pub fn new(config: AppConfig) -> Self {
        let policy = config.retry_policy();
        let budget = Arc::new(RetryBudget::new(config.retry_budget));
        Self {
            run_id: Uuid::now_v7(),
            config: Arc::new(config),
            policy,
            budget,
            cancel: CancellationToken::new(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Turn operator interrupts into cancellation.
///
/// The first interrupt cancels `token` so the run stops after the current
/// file. Returns `true` once a second interrupt arrives, at which point the
/// caller should exit immediately. Returns `false` if the signal source fails.
pub async fn watch_interrupts<F, Fut>(token: CancellationToken, mut next_interrupt: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
{
    if let Err(e) = next_interrupt().await {
        warn!(error = %e, "Cannot listen for interrupts");
        return false;
    }
    warn!("Interrupt received, finishing the current file before stopping (interrupt again to force quit)");
    token.cancel();

    match next_interrupt().await {
        Ok(()) => {
            warn!("Second interrupt received, exiting immediately");
            true
        }
        Err(e) => {
            warn!(error = %e, "Cannot listen for interrupts");
            false
        }
    }
}
