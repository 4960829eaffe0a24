//! Compensating-action transactions.
//!
//! Operations run strictly in order. Each attempt is bounded by a timeout.
//! A failed critical operation rolls back every completed operation in
//! reverse order; a failed non-critical operation is recorded and execution
//! continues. There is no prepare phase: the store offers no multi-statement
//! transaction, so compensation is the only undo available.
//!
//! Forward actions return a JSON value (typically the id they created). The
//! manager keeps those values in a side table keyed by operation id and hands
//! each rollback the value its own forward action produced.

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use uuid::Uuid;

use crate::{
    config::EngineConfig,
    error::{AppError, AppResult, ErrorSummary},
};

pub type OperationFuture<T> = Pin<Box<dyn Future<Output = AppResult<T>> + Send>>;
type ActionFn = Box<dyn Fn() -> OperationFuture<Value> + Send + Sync>;
type RollbackFn = Box<dyn Fn(Value) -> OperationFuture<()> + Send + Sync>;
pub type ProgressFn = Arc<dyn Fn(TransactionProgress) + Send + Sync>;

/// One step of a transaction
pub struct Operation {
    pub id: String,
    pub retryable: bool,
    pub critical: bool,
    action: ActionFn,
    rollback: Option<RollbackFn>,
}

impl Operation {
    pub fn new<F, Fut>(id: impl Into<String>, action: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AppResult<Value>> + Send + 'static,
    {
        Self {
            id: id.into(),
            retryable: false,
            critical: false,
            action: Box::new(move || Box::pin(action())),
            rollback: None,
        }
    }

    /// Compensating action; receives the forward action's output
    pub fn with_rollback<G, Fut>(mut self, rollback: G) -> Self
    where
        G: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AppResult<()>> + Send + 'static,
    {
        self.rollback = Some(Box::new(move |output| Box::pin(rollback(output))));
        self
    }

    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id)
            .field("retryable", &self.retryable)
            .field("critical", &self.critical)
            .field("has_rollback", &self.rollback.is_some())
            .finish()
    }
}

#[derive(Clone)]
pub struct TransactionOptions {
    pub timeout: Duration,
    pub retries: u32,
    /// The delay after failed attempt `n` is `backoff_base * 2^n`
    pub backoff_base: Duration,
    pub on_progress: Option<ProgressFn>,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl TransactionOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            timeout: config.operation_timeout(),
            retries: config.retries,
            backoff_base: config.backoff_base(),
            on_progress: None,
        }
    }

    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(TransactionProgress) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(callback));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionProgress {
    pub transaction_id: String,
    pub operation_id: String,
    pub completed: usize,
    pub total: usize,
}

/// `Pending -> Running -> {Committed | RolledBack | PartiallyFailed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Pending,
    Running,
    Committed,
    RolledBack,
    PartiallyFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Succeeded,
    Failed,
    /// Succeeded, then compensated after a later critical failure
    RolledBack,
    /// Succeeded, but its compensation failed
    RollbackFailed,
    /// Never ran because the transaction aborted first
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationOutcome {
    pub operation_id: String,
    pub status: OperationStatus,
    pub attempts: u32,
    pub backoff_delays: Vec<Duration>,
    pub error: Option<ErrorSummary>,
}

impl OperationOutcome {
    fn skipped(operation_id: &str) -> Self {
        Self {
            operation_id: operation_id.to_string(),
            status: OperationStatus::Skipped,
            attempts: 0,
            backoff_delays: Vec::new(),
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RollbackFailure {
    pub operation_id: String,
    pub error: ErrorSummary,
}

#[derive(Debug)]
pub struct TransactionResult {
    pub transaction_id: String,
    pub state: TransactionState,
    pub success: bool,
    /// One outcome per submitted operation, in submission order
    pub operations: Vec<OperationOutcome>,
    /// Critical operation whose failure aborted the transaction
    pub failed_operation: Option<String>,
    /// False when any compensating action itself failed
    pub rollback_successful: bool,
    pub rollback_failures: Vec<RollbackFailure>,
    /// Forward outputs keyed by operation id
    pub outputs: IndexMap<String, Value>,
    /// Error of the critical failure
    pub cause: Option<AppError>,
}

impl TransactionResult {
    pub fn output(&self, operation_id: &str) -> Option<&Value> {
        self.outputs.get(operation_id)
    }

    pub fn outcome(&self, operation_id: &str) -> Option<&OperationOutcome> {
        self.operations.iter().find(|o| o.operation_id == operation_id)
    }

    /// Collapse into a `Result`: a clean rollback returns the original cause,
    /// a failed rollback returns `AppError::Rollback`.
    pub fn into_result(self) -> AppResult<IndexMap<String, Value>> {
        match self.state {
            TransactionState::Committed | TransactionState::PartiallyFailed => Ok(self.outputs),
            _ if !self.rollback_successful => {
                let failed: Vec<_> = self
                    .rollback_failures
                    .iter()
                    .map(|f| format!("{} ({})", f.operation_id, f.error.message))
                    .collect();
                Err(AppError::Rollback(format!(
                    "operation {} failed: {}; compensation failed for {}; manual intervention required",
                    self.failed_operation.as_deref().unwrap_or("?"),
                    self.cause.map(|e| e.to_string()).unwrap_or_default(),
                    failed.join(", ")
                )))
            }
            _ => Err(self.cause.unwrap_or_else(|| {
                AppError::Internal(format!("transaction {} aborted", self.transaction_id))
            })),
        }
    }
}

#[derive(Clone)]
pub struct TransactionManager {
    defaults: TransactionOptions,
}

impl TransactionManager {
    pub fn new(defaults: TransactionOptions) -> Self {
        Self { defaults }
    }

    pub fn defaults(&self) -> &TransactionOptions {
        &self.defaults
    }

    pub async fn execute(&self, operations: Vec<Operation>) -> TransactionResult {
        self.execute_with(operations, self.defaults.clone()).await
    }

    pub async fn execute_with(
        &self,
        operations: Vec<Operation>,
        options: TransactionOptions,
    ) -> TransactionResult {
        let transaction_id = Uuid::new_v4().to_string();
        let total = operations.len();
        tracing::debug!(
            "Transaction {} {:?} -> {:?} with {} operations",
            transaction_id,
            TransactionState::Pending,
            TransactionState::Running,
            total
        );

        let mut outcomes: Vec<OperationOutcome> = Vec::with_capacity(total);
        let mut outputs: IndexMap<String, Value> = IndexMap::new();
        let mut completed: Vec<usize> = Vec::new();
        let mut any_failed = false;
        let mut abort: Option<(usize, AppError)> = None;

        for (index, operation) in operations.iter().enumerate() {
            let (result, attempts, backoff_delays) = run_with_retry(operation, &options).await;
            match result {
                Ok(output) => {
                    outputs.insert(operation.id.clone(), output);
                    completed.push(index);
                    outcomes.push(OperationOutcome {
                        operation_id: operation.id.clone(),
                        status: OperationStatus::Succeeded,
                        attempts,
                        backoff_delays,
                        error: None,
                    });
                    if let Some(ref progress) = options.on_progress {
                        progress(TransactionProgress {
                            transaction_id: transaction_id.clone(),
                            operation_id: operation.id.clone(),
                            completed: completed.len(),
                            total,
                        });
                    }
                }
                Err(e) => {
                    outcomes.push(OperationOutcome {
                        operation_id: operation.id.clone(),
                        status: OperationStatus::Failed,
                        attempts,
                        backoff_delays,
                        error: Some(e.summary()),
                    });
                    if operation.critical {
                        tracing::warn!(
                            "Transaction {}: critical operation {} failed: {}",
                            transaction_id,
                            operation.id,
                            e
                        );
                        abort = Some((index, e));
                        break;
                    }
                    tracing::warn!(
                        "Transaction {}: operation {} failed, continuing: {}",
                        transaction_id,
                        operation.id,
                        e
                    );
                    any_failed = true;
                }
            }
        }

        let mut rollback_failures = Vec::new();
        let mut failed_operation = None;
        let mut cause = None;
        let state;

        if let Some((failed_index, error)) = abort {
            for operation in &operations[failed_index + 1..] {
                outcomes.push(OperationOutcome::skipped(&operation.id));
            }

            for &index in completed.iter().rev() {
                let operation = &operations[index];
                let rollback = match operation.rollback {
                    Some(ref rollback) => rollback,
                    None => continue,
                };
                let output = outputs.get(&operation.id).cloned().unwrap_or(Value::Null);
                let result = match tokio::time::timeout(options.timeout, rollback(output)).await {
                    Ok(result) => result,
                    Err(_) => Err(AppError::Timeout(options.timeout.as_millis() as u64)),
                };
                match result {
                    Ok(()) => {
                        outcomes[index].status = OperationStatus::RolledBack;
                        tracing::info!("Transaction {}: rolled back {}", transaction_id, operation.id);
                    }
                    Err(e) => {
                        outcomes[index].status = OperationStatus::RollbackFailed;
                        tracing::error!(
                            "Transaction {}: rollback of {} failed: {}",
                            transaction_id,
                            operation.id,
                            e
                        );
                        rollback_failures.push(RollbackFailure {
                            operation_id: operation.id.clone(),
                            error: e.summary(),
                        });
                    }
                }
            }

            failed_operation = Some(operations[failed_index].id.clone());
            cause = Some(error);
            state = TransactionState::RolledBack;
        } else if any_failed {
            state = TransactionState::PartiallyFailed;
        } else {
            state = TransactionState::Committed;
        }

        tracing::info!("Transaction {} finished: {:?}", transaction_id, state);

        TransactionResult {
            transaction_id,
            state,
            success: state == TransactionState::Committed,
            operations: outcomes,
            failed_operation,
            rollback_successful: rollback_failures.is_empty(),
            rollback_failures,
            outputs,
            cause,
        }
    }
}

/// Run an operation, retrying persistence-class failures of retryable
/// operations with exponential backoff. Critical operations get one attempt.
async fn run_with_retry(
    operation: &Operation,
    options: &TransactionOptions,
) -> (AppResult<Value>, u32, Vec<Duration>) {
    let mut attempts = 0u32;
    let mut delays = Vec::new();

    loop {
        attempts += 1;
        let result = match tokio::time::timeout(options.timeout, (operation.action)()).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Timeout(options.timeout.as_millis() as u64)),
        };

        match result {
            Ok(output) => return (Ok(output), attempts, delays),
            Err(e)
                if operation.retryable
                    && !operation.critical
                    && e.is_retryable()
                    && attempts <= options.retries =>
            {
                let delay = options.backoff_base * 2u32.saturating_pow(attempts);
                tracing::warn!(
                    "Operation {} attempt {} failed ({}), retrying in {:?}",
                    operation.id,
                    attempts,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                delays.push(delay);
            }
            Err(e) => return (Err(e), attempts, delays),
        }
    }
}

// ---------------------------------------------------------------------------
// Queue mode
// ---------------------------------------------------------------------------

struct QueuedOperation {
    operation: Operation,
    respond: oneshot::Sender<OperationOutcome>,
}

/// Batches independently submitted operations into background transactions
#[derive(Clone)]
pub struct TransactionQueue {
    sender: mpsc::Sender<QueuedOperation>,
}

/// Pending result of a queued operation
pub struct QueuedHandle {
    receiver: oneshot::Receiver<OperationOutcome>,
}

impl QueuedHandle {
    pub async fn outcome(self) -> AppResult<OperationOutcome> {
        self.receiver
            .await
            .map_err(|_| AppError::Internal("transaction queue worker stopped".to_string()))
    }
}

impl TransactionQueue {
    /// Start the queue and its background worker
    pub fn spawn(manager: TransactionManager, batch_size: usize, flush_interval: Duration) -> Self {
        let (sender, receiver) = mpsc::channel(1024);
        tokio::spawn(run_queue_worker(
            manager,
            receiver,
            batch_size.max(1),
            flush_interval,
        ));
        Self { sender }
    }

    pub async fn queue_operation(&self, operation: Operation) -> AppResult<QueuedHandle> {
        let (respond, receiver) = oneshot::channel();
        self.sender
            .send(QueuedOperation { operation, respond })
            .await
            .map_err(|_| AppError::Internal("transaction queue worker stopped".to_string()))?;
        Ok(QueuedHandle { receiver })
    }
}

/// Worker loop:
/// 1. Block until the first operation arrives.
/// 2. Keep collecting until the batch is full or the flush interval elapses.
/// 3. Execute the batch as one transaction and answer every submitter.
async fn run_queue_worker(
    manager: TransactionManager,
    mut receiver: mpsc::Receiver<QueuedOperation>,
    batch_size: usize,
    flush_interval: Duration,
) {
    while let Some(first) = receiver.recv().await {
        let mut batch = vec![first];
        let deadline = Instant::now() + flush_interval;

        while batch.len() < batch_size {
            match tokio::time::timeout_at(deadline, receiver.recv()).await {
                Ok(Some(queued)) => batch.push(queued),
                Ok(None) | Err(_) => break,
            }
        }

        tracing::debug!("Executing queued batch of {} operations", batch.len());
        let (operations, responders): (Vec<_>, Vec<_>) = batch
            .into_iter()
            .map(|queued| (queued.operation, queued.respond))
            .unzip();

        let result = manager.execute(operations).await;
        for (outcome, respond) in result.operations.into_iter().zip(responders) {
            let _ = respond.send(outcome);
        }
    }
}
