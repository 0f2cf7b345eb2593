use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::query::masking;
use crate::query::validator::{QueryValidator, ValidationError};

/// Failures from the external database executor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error("query execution timed out")]
    Timeout,
    #[error("database execution failed: {0}")]
    ConnectionFailure(String),
}

/// Anything that can stop a validated query from producing a masked result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

/// External collaborator that actually runs the query against the database.
#[async_trait]
pub trait DatabaseExecutor: Send + Sync {
    async fn execute(&self, query: &str, limit: u32) -> Result<Value, ExecutionError>;
}

/// Placeholder executor for deployments where no database driver has been
/// wired in; every query reports a connection failure.
pub struct NullExecutor;

#[async_trait]
impl DatabaseExecutor for NullExecutor {
    async fn execute(&self, _query: &str, _limit: u32) -> Result<Value, ExecutionError> {
        Err(ExecutionError::ConnectionFailure(
            "no database executor configured".to_string(),
        ))
    }
}

/// Sequences validation, bounded execution and masking for any tool
/// invocation carrying a caller-supplied query.
pub struct SafetyGateway {
    validator: QueryValidator,
    execution_timeout: Duration,
}

impl SafetyGateway {
    pub fn new(validator: QueryValidator, execution_timeout: Duration) -> Self {
        Self {
            validator,
            execution_timeout,
        }
    }

    /// Validate `query`, run it through `executor` under the configured
    /// timeout, and mask the result. On validation failure the executor is
    /// never invoked; on execution failure nothing sensitive was produced and
    /// the error propagates unmasked.
    pub async fn run(
        &self,
        executor: &dyn DatabaseExecutor,
        query: &str,
        limit: u32,
    ) -> Result<Value, QueryError> {
        self.validator.validate(query)?;
        debug!(limit = limit, "query passed validation, executing");

        let result = tokio::time::timeout(self.execution_timeout, executor.execute(query, limit))
            .await
            .map_err(|_| {
                warn!(timeout_secs = self.execution_timeout.as_secs(), "query execution timed out");
                ExecutionError::Timeout
            })??;

        Ok(masking::mask(result))
    }
}
