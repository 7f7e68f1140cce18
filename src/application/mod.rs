//! Application layer: the staged managers that drive the order lifecycle.

pub mod entry;
pub mod hedge;
pub mod ingestion;
pub mod lifecycle;
pub mod maintenance;
pub mod publisher;
pub mod pyramid;
pub mod watchdog;

use thiserror::Error;

use crate::domain::errors::ValidationError;
use crate::infrastructure::exchange::ExchangeError;
use crate::infrastructure::telegram::ChatError;
use crate::persistence::DatabaseError;

/// Errors a pipeline stage can surface from one tick. Each task catches,
/// logs and continues; nothing crosses task boundaries in flight.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("Chat error: {0}")]
    Chat(#[from] ChatError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
