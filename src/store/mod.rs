//! Persistence contract for tracked messages and their history.
//!
//! The message row and its history are only ever written together, inside one
//! transaction, through [`StateStore::create_initial_state`] and
//! [`StateStore::record_state_change`].

use std::time::Duration;
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{CreateState, MessageSnapshot, TrackedMessage, UnixTimeMs, UpdateState};

pub mod sqlite;

pub use sqlite::SqliteStateStore;

#[async_trait::async_trait]
pub trait StateStore: Send + Sync {
    /// Insert a message with no signals and its baseline history entry.
    async fn create_initial_state(&self, create: CreateState)
        -> Result<MessageSnapshot, StoreError>;

    /// Store new signals for an existing message and append one history entry.
    async fn record_state_change(&self, update: UpdateState)
        -> Result<MessageSnapshot, StoreError>;

    async fn get_snapshot(&self, external_ref_id: Uuid)
        -> Result<Option<MessageSnapshot>, StoreError>;

    /// Messages with no transport state whose last poll is missing or older
    /// than `min_poll_age`. Never-polled first, then oldest-polled.
    async fn find_pollable(
        &self,
        now: UnixTimeMs,
        min_poll_age: Duration,
        limit: usize,
    ) -> Result<Vec<TrackedMessage>, StoreError>;

    /// Stamp `last_polled_at` on all given messages; returns rows touched.
    async fn mark_polled(&self, external_ref_ids: &[Uuid], now: UnixTimeMs)
        -> Result<usize, StoreError>;
}
