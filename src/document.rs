//! The atomic partitioned document store capability.
//!
//! This is the only interface boundary the protocol cares about: a backing
//! engine that can execute an atomic, partition-scoped batch of create/read
//! operations, run ordered range and count queries within a partition, and
//! point-read a single record. [`crate::store::document::DocumentEventStore`]
//! turns any implementation of this trait into a full event store.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{EventRecord, Result};

/// The persisted layout: one document per `(stream_id, sequence_number)`.
///
/// The document identity string is `"{sequence_number}@{stream_id}"`, which
/// simultaneously serves as a natural idempotency key and as the
/// concurrency-token surface of the append protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDocument {
    /// The document identity string.
    pub id: String,
    /// The record this document persists.
    #[serde(flatten)]
    pub record: EventRecord,
}

impl EventDocument {
    /// Wraps a record in its document form.
    #[must_use]
    pub fn new(record: EventRecord) -> Self {
        Self {
            id: record.document_id(),
            record,
        }
    }
}

/// One operation within a [`TransactionalBatch`].
#[derive(Debug, Clone)]
pub enum BatchOperation {
    /// Create a document. Must fail the whole batch with a conflict if a
    /// document with the same id already exists in the partition.
    Create(EventDocument),
    /// Read a document by id. Must fail the whole batch with a conflict if
    /// the document does not exist.
    Read {
        /// The document identity string to read back.
        id: String,
    },
}

/// An atomic, partition-scoped batch: all operations succeed or all fail
/// together.
#[derive(Debug, Default)]
pub struct TransactionalBatch {
    operations: Vec<BatchOperation>,
}

impl TransactionalBatch {
    /// Creates an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a create operation.
    pub fn create(&mut self, document: EventDocument) {
        self.operations.push(BatchOperation::Create(document));
    }

    /// Adds a conditional read operation.
    pub fn read(&mut self, id: impl Into<String>) {
        self.operations.push(BatchOperation::Read { id: id.into() });
    }

    /// Returns the batch's operations in order.
    #[must_use]
    pub fn operations(&self) -> &[BatchOperation] {
        &self.operations
    }

    /// Returns `true` if the batch contains no operations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// The outcome of an executed batch.
///
/// A conflict (a uniqueness or conditional-read violation) is an expected,
/// distinguishable outcome; transport failures are `Err` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Every operation succeeded and the batch committed.
    Committed,
    /// A create hit an existing id, or a conditional read found nothing;
    /// nothing was written.
    Conflict,
}

/// The sort order of a range query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    /// Ascending sequence numbers.
    Ascending,
    /// Descending sequence numbers.
    Descending,
}

/// An engine capable of backing the event store protocol.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Idempotent provisioning of backing resources.
    async fn initialize(&self) -> Result<()>;

    /// Executes an atomic, partition-scoped batch.
    ///
    /// Conflicts are reported as [`BatchOutcome::Conflict`]; any other
    /// failure (timeout, throttling, unavailability) is an
    /// [`Error::Store`](crate::Error::Store).
    async fn execute_batch(
        &self,
        partition_key: &str,
        batch: TransactionalBatch,
    ) -> Result<BatchOutcome>;

    /// Runs a partition-scoped, server-side-ordered range query by sequence
    /// number.
    ///
    /// `from_sequence` is an inclusive bound: a lower bound when ascending,
    /// an upper bound when descending. An unknown partition yields an empty
    /// result.
    async fn query_events(
        &self,
        partition_key: &str,
        order: SortOrder,
        from_sequence: Option<u64>,
    ) -> Result<Vec<EventDocument>>;

    /// Counts the documents in a partition.
    async fn count_events(&self, partition_key: &str) -> Result<u64>;

    /// Point-reads a single document by identity string.
    ///
    /// A missing document is `Ok(None)`, distinct from other failures.
    async fn read_event(&self, partition_key: &str, id: &str) -> Result<Option<EventDocument>>;
}
