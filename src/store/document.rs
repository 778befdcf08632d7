//! The event store protocol over an atomic partitioned document store.
//!
//! [`DocumentEventStore`] contains the concurrency-control state machine:
//! every append is translated into one atomic, partition-scoped batch whose
//! conflict outcome is mapped back to an
//! [`AppendResult::UnexpectedStreamState`] value. The backing engine's
//! uniqueness invariant on `(stream_id, sequence_number)`, not a lock, is
//! the safety mechanism.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::instrument;

use crate::document::{BatchOutcome, DocumentStore, EventDocument, SortOrder, TransactionalBatch};
use crate::resolution::TypeResolution;
use crate::{
    AppendResult, Error, EventRecord, EventStore, NewEvent, ReadDirection, ResolvedEvent, Result,
    StreamPosition, StreamState, ensure_stream_id,
};

/// An event store backed by any [`DocumentStore`].
pub struct DocumentEventStore<D> {
    documents: Arc<D>,
    resolution: TypeResolution,
}

impl<D: DocumentStore> DocumentEventStore<D> {
    /// Creates a store over `documents` with type resolution disabled.
    #[must_use]
    pub fn new(documents: Arc<D>) -> Self {
        Self {
            documents,
            resolution: TypeResolution::disabled(),
        }
    }

    /// Replaces the type-resolution pipeline applied during reads.
    #[must_use]
    pub fn with_resolution(mut self, resolution: TypeResolution) -> Self {
        self.resolution = resolution;
        self
    }

    /// Version-lookup sub-procedure: the stream's current highest sequence
    /// number, `-1` when the stream does not exist.
    ///
    /// Not transactionally linked to any subsequent write; the
    /// `StreamExists`/`Any` append paths that rely on it accept
    /// last-writer-wins semantics.
    async fn current_version(&self, stream_id: &str) -> Result<i64> {
        let count = self.documents.count_events(stream_id).await?;
        Ok(count as i64 - 1)
    }

    /// Builds and executes the atomic write placing `events` after `base`.
    ///
    /// When `validate` is set (and `base` names a real position), the batch
    /// starts with a conditional read of the record at `base`, so a missing
    /// record fails the whole transaction. For `base == -1` the creates at
    /// sequence 0 carry the uniqueness check themselves.
    async fn write_after(
        &self,
        stream_id: &str,
        base: i64,
        events: Vec<NewEvent>,
        validate: bool,
    ) -> Result<BatchOutcome> {
        let mut batch = TransactionalBatch::new();
        if validate && base >= 0 {
            batch.read(format!("{base}@{stream_id}"));
        }
        for (offset, event) in events.into_iter().enumerate() {
            let sequence = (base + 1 + offset as i64) as u64;
            batch.create(EventDocument::new(EventRecord::new(
                stream_id, sequence, event,
            )));
        }
        self.documents.execute_batch(stream_id, batch).await
    }

    fn resolve(&self, record: EventRecord) -> Result<ResolvedEvent> {
        let data = self.resolution.resolve(&record)?;
        Ok(ResolvedEvent::new(record, data))
    }
}

#[async_trait]
impl<D> EventStore for DocumentEventStore<D>
where
    D: DocumentStore,
{
    async fn initialize(&self) -> Result<()> {
        self.documents.initialize().await
    }

    #[instrument(skip(self, events), fields(stream_id, expected = ?expected, count = events.len()))]
    async fn append(
        &self,
        stream_id: &str,
        events: Vec<NewEvent>,
        expected: StreamState,
    ) -> Result<AppendResult> {
        ensure_stream_id(stream_id)?;
        if events.is_empty() {
            return Ok(AppendResult::Success);
        }

        let (base, validate, conflict) = match expected {
            StreamState::NoStream => (-1, false, StreamState::NoStream),
            StreamState::AtVersion(version) if version < -1 => {
                return Err(Error::InvalidArgument(format!(
                    "expected version must be -1 or greater, got {version}"
                )));
            }
            StreamState::AtVersion(version) => (version, true, StreamState::AtVersion(version)),
            StreamState::StreamExists => {
                let version = self.current_version(stream_id).await?;
                if version < 0 {
                    return Ok(AppendResult::UnexpectedStreamState(StreamState::StreamExists));
                }
                // Version already resolved; append without re-validating it.
                (version, false, StreamState::AtVersion(version))
            }
            StreamState::Any => {
                let version = self.current_version(stream_id).await?;
                (version, false, StreamState::AtVersion(version))
            }
        };

        match self.write_after(stream_id, base, events, validate).await? {
            BatchOutcome::Committed => Ok(AppendResult::Success),
            BatchOutcome::Conflict => Ok(AppendResult::UnexpectedStreamState(conflict)),
        }
    }

    #[instrument(skip(self), fields(stream_id, direction = ?direction, start = ?start))]
    async fn read_stream(
        &self,
        stream_id: &str,
        direction: ReadDirection,
        start: StreamPosition,
    ) -> Result<Vec<ResolvedEvent>> {
        ensure_stream_id(stream_id)?;

        let order = match direction {
            ReadDirection::Forward => SortOrder::Ascending,
            ReadDirection::Backward => SortOrder::Descending,
        };
        let from_sequence = match start {
            StreamPosition::Start => None,
            StreamPosition::At(sequence) => Some(sequence),
        };

        self.documents
            .query_events(stream_id, order, from_sequence)
            .await?
            .into_iter()
            .map(|document| self.resolve(document.record))
            .collect()
    }

    #[instrument(skip(self), fields(stream_id, sequence_number))]
    async fn read_stream_event(
        &self,
        stream_id: &str,
        sequence_number: i64,
    ) -> Result<Option<ResolvedEvent>> {
        ensure_stream_id(stream_id)?;
        if sequence_number < 0 {
            return Err(Error::InvalidArgument(format!(
                "sequence number must be non-negative, got {sequence_number}"
            )));
        }

        let id = format!("{sequence_number}@{stream_id}");
        match self.documents.read_event(stream_id, &id).await? {
            Some(document) => Ok(Some(self.resolve(document.record)?)),
            None => Ok(None),
        }
    }
}
