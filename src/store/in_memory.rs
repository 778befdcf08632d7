//! An in-memory event store, useful for testing and development.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tracing::instrument;
use uuid::Uuid;

use crate::resolution::TypeResolution;
use crate::store::copy_stream;
use crate::{
    AppendResult, Error, EventRecord, EventStore, NewEvent, ReadDirection, ResolvedEvent, Result,
    StreamPosition, StreamState, ensure_stream_id,
};

// Type aliases to keep the generic types readable.
type Stream = Vec<EventRecord>;

/// Thread-safe map keyed by stream id.
type StreamMap = DashMap<String, Stream>;

/// An in-memory, thread-safe event store satisfying the same contract as
/// [`DocumentEventStore`](crate::store::document::DocumentEventStore).
///
/// Appends to different streams never contend. Appends to the *same* stream
/// are only as safe as the conflict check: the store deliberately mirrors
/// the backing-store contract, where conflict detection rather than a lock
/// is the safety mechanism, so tests cannot pass against guarantees
/// production does not provide.
///
/// Beyond the contract, the store supports store-wide snapshots
/// ([`create_snapshot`](Self::create_snapshot) /
/// [`restore_snapshot`](Self::restore_snapshot)) for resetting a test store
/// to a known state, and [`copy_to`](Self::copy_to) for replaying its
/// contents into any other store.
pub struct InMemoryEventStore {
    streams: Arc<StreamMap>,
    snapshots: DashMap<Uuid, HashMap<String, Stream>>,
    // Serializes snapshot/restore operations against each other only.
    // Concurrent appends during a snapshot are not blocked, so a snapshot
    // is approximately point-in-time, not linearizable with appends.
    snapshot_lock: Mutex<()>,
    resolution: TypeResolution,
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self {
            streams: Arc::new(DashMap::new()),
            snapshots: DashMap::new(),
            snapshot_lock: Mutex::new(()),
            resolution: TypeResolution::disabled(),
        }
    }
}

impl InMemoryEventStore {
    /// Creates an empty store with type resolution disabled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the type-resolution pipeline applied during reads.
    #[must_use]
    pub fn with_resolution(mut self, resolution: TypeResolution) -> Self {
        self.resolution = resolution;
        self
    }

    /// Deep-copies all streams and stores the copy under a fresh identifier.
    #[instrument(skip(self))]
    pub fn create_snapshot(&self) -> Uuid {
        let _guard = self.snapshot_lock.lock();
        let copy: HashMap<String, Stream> = self
            .streams
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        let snapshot_id = Uuid::new_v4();
        self.snapshots.insert(snapshot_id, copy);
        snapshot_id
    }

    /// Swaps the live streams for the snapshot's streams, optionally
    /// discarding the snapshot afterward.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if no snapshot exists under
    /// `snapshot_id`.
    #[instrument(skip(self), fields(snapshot_id = %snapshot_id, delete_after))]
    pub fn restore_snapshot(&self, snapshot_id: Uuid, delete_after: bool) -> Result<()> {
        let _guard = self.snapshot_lock.lock();
        let copy = if delete_after {
            self.snapshots.remove(&snapshot_id).map(|(_, streams)| streams)
        } else {
            self.snapshots
                .get(&snapshot_id)
                .map(|entry| entry.value().clone())
        };
        let copy = copy.ok_or_else(|| {
            Error::InvalidArgument(format!("unknown snapshot `{snapshot_id}`"))
        })?;

        self.streams.clear();
        for (stream_id, stream) in copy {
            self.streams.insert(stream_id, stream);
        }
        Ok(())
    }

    /// Replays every stream into `target` via one `NoStream`-expected append
    /// per stream, in unspecified stream order.
    ///
    /// Returns the first conflict encountered, or `Success` once every
    /// stream has been copied.
    pub async fn copy_to(&self, target: &dyn EventStore) -> Result<AppendResult> {
        let stream_ids: Vec<String> = self
            .streams
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        for stream_id in stream_ids {
            let result = copy_stream(self, target, &stream_id).await?;
            if !result.is_success() {
                return Ok(result);
            }
        }
        Ok(AppendResult::Success)
    }

    fn resolve(&self, record: EventRecord) -> Result<ResolvedEvent> {
        let data = self.resolution.resolve(&record)?;
        Ok(ResolvedEvent::new(record, data))
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn initialize(&self) -> Result<()> {
        Ok(())
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
        if let StreamState::AtVersion(version) = expected {
            if version < -1 {
                return Err(Error::InvalidArgument(format!(
                    "expected version must be -1 or greater, got {version}"
                )));
            }
        }

        // The entry guard holds the shard lock, so the conflict check and the
        // writes below are atomic per stream. The entry is only materialized
        // once the append is going to proceed: a conflicting append must not
        // leave an empty stream behind.
        let entry = self.streams.entry(stream_id.to_string());
        let current = match &entry {
            Entry::Occupied(occupied) => occupied
                .get()
                .last()
                .map_or(-1, |record| record.sequence_number() as i64),
            Entry::Vacant(_) => -1,
        };

        let conflict = match expected {
            StreamState::NoStream if current >= 0 => Some(StreamState::NoStream),
            StreamState::StreamExists if current < 0 => Some(StreamState::StreamExists),
            StreamState::AtVersion(version) if current != version => {
                Some(StreamState::AtVersion(version))
            }
            _ => None,
        };
        if let Some(state) = conflict {
            return Ok(AppendResult::UnexpectedStreamState(state));
        }

        let mut stream = entry.or_default();
        for (offset, event) in events.into_iter().enumerate() {
            let sequence = (current + 1 + offset as i64) as u64;
            stream.push(EventRecord::new(stream_id, sequence, event));
        }

        Ok(AppendResult::Success)
    }

    #[instrument(skip(self), fields(stream_id, direction = ?direction, start = ?start))]
    async fn read_stream(
        &self,
        stream_id: &str,
        direction: ReadDirection,
        start: StreamPosition,
    ) -> Result<Vec<ResolvedEvent>> {
        ensure_stream_id(stream_id)?;

        let records: Stream = match self.streams.get(stream_id) {
            Some(stream) => stream.clone(),
            None => return Ok(Vec::new()),
        };

        let selected: Vec<EventRecord> = match (direction, start) {
            (ReadDirection::Forward, StreamPosition::Start) => records,
            (ReadDirection::Forward, StreamPosition::At(sequence)) => records
                .into_iter()
                .filter(|record| record.sequence_number() >= sequence)
                .collect(),
            (ReadDirection::Backward, StreamPosition::Start) => {
                records.into_iter().rev().collect()
            }
            (ReadDirection::Backward, StreamPosition::At(sequence)) => records
                .into_iter()
                .filter(|record| record.sequence_number() <= sequence)
                .rev()
                .collect(),
        };

        selected
            .into_iter()
            .map(|record| self.resolve(record))
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

        // Streams are gapless from 0, so the sequence number is the index.
        let record = self
            .streams
            .get(stream_id)
            .and_then(|stream| stream.get(sequence_number as usize).cloned());

        match record {
            Some(record) => Ok(Some(self.resolve(record)?)),
            None => Ok(None),
        }
    }
}
