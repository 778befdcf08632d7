//! A persistent, disk-backed event store using `sled`.

use async_trait::async_trait;
use tracing::instrument;

use crate::resolution::TypeResolution;
use crate::{
    AppendResult, Error, EventRecord, EventStore, NewEvent, ReadDirection, ResolvedEvent, Result,
    StreamPosition, StreamState, ensure_stream_id,
};

/// A persistent event store satisfying the same contract as the in-memory
/// reference store.
///
/// Each stream lives in its own `sled::Tree`, keyed by the big-endian
/// sequence number so that scans come back in stream order.
#[derive(Clone)]
pub struct SledEventStore {
    db: sled::Db,
    resolution: TypeResolution,
}

impl SledEventStore {
    /// Creates a store over an open `sled` database.
    #[must_use]
    pub fn new(db: sled::Db) -> Self {
        Self {
            db,
            resolution: TypeResolution::disabled(),
        }
    }

    /// Replaces the type-resolution pipeline applied during reads.
    #[must_use]
    pub fn with_resolution(mut self, resolution: TypeResolution) -> Self {
        self.resolution = resolution;
        self
    }

    fn tree(&self, stream_id: &str) -> Result<sled::Tree> {
        self.db
            .open_tree(stream_id.as_bytes())
            .map_err(|e| Error::Store(e.to_string()))
    }

    fn resolve(&self, record: EventRecord) -> Result<ResolvedEvent> {
        let data = self.resolution.resolve(&record)?;
        Ok(ResolvedEvent::new(record, data))
    }
}

fn decode(value: &[u8]) -> Result<EventRecord> {
    serde_json::from_slice(value).map_err(|e| Error::Store(e.to_string()))
}

fn current_version(tree: &sled::Tree) -> Result<i64> {
    match tree.last().map_err(|e| Error::Store(e.to_string()))? {
        Some((key, _)) => {
            let bytes: [u8; 8] = key
                .as_ref()
                .try_into()
                .map_err(|_| Error::Store("malformed sequence key".into()))?;
            Ok(u64::from_be_bytes(bytes) as i64)
        }
        None => Ok(-1),
    }
}

#[async_trait]
impl EventStore for SledEventStore {
    async fn initialize(&self) -> Result<()> {
        self.db.flush().map_err(|e| Error::Store(e.to_string()))?;
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

        let tree = self.tree(stream_id)?;
        let current = current_version(&tree)?;

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

        let mut to_commit = Vec::with_capacity(events.len());
        for (offset, event) in events.into_iter().enumerate() {
            let sequence = (current + 1 + offset as i64) as u64;
            let record = EventRecord::new(stream_id, sequence, event);
            let value = serde_json::to_vec(&record).map_err(|e| Error::Store(e.to_string()))?;
            to_commit.push((sequence.to_be_bytes(), value));
        }

        tree.transaction(|tx| {
            for (key, value) in &to_commit {
                tx.insert(key.as_slice(), value.as_slice())?;
            }
            Ok(())
        })
        .map_err(|e: sled::transaction::TransactionError| Error::Store(e.to_string()))?;

        tree.flush().map_err(|e| Error::Store(e.to_string()))?;
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
        let tree = self.tree(stream_id)?;

        let entries: Vec<sled::IVec> = match (direction, start) {
            (ReadDirection::Forward, StreamPosition::Start) => tree
                .iter()
                .values()
                .collect::<std::result::Result<_, _>>(),
            (ReadDirection::Forward, StreamPosition::At(sequence)) => tree
                .range(sequence.to_be_bytes()..)
                .values()
                .collect::<std::result::Result<_, _>>(),
            (ReadDirection::Backward, StreamPosition::Start) => tree
                .iter()
                .values()
                .rev()
                .collect::<std::result::Result<_, _>>(),
            (ReadDirection::Backward, StreamPosition::At(sequence)) => tree
                .range(..=sequence.to_be_bytes())
                .values()
                .rev()
                .collect::<std::result::Result<_, _>>(),
        }
        .map_err(|e| Error::Store(e.to_string()))?;

        entries
            .iter()
            .map(|value| self.resolve(decode(value)?))
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

        let tree = self.tree(stream_id)?;
        match tree
            .get((sequence_number as u64).to_be_bytes())
            .map_err(|e| Error::Store(e.to_string()))?
        {
            Some(value) => Ok(Some(self.resolve(decode(&value)?)?)),
            None => Ok(None),
        }
    }
}
