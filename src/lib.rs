//! # Event streams over partitioned document stores
//!
//! `annals` provides append-only event streams with optimistic concurrency,
//! ordered replay, and polymorphic event typing, built on any storage engine
//! that can execute atomic, partition-scoped batches of document operations.
//!
//! ## Core concepts
//!
//! - **[`EventStore`]**: the protocol contract (`append`, `read_stream`,
//!   `read_stream_event`, `initialize`).
//! - **[`StreamState`]**: the expected (or actual) position of a stream,
//!   used to gate appends.
//! - **[`AppendResult`]**: concurrency conflicts are values, never errors.
//! - **[`DocumentStore`](document::DocumentStore)**: the capability an
//!   engine must provide for [`DocumentEventStore`](store::document::DocumentEventStore)
//!   to run the concurrency-control state machine against it.
//! - **[`TypeResolution`](resolution::TypeResolution)**: decides, per record
//!   and at read time, which concrete payload type to decode into and what to
//!   do when that fails.
//! - **[`Repository`](repository::Repository)**: load/fold/save for
//!   event-sourced aggregates, built purely on the [`EventStore`] contract.
//!
//! ## Example
//!
//! ```rust
//! use annals::{AppendResult, EventStore, NewEvent, ReadDirection, StreamPosition, StreamState};
//! use annals::store::in_memory::InMemoryEventStore;
//! use serde_json::json;
//!
//! futures::executor::block_on(async {
//!     let store = InMemoryEventStore::new();
//!
//!     // The stream does not exist yet, so `NoStream` succeeds.
//!     let event = NewEvent::new("OrderPlaced", json!({ "total_cents": 4200 }));
//!     let result = store
//!         .append("order-1", vec![event], StreamState::NoStream)
//!         .await?;
//!     assert_eq!(result, AppendResult::Success);
//!
//!     // A second `NoStream` append conflicts; the conflict is a value.
//!     let event = NewEvent::new("OrderShipped", json!({}));
//!     let result = store
//!         .append("order-1", vec![event], StreamState::NoStream)
//!         .await?;
//!     assert_eq!(
//!         result,
//!         AppendResult::UnexpectedStreamState(StreamState::NoStream)
//!     );
//!
//!     let events = store
//!         .read_stream("order-1", ReadDirection::Forward, StreamPosition::Start)
//!         .await?;
//!     assert_eq!(events.len(), 1);
//!     assert_eq!(events[0].record().sequence_number(), 0);
//!     annals::Result::Ok(())
//! })
//! .unwrap();
//! ```
#![deny(missing_docs)]

use std::collections::HashMap;
use std::fmt::Debug;

pub use async_trait::async_trait;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use uuid::Uuid;

pub mod cloudevent;
pub mod document;
pub mod repository;
pub mod resolution;
pub mod store;

pub use cloudevent::CloudEvent;
pub use resolution::{EventData, ResolvedEvent};

/// The error type for this crate.
///
/// Expected outcomes such as concurrency conflicts and missing records are
/// never errors: they are carried by [`AppendResult`] and `Option` values.
/// Everything here is either a caller mistake or a genuine failure.
#[derive(Debug, thiserror::Error, Clone)]
pub enum Error {
    /// The aggregate's stream contains no events.
    #[error("aggregate not found")]
    AggregateNotFound,
    /// A synchronously rejected argument, such as an empty stream id or a
    /// negative sequence number. No I/O has been performed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// A component was constructed with an unusable configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    /// A record's metadata lacks a field required by the configured resolver.
    #[error("missing metadata field `{0}`")]
    MissingMetadata(&'static str),
    /// A record's type tag does not correspond to any known payload type.
    #[error("unresolvable event type `{0}`")]
    UnresolvableType(String),
    /// A payload could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// A transport or backing-store failure (timeout, throttling,
    /// unavailability). Never retried at this layer.
    #[error("document store error: {0}")]
    Store(String),
}

/// A specialized `Result` type for this crate's operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The expected (or actual) position of a stream.
///
/// Passed to [`EventStore::append`] to gate the write, and carried back
/// inside [`AppendResult::UnexpectedStreamState`] when the gate fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamState {
    /// The stream must not exist yet.
    NoStream,
    /// The stream must exist, at any position.
    StreamExists,
    /// No constraint; append regardless of current position.
    Any,
    /// The stream's current highest sequence number must equal this value.
    /// `AtVersion(-1)` describes the empty stream.
    AtVersion(i64),
}

/// The outcome of an append.
///
/// An optimistic-concurrency conflict is an expected outcome of a race, so it
/// is returned as a value rather than an [`Error`]. Callers are expected to
/// reload and retry, or report a domain-level conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendResult {
    /// The write committed.
    Success,
    /// The stream was not in the expected state; nothing was written.
    UnexpectedStreamState(StreamState),
}

impl AppendResult {
    /// Returns `true` if the write committed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// The direction of a stream read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadDirection {
    /// Ascending sequence numbers.
    Forward,
    /// Descending sequence numbers.
    Backward,
}

/// Where a stream read begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPosition {
    /// The natural beginning for the chosen direction: sequence 0 when
    /// reading forward, the stream head when reading backward.
    Start,
    /// An explicit sequence number, inclusive.
    At(u64),
}

/// String-keyed metadata attached to every record.
///
/// Carries at minimum the type-resolution hints written by the record
/// factory; applications may add their own keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata(HashMap<String, Value>);

impl EventMetadata {
    /// Metadata key holding the short (non-qualified) type tag.
    pub const TYPE_HINT: &'static str = "type";
    /// Metadata key holding the fully-qualified type tag.
    pub const QUALIFIED_TYPE_HINT: &'static str = "qualified-type";

    /// Creates empty metadata.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates metadata carrying both type-resolution hints.
    #[must_use]
    pub fn with_type_hints(short: &str, qualified: &str) -> Self {
        let mut metadata = Self::new();
        metadata.insert(Self::TYPE_HINT, Value::String(short.to_string()));
        metadata.insert(
            Self::QUALIFIED_TYPE_HINT,
            Value::String(qualified.to_string()),
        );
        metadata
    }

    /// Inserts a key/value pair, replacing any previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    /// Returns the value stored under `key`, if any.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Returns the string value stored under `key`, if any.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Returns the short type tag hint, if present.
    #[must_use]
    pub fn type_hint(&self) -> Option<&str> {
        self.get_str(Self::TYPE_HINT)
    }

    /// Returns the fully-qualified type tag hint, if present.
    #[must_use]
    pub fn qualified_type_hint(&self) -> Option<&str> {
        self.get_str(Self::QUALIFIED_TYPE_HINT)
    }

    /// Returns `true` if no metadata is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// An event proposed for appending, before the store assigns it a position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    event_id: Uuid,
    event_type: String,
    payload: Value,
    metadata: EventMetadata,
}

impl NewEvent {
    /// Creates a new event with a freshly generated id and empty metadata.
    #[must_use]
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            payload,
            metadata: EventMetadata::new(),
        }
    }

    /// Replaces the event's metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Rebuilds the append-side view of an existing record, preserving its
    /// identity. Used when replaying a stream into another store.
    #[must_use]
    pub fn from_record(record: &EventRecord) -> Self {
        Self {
            event_id: record.event_id,
            event_type: record.event_type.clone(),
            payload: record.payload.clone(),
            metadata: record.metadata.clone(),
        }
    }

    /// Returns the event's globally unique id.
    #[must_use]
    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    /// Returns the event's type tag.
    #[must_use]
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Returns the event's payload.
    #[must_use]
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Returns the event's metadata.
    #[must_use]
    pub fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }
}

/// The immutable unit persisted per stream position.
///
/// The pair `(stream_id, sequence_number)` is unique for the lifetime of the
/// store; sequence numbers within a stream are gapless and start at 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    stream_id: String,
    sequence_number: u64,
    event_id: Uuid,
    event_type: String,
    payload: Value,
    metadata: EventMetadata,
}

impl EventRecord {
    /// Places a proposed event at a position within a stream.
    #[must_use]
    pub fn new(stream_id: impl Into<String>, sequence_number: u64, event: NewEvent) -> Self {
        Self {
            stream_id: stream_id.into(),
            sequence_number,
            event_id: event.event_id,
            event_type: event.event_type,
            payload: event.payload,
            metadata: event.metadata,
        }
    }

    /// Returns the record's identity string, `"{sequence_number}@{stream_id}"`.
    ///
    /// This doubles as the natural idempotency key and the concurrency-token
    /// surface in the backing store.
    #[must_use]
    pub fn document_id(&self) -> String {
        format!("{}@{}", self.sequence_number, self.stream_id)
    }

    /// Returns the stream this record belongs to.
    #[must_use]
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Returns the record's zero-based position within its stream.
    #[must_use]
    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    /// Returns the event's globally unique id, stable across storage.
    #[must_use]
    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    /// Returns the human-readable tag for the payload's logical kind.
    #[must_use]
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Returns the raw, untyped payload.
    #[must_use]
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Returns the record's metadata.
    #[must_use]
    pub fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }
}

/// A marker trait for domain events.
///
/// Domain events must be serializable, deserializable, clonable, and
/// debuggable; the repository serializes them to JSON payloads and folds them
/// back through [`Aggregate::apply`].
pub trait DomainEvent: Serialize + DeserializeOwned + Clone + Debug + Send + Sync {
    /// Returns the short type tag for this event.
    fn event_type(&self) -> &'static str;

    /// Returns the namespace used to build the fully-qualified type tag,
    /// `"{namespace}.{event_type}"`.
    fn event_namespace(&self) -> &'static str {
        "events"
    }
}

/// Uniquely identifies an aggregate instance.
///
/// The `Display` form of the id is the stream id of the aggregate's stream.
pub trait AggregateId:
    Eq + std::hash::Hash + Clone + Send + Sync + Debug + std::fmt::Display + 'static
{
    /// Creates a new, unique aggregate ID.
    fn new() -> Self;
}

impl AggregateId for Uuid {
    fn new() -> Self {
        Uuid::new_v4()
    }
}

/// An event-sourced domain object, reconstructed by folding its stream.
///
/// An aggregate owns its identity, a buffer of pending (uncommitted) domain
/// events, and the last committed version (`-1` until the first save).
/// Domain operations apply an event and push it onto the pending buffer; the
/// repository appends the buffer with `AtVersion(committed_version)` and, on
/// success, calls [`mark_committed`](Aggregate::mark_committed). On conflict
/// the buffer is left intact so the caller may reload and retry.
pub trait Aggregate: Default + Send + Sync + 'static {
    /// The type of the aggregate's unique identifier.
    type Id: AggregateId;
    /// The type of events that this aggregate produces.
    type Event: DomainEvent;

    /// Returns the unique identifier of the aggregate.
    fn id(&self) -> &Self::Id;

    /// Returns the last committed version, `-1` when nothing is committed.
    fn committed_version(&self) -> i64;

    /// Folds one event into the aggregate's state.
    fn apply(&mut self, event: &Self::Event);

    /// Returns the pending (uncommitted) events, oldest first.
    fn pending_events(&self) -> &[Self::Event];

    /// Clears the pending buffer and advances the committed version.
    fn mark_committed(&mut self, version: i64);
}

/// The event store protocol: the sole durable-storage surface.
///
/// Implementations must satisfy the same contract whether backed by a remote
/// partitioned store ([`store::document::DocumentEventStore`]) or by the
/// in-process reference stores.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Idempotent setup of any backing resources.
    async fn initialize(&self) -> Result<()>;

    /// Appends `events` to `stream_id`, gated by `expected`.
    ///
    /// An empty `events` list is a no-op returning
    /// [`AppendResult::Success`] without touching storage. An empty
    /// `stream_id` is rejected with [`Error::InvalidArgument`] before any
    /// I/O. Concurrency conflicts are returned as
    /// [`AppendResult::UnexpectedStreamState`]; transport failures propagate
    /// as [`Error::Store`].
    async fn append(
        &self,
        stream_id: &str,
        events: Vec<NewEvent>,
        expected: StreamState,
    ) -> Result<AppendResult>;

    /// Reads a stream, ordered by sequence number in the chosen direction.
    ///
    /// The full result is materialized before returning; every record passes
    /// through the store's type-resolution pipeline. Reading a stream that
    /// was never written returns an empty sequence, never an error.
    async fn read_stream(
        &self,
        stream_id: &str,
        direction: ReadDirection,
        start: StreamPosition,
    ) -> Result<Vec<ResolvedEvent>>;

    /// Reads the single record at `sequence_number`.
    ///
    /// A negative sequence number is a contract violation
    /// ([`Error::InvalidArgument`]); a missing record yields `Ok(None)`.
    async fn read_stream_event(
        &self,
        stream_id: &str,
        sequence_number: i64,
    ) -> Result<Option<ResolvedEvent>>;
}

pub(crate) fn ensure_stream_id(stream_id: &str) -> Result<()> {
    if stream_id.is_empty() {
        return Err(Error::InvalidArgument("stream id must not be empty".into()));
    }
    Ok(())
}
