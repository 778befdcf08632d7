//! Polymorphic event-type resolution.
//!
//! A stored record carries an untyped JSON payload; which concrete type it
//! decodes into is decided per record, at read time, by a pluggable
//! [`TypeResolver`]. What happens when resolution fails is decided by a
//! pluggable [`UnresolvedEventStrategy`]. Both are selected at construction
//! time and combined into a [`TypeResolution`] pipeline that every store runs
//! its reads through.
//!
//! External change-notification consumers observe records outside of a
//! direct stream read; they are expected to run the same pipeline themselves
//! via [`TypeResolution::resolve`].

use std::any::Any;
use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::sync::Arc;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use uuid::Uuid;

use crate::{Error, EventMetadata, EventRecord, Result};

/// A type-erased, decoded event payload.
///
/// Implemented for every `Any + Debug + Send + Sync` type; concrete payloads
/// are recovered by downcasting through [`TypedEvent::downcast_ref`].
pub trait ErasedEvent: Any + Debug + Send + Sync {
    /// Returns the payload as `&dyn Any` for downcasting.
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any + Debug + Send + Sync> ErasedEvent for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

type DecodeFn = dyn Fn(&Value) -> Result<Arc<dyn ErasedEvent>> + Send + Sync;

/// A concrete payload type a resolver can resolve to: a name plus a decode
/// function from raw JSON into the type.
#[derive(Clone)]
pub struct EventType {
    name: Arc<str>,
    decode: Arc<DecodeFn>,
}

impl EventType {
    /// Builds the binding for `T` under the given tag.
    #[must_use]
    pub fn of<T>(name: &str) -> Self
    where
        T: DeserializeOwned + Debug + Send + Sync + 'static,
    {
        let name: Arc<str> = Arc::from(name);
        let error_name = Arc::clone(&name);
        Self {
            name,
            decode: Arc::new(move |payload| {
                serde_json::from_value::<T>(payload.clone())
                    .map(|event| Arc::new(event) as Arc<dyn ErasedEvent>)
                    .map_err(|e| Error::Serialization(format!("decoding `{error_name}`: {e}")))
            }),
        }
    }

    /// Returns the tag this type is registered under.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Decodes a raw payload into this type.
    pub fn decode(&self, payload: &Value) -> Result<Arc<dyn ErasedEvent>> {
        (self.decode)(payload)
    }
}

impl Debug for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventType").field("name", &self.name).finish()
    }
}

/// Decides which concrete payload type a stored record decodes into.
///
/// `Ok(None)` means "no type known for this record" and hands the record to
/// the configured [`UnresolvedEventStrategy`]; resolver-specific failures
/// ([`Error::MissingMetadata`], [`Error::UnresolvableType`]) are subject to
/// the same strategy.
pub trait TypeResolver: Send + Sync {
    /// Resolves the payload type for the record identified by `record_id`.
    fn resolve(&self, record_id: &str, metadata: &EventMetadata) -> Result<Option<EventType>>;
}

/// Resolves the fully-qualified type tag carried in record metadata against
/// a registry of known types.
///
/// Fails with [`Error::MissingMetadata`] when the qualified hint is absent
/// and [`Error::UnresolvableType`] when it names no registered type.
/// Successful lookups are cached by tag.
#[derive(Debug, Default)]
pub struct MetadataTypeResolver {
    known: HashMap<String, EventType>,
    cache: DashMap<String, EventType>,
}

impl MetadataTypeResolver {
    /// Creates a resolver with an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T` under its fully-qualified tag.
    #[must_use]
    pub fn register<T>(mut self, qualified: &str) -> Self
    where
        T: DeserializeOwned + Debug + Send + Sync + 'static,
    {
        self.known
            .insert(qualified.to_string(), EventType::of::<T>(qualified));
        self
    }
}

impl TypeResolver for MetadataTypeResolver {
    fn resolve(&self, _record_id: &str, metadata: &EventMetadata) -> Result<Option<EventType>> {
        let tag = metadata
            .qualified_type_hint()
            .ok_or(Error::MissingMetadata(EventMetadata::QUALIFIED_TYPE_HINT))?;

        if let Some(hit) = self.cache.get(tag) {
            return Ok(Some(hit.clone()));
        }

        match self.known.get(tag) {
            Some(ty) => {
                self.cache.insert(tag.to_string(), ty.clone());
                Ok(Some(ty.clone()))
            }
            None => Err(Error::UnresolvableType(tag.to_string())),
        }
    }
}

/// Resolves the short type tag carried in record metadata against an
/// explicit map, with an optional fallback type.
///
/// A record whose tag is missing or unmapped resolves to the fallback when
/// one is configured, and to `None` otherwise.
#[derive(Debug)]
pub struct TypeMapResolver {
    map: HashMap<String, EventType>,
    fallback: Option<EventType>,
}

impl TypeMapResolver {
    /// Creates a resolver from an explicit short-name map.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] if the map is empty.
    pub fn new(map: HashMap<String, EventType>) -> Result<Self> {
        if map.is_empty() {
            return Err(Error::InvalidConfiguration(
                "type map resolver requires at least one mapping".into(),
            ));
        }
        Ok(Self {
            map,
            fallback: None,
        })
    }

    /// Sets the type to resolve to when a tag has no map entry.
    #[must_use]
    pub fn with_fallback(mut self, fallback: EventType) -> Self {
        self.fallback = Some(fallback);
        self
    }
}

impl TypeResolver for TypeMapResolver {
    fn resolve(&self, _record_id: &str, metadata: &EventMetadata) -> Result<Option<EventType>> {
        Ok(metadata
            .type_hint()
            .and_then(|tag| self.map.get(tag))
            .or(self.fallback.as_ref())
            .cloned())
    }
}

/// The sentinel payload substituted by [`SkipUnresolved`].
///
/// Preserves event id, type tag, metadata, and sequence number so that
/// stream replay order is undisturbed even though payload detail is lost.
#[derive(Debug, Clone, PartialEq)]
pub struct UnresolvedEvent {
    event_id: Uuid,
    event_type: String,
    sequence_number: u64,
    metadata: EventMetadata,
}

impl UnresolvedEvent {
    fn from_record(record: &EventRecord) -> Self {
        Self {
            event_id: record.event_id(),
            event_type: record.event_type().to_string(),
            sequence_number: record.sequence_number(),
            metadata: record.metadata().clone(),
        }
    }

    /// Returns the event's globally unique id.
    #[must_use]
    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    /// Returns the unresolvable type tag.
    #[must_use]
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Returns the record's position within its stream.
    #[must_use]
    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    /// Returns the record's metadata.
    #[must_use]
    pub fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }
}

/// A payload decoded into its registered concrete type.
#[derive(Debug, Clone)]
pub struct TypedEvent {
    type_name: Arc<str>,
    value: Arc<dyn ErasedEvent>,
}

impl TypedEvent {
    /// Returns the resolved type's tag.
    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Returns the decoded payload as a trait object.
    #[must_use]
    pub fn value(&self) -> &dyn ErasedEvent {
        self.value.as_ref()
    }

    /// Downcasts the decoded payload to `T`.
    #[must_use]
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        // Call through `as_ref` so the call binds to the payload's
        // `ErasedEvent` impl, not the blanket impl on `Arc` itself.
        self.value.as_ref().as_any().downcast_ref()
    }
}

/// The resolution outcome attached to every record returned by a read.
#[derive(Debug, Clone)]
pub enum EventData {
    /// Resolution is not configured for this store; only the raw payload on
    /// the record is available.
    Raw,
    /// The payload decoded into the concrete type registered for its tag.
    Typed(TypedEvent),
    /// The sentinel substituted by [`SkipUnresolved`].
    Unresolved(UnresolvedEvent),
}

impl EventData {
    /// Downcasts a typed payload to `T`; `None` for raw or unresolved data.
    #[must_use]
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        match self {
            Self::Typed(typed) => typed.downcast_ref(),
            Self::Raw | Self::Unresolved(_) => None,
        }
    }
}

/// An [`EventRecord`] paired with its resolution outcome: the unit returned
/// by stream reads.
#[derive(Debug, Clone)]
pub struct ResolvedEvent {
    record: EventRecord,
    data: EventData,
}

impl ResolvedEvent {
    /// Pairs a record with its resolution outcome.
    #[must_use]
    pub fn new(record: EventRecord, data: EventData) -> Self {
        Self { record, data }
    }

    /// Returns the underlying record.
    #[must_use]
    pub fn record(&self) -> &EventRecord {
        &self.record
    }

    /// Returns the resolution outcome.
    #[must_use]
    pub fn data(&self) -> &EventData {
        &self.data
    }

    /// Consumes the pair and returns the underlying record.
    #[must_use]
    pub fn into_record(self) -> EventRecord {
        self.record
    }
}

/// Decides what a read does with a record whose type could not be resolved.
pub trait UnresolvedEventStrategy: Send + Sync {
    /// Invoked with the offending record and the resolver's failure.
    fn on_unresolved(&self, record: &EventRecord, cause: Error) -> Result<EventData>;
}

/// Propagates the resolution failure immediately, halting the read.
///
/// This is the default strategy.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThrowOnUnresolved;

impl UnresolvedEventStrategy for ThrowOnUnresolved {
    fn on_unresolved(&self, _record: &EventRecord, cause: Error) -> Result<EventData> {
        Err(cause)
    }
}

/// Substitutes an [`UnresolvedEvent`] sentinel and lets the read continue.
#[derive(Debug, Clone, Copy, Default)]
pub struct SkipUnresolved;

impl UnresolvedEventStrategy for SkipUnresolved {
    fn on_unresolved(&self, record: &EventRecord, cause: Error) -> Result<EventData> {
        tracing::debug!(
            record_id = %record.document_id(),
            %cause,
            "substituting unresolved event sentinel"
        );
        Ok(EventData::Unresolved(UnresolvedEvent::from_record(record)))
    }
}

/// The per-store resolution pipeline: a resolver plus an unresolved-event
/// strategy, both selected at construction time.
#[derive(Clone)]
pub struct TypeResolution {
    resolver: Option<Arc<dyn TypeResolver>>,
    on_unresolved: Arc<dyn UnresolvedEventStrategy>,
}

impl Default for TypeResolution {
    fn default() -> Self {
        Self::disabled()
    }
}

impl TypeResolution {
    /// A pipeline that performs no resolution: every record comes back as
    /// [`EventData::Raw`].
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            resolver: None,
            on_unresolved: Arc::new(ThrowOnUnresolved),
        }
    }

    /// A pipeline using `resolver` with the default
    /// [`ThrowOnUnresolved`] strategy.
    #[must_use]
    pub fn new(resolver: impl TypeResolver + 'static) -> Self {
        Self {
            resolver: Some(Arc::new(resolver)),
            on_unresolved: Arc::new(ThrowOnUnresolved),
        }
    }

    /// Replaces the unresolved-event strategy.
    #[must_use]
    pub fn on_unresolved(mut self, strategy: impl UnresolvedEventStrategy + 'static) -> Self {
        self.on_unresolved = Arc::new(strategy);
        self
    }

    /// Runs one record through the pipeline.
    ///
    /// A resolver failure under [`SkipUnresolved`] affects only this record;
    /// decode failures of a successfully resolved type are always fatal.
    pub fn resolve(&self, record: &EventRecord) -> Result<EventData> {
        let Some(resolver) = &self.resolver else {
            return Ok(EventData::Raw);
        };

        match resolver.resolve(&record.document_id(), record.metadata()) {
            Ok(Some(ty)) => Ok(EventData::Typed(TypedEvent {
                type_name: Arc::from(ty.name()),
                value: ty.decode(record.payload())?,
            })),
            Ok(None) => self.on_unresolved.on_unresolved(
                record,
                Error::UnresolvableType(record.event_type().to_string()),
            ),
            Err(cause @ (Error::MissingMetadata(_) | Error::UnresolvableType(_))) => {
                self.on_unresolved.on_unresolved(record, cause)
            }
            Err(other) => Err(other),
        }
    }
}

impl Debug for TypeResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeResolution")
            .field("enabled", &self.resolver.is_some())
            .finish()
    }
}
