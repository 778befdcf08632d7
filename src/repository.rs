//! Provides a generic repository for loading and saving aggregates.
//!
//! The repository is built purely on the [`EventStore`] contract: loading is
//! a forward read folded through [`Aggregate::apply`], saving is one
//! `AtVersion`-gated append of the aggregate's pending events. No aggregate
//! state is retained between calls; each `get_by_id`/`save` is a fresh
//! load/flush cycle.

use std::{marker::PhantomData, sync::Arc};

use async_trait::async_trait;
use tracing::instrument;

use crate::{
    Aggregate, AppendResult, DomainEvent, Error, EventMetadata, EventStore, NewEvent,
    ReadDirection, Result, StreamPosition, StreamState,
};

/// Converts a domain event into its append-side record form.
///
/// The factory assigns a fresh event id and derives the type tag and the
/// metadata type hints from the event's logical type.
pub trait RecordFactory<E: DomainEvent>: Send + Sync {
    /// Builds the record for one pending event.
    fn create(&self, event: &E) -> Result<NewEvent>;
}

/// The default factory: JSON payload plus both type-resolution hints.
///
/// The qualified hint is `"{namespace}.{event_type}"`, matching the tags
/// expected by [`MetadataTypeResolver`](crate::resolution::MetadataTypeResolver).
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonRecordFactory;

impl<E: DomainEvent> RecordFactory<E> for JsonRecordFactory {
    fn create(&self, event: &E) -> Result<NewEvent> {
        let payload = serde_json::to_value(event).map_err(|e| Error::Serialization(e.to_string()))?;
        let qualified = format!("{}.{}", event.event_namespace(), event.event_type());
        let metadata = EventMetadata::with_type_hints(event.event_type(), &qualified);
        Ok(NewEvent::new(event.event_type(), payload).with_metadata(metadata))
    }
}

/// Defines the standard interface for a repository.
#[async_trait]
pub trait Repository<A: Aggregate>: Send + Sync {
    /// Loads an aggregate by folding its full stream from the start.
    ///
    /// An empty stream yields [`Error::AggregateNotFound`] rather than an
    /// empty aggregate.
    async fn get_by_id(&self, id: &A::Id) -> Result<A>;

    /// Appends the aggregate's pending events with
    /// `AtVersion(committed_version)`.
    ///
    /// With no pending events this commits trivially without a write. On
    /// `Success` the pending buffer is cleared and the committed version
    /// advances; on conflict the buffer is left intact so the caller may
    /// reload and retry.
    async fn save(&self, aggregate: &mut A) -> Result<AppendResult>;
}

/// A generic, high-level repository over any [`EventStore`].
pub struct GenericRepository<A, S>
where
    A: Aggregate,
    S: EventStore,
{
    store: Arc<S>,
    factory: Arc<dyn RecordFactory<A::Event>>,
    _phantom: PhantomData<A>,
}

impl<A, S> GenericRepository<A, S>
where
    A: Aggregate,
    S: EventStore,
{
    /// Creates a repository using the default [`JsonRecordFactory`].
    #[must_use]
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            factory: Arc::new(JsonRecordFactory),
            _phantom: PhantomData,
        }
    }

    /// Replaces the record factory.
    #[must_use]
    pub fn with_factory(mut self, factory: Arc<dyn RecordFactory<A::Event>>) -> Self {
        self.factory = factory;
        self
    }
}

#[async_trait]
impl<A, S> Repository<A> for GenericRepository<A, S>
where
    A: Aggregate,
    S: EventStore + 'static,
{
    #[instrument(skip(self), fields(aggregate.id = %id))]
    async fn get_by_id(&self, id: &A::Id) -> Result<A> {
        let stream_id = id.to_string();
        let events = self
            .store
            .read_stream(&stream_id, ReadDirection::Forward, StreamPosition::Start)
            .await?;

        if events.is_empty() {
            return Err(Error::AggregateNotFound);
        }

        let mut aggregate = A::default();
        let mut version = -1;
        for resolved in events {
            let event: A::Event = serde_json::from_value(resolved.record().payload().clone())
                .map_err(|e| Error::Serialization(e.to_string()))?;
            aggregate.apply(&event);
            version = resolved.record().sequence_number() as i64;
        }
        aggregate.mark_committed(version);

        Ok(aggregate)
    }

    #[instrument(skip(self, aggregate), fields(aggregate.id = %aggregate.id()))]
    async fn save(&self, aggregate: &mut A) -> Result<AppendResult> {
        let pending = aggregate.pending_events();
        if pending.is_empty() {
            return Ok(AppendResult::Success);
        }

        let events: Vec<NewEvent> = pending
            .iter()
            .map(|event| self.factory.create(event))
            .collect::<Result<_>>()?;
        let appended = events.len() as i64;
        let expected = StreamState::AtVersion(aggregate.committed_version());

        let result = self
            .store
            .append(&aggregate.id().to_string(), events, expected)
            .await?;

        if result.is_success() {
            let version = aggregate.committed_version() + appended;
            aggregate.mark_committed(version);
        }
        Ok(result)
    }
}

#[async_trait]
impl<A, R> Repository<A> for Arc<R>
where
    A: Aggregate,
    R: Repository<A> + Send + Sync,
{
    async fn get_by_id(&self, id: &A::Id) -> Result<A> {
        (**self).get_by_id(id).await
    }

    async fn save(&self, aggregate: &mut A) -> Result<AppendResult> {
        (**self).save(aggregate).await
    }
}
