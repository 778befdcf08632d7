//! CloudEvent conversion for records handed to external subscribers.
//!
//! Change-notification subsystems observe [`EventRecord`]s outside of a
//! direct stream read. This module provides a lightweight [`CloudEvent`]
//! newtype wrapping a [`cloudevents::Event`] and conversions that preserve
//! the record's identity: the CloudEvent `id` is the event id, the `type` is
//! the record's type tag, the `subject` is the stream id, and the stream
//! position travels as the `sequencenumber` extension. Subscribers decode
//! `data` plus the record's metadata through the same
//! [`TypeResolution`](crate::resolution::TypeResolution) contract the stores
//! use.

use cloudevents::event::{Data, Event as CeEvent, EventBuilder, EventBuilderV10};
use tracing::instrument;
use url::Url;

use crate::{Error, EventRecord, Result};

/// Newtype wrapper around `cloudevents_sdk::Event` so we can legally provide
/// conversion implementations without violating Rust's orphan rules.
#[derive(Debug, Clone)]
pub struct CloudEvent(pub CeEvent);

impl CloudEvent {
    /// Returns the inner [`cloudevents::Event`].
    #[must_use]
    pub fn into_inner(self) -> CeEvent {
        self.0
    }

    /// Builds a [`CloudEvent`] from a record with an explicit [`Url`] source.
    #[instrument(skip(record), fields(record_id = %record.document_id()))]
    pub fn from_record(record: &EventRecord, source: Url) -> Result<Self> {
        let data = serde_json::to_vec(record.payload())
            .map_err(|e| Error::Serialization(format!("failed to serialize payload: {e}")))?;

        let ce = EventBuilderV10::new()
            .id(record.event_id().to_string())
            .ty(record.event_type())
            .source(source)
            .subject(record.stream_id())
            .extension("sequencenumber", record.sequence_number() as i64)
            .data("application/json", Data::from(data))
            .build()
            .map_err(|e| Error::Serialization(format!("failed to build CloudEvent: {e}")))?;

        Ok(Self(ce))
    }
}

impl TryFrom<&EventRecord> for CloudEvent {
    type Error = Error;

    fn try_from(record: &EventRecord) -> Result<Self> {
        let source = Url::parse("urn:annals:event").expect("default URN is valid");
        Self::from_record(record, source)
    }
}
