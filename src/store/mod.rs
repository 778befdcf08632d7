//! The store module contains the implementations of the event store
//! protocol.

use crate::{AppendResult, EventStore, NewEvent, ReadDirection, Result, StreamPosition, StreamState};

/// The protocol implementation over any atomic partitioned document store.
pub mod document;

// The in-memory reference implementation is compiled when the `in-memory`
// feature is enabled (this is the default).
#[cfg(feature = "in-memory")]
/// An in-memory reference event store.
pub mod in_memory;

// The persistent `sled` implementation is compiled when the `sled-storage`
// feature is enabled.
#[cfg(feature = "sled-storage")]
/// A persistent reference event store using `sled`.
pub mod sled;

/// Replays one stream from `source` into `target` with a single
/// `NoStream`-expected append.
///
/// Works across any two implementations of the [`EventStore`] contract and
/// preserves event ids, type tags, payloads, and metadata. A non-empty
/// target stream surfaces as the append's conflict value; an empty source
/// stream is a no-op `Success`.
pub async fn copy_stream(
    source: &dyn EventStore,
    target: &dyn EventStore,
    stream_id: &str,
) -> Result<AppendResult> {
    let events: Vec<NewEvent> = source
        .read_stream(stream_id, ReadDirection::Forward, StreamPosition::Start)
        .await?
        .iter()
        .map(|resolved| NewEvent::from_record(resolved.record()))
        .collect();

    target.append(stream_id, events, StreamState::NoStream).await
}
