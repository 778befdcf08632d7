//! Integration tests for the concurrency-control state machine over the
//! document-store capability.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::executor::block_on;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::json;

use annals::document::{
    BatchOperation, BatchOutcome, DocumentStore, EventDocument, SortOrder, TransactionalBatch,
};
use annals::store::copy_stream;
use annals::store::document::DocumentEventStore;
use annals::store::in_memory::InMemoryEventStore;
use annals::{
    AppendResult, Error, EventStore, NewEvent, ReadDirection, StreamPosition, StreamState,
    async_trait,
};

/// An in-test document store honoring the capability contract: atomic
/// batches with uniqueness and conditional-read conflicts, ordered range
/// queries, counts, and point reads.
#[derive(Default)]
struct FakeDocumentStore {
    partitions: Mutex<HashMap<String, BTreeMap<u64, EventDocument>>>,
    fail_next_batch: AtomicBool,
    conflict_next_batch: AtomicBool,
}

impl FakeDocumentStore {
    fn fail_next_batch(&self) {
        self.fail_next_batch.store(true, Ordering::SeqCst);
    }

    /// Makes the next batch report a conflict regardless of its contents, as
    /// if a concurrent writer committed between a version lookup and the
    /// write it fed.
    fn conflict_next_batch(&self) {
        self.conflict_next_batch.store(true, Ordering::SeqCst);
    }
}

fn sequence_of(id: &str) -> Option<u64> {
    id.split('@').next()?.parse().ok()
}

#[async_trait]
impl DocumentStore for FakeDocumentStore {
    async fn initialize(&self) -> annals::Result<()> {
        Ok(())
    }

    async fn execute_batch(
        &self,
        partition_key: &str,
        batch: TransactionalBatch,
    ) -> annals::Result<BatchOutcome> {
        if self.fail_next_batch.swap(false, Ordering::SeqCst) {
            return Err(Error::Store("simulated unavailability".into()));
        }
        if self.conflict_next_batch.swap(false, Ordering::SeqCst) {
            return Ok(BatchOutcome::Conflict);
        }

        let mut partitions = self.partitions.lock();
        let partition = partitions.entry(partition_key.to_string()).or_default();

        // Validate every operation before applying any, so the batch either
        // commits completely or leaves the partition untouched.
        for operation in batch.operations() {
            match operation {
                BatchOperation::Create(document) => {
                    if partition.contains_key(&document.record.sequence_number()) {
                        return Ok(BatchOutcome::Conflict);
                    }
                }
                BatchOperation::Read { id } => {
                    let present = sequence_of(id)
                        .is_some_and(|sequence| partition.contains_key(&sequence));
                    if !present {
                        return Ok(BatchOutcome::Conflict);
                    }
                }
            }
        }

        for operation in batch.operations() {
            if let BatchOperation::Create(document) = operation {
                partition.insert(document.record.sequence_number(), document.clone());
            }
        }
        Ok(BatchOutcome::Committed)
    }

    async fn query_events(
        &self,
        partition_key: &str,
        order: SortOrder,
        from_sequence: Option<u64>,
    ) -> annals::Result<Vec<EventDocument>> {
        let partitions = self.partitions.lock();
        let mut documents: Vec<EventDocument> = partitions
            .get(partition_key)
            .map(|partition| {
                partition
                    .values()
                    .filter(|document| match (order, from_sequence) {
                        (_, None) => true,
                        (SortOrder::Ascending, Some(from)) => {
                            document.record.sequence_number() >= from
                        }
                        (SortOrder::Descending, Some(from)) => {
                            document.record.sequence_number() <= from
                        }
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if order == SortOrder::Descending {
            documents.reverse();
        }
        Ok(documents)
    }

    async fn count_events(&self, partition_key: &str) -> annals::Result<u64> {
        let partitions = self.partitions.lock();
        Ok(partitions
            .get(partition_key)
            .map_or(0, |partition| partition.len() as u64))
    }

    async fn read_event(
        &self,
        partition_key: &str,
        id: &str,
    ) -> annals::Result<Option<EventDocument>> {
        let partitions = self.partitions.lock();
        Ok(partitions.get(partition_key).and_then(|partition| {
            partition
                .values()
                .find(|document| document.id == id)
                .cloned()
        }))
    }
}

fn new_store() -> DocumentEventStore<FakeDocumentStore> {
    DocumentEventStore::new(Arc::new(FakeDocumentStore::default()))
}

fn event(event_type: &str) -> NewEvent {
    NewEvent::new(event_type, json!({ "kind": event_type }))
}

fn sequence_numbers(events: &[annals::ResolvedEvent]) -> Vec<u64> {
    events
        .iter()
        .map(|resolved| resolved.record().sequence_number())
        .collect()
}

// -- Append state machine ------------------------------------------------

#[test]
fn no_stream_append_creates_stream_at_version_zero() {
    let store = new_store();

    let result = block_on(store.append(
        "order-1",
        vec![event("Placed"), event("Paid")],
        StreamState::NoStream,
    ))
    .expect("append");
    assert_eq!(result, AppendResult::Success);

    let events = block_on(store.read_stream(
        "order-1",
        ReadDirection::Forward,
        StreamPosition::Start,
    ))
    .expect("read");
    assert_eq!(sequence_numbers(&events), vec![0, 1]);
}

#[test]
fn no_stream_append_to_existing_stream_conflicts() {
    let store = new_store();
    block_on(store.append("order-1", vec![event("Placed")], StreamState::NoStream))
        .expect("initial append");

    let result = block_on(store.append("order-1", vec![event("Paid")], StreamState::NoStream))
        .expect("conflicting append");
    assert_eq!(
        result,
        AppendResult::UnexpectedStreamState(StreamState::NoStream)
    );

    let events = block_on(store.read_stream(
        "order-1",
        ReadDirection::Forward,
        StreamPosition::Start,
    ))
    .expect("read");
    assert_eq!(events.len(), 1, "failed append must not change the stream");
}

#[test]
fn at_version_append_succeeds_only_at_current_version() {
    let store = new_store();
    block_on(store.append("order-1", vec![event("Placed")], StreamState::NoStream))
        .expect("seed");

    let result = block_on(store.append(
        "order-1",
        vec![event("Paid")],
        StreamState::AtVersion(0),
    ))
    .expect("append at current");
    assert_eq!(result, AppendResult::Success);

    let result = block_on(store.append(
        "order-1",
        vec![event("Shipped")],
        StreamState::AtVersion(0),
    ))
    .expect("append at stale version");
    assert_eq!(
        result,
        AppendResult::UnexpectedStreamState(StreamState::AtVersion(0))
    );

    let events = block_on(store.read_stream(
        "order-1",
        ReadDirection::Forward,
        StreamPosition::Start,
    ))
    .expect("read");
    assert_eq!(sequence_numbers(&events), vec![0, 1]);
}

#[test]
fn sequential_at_version_appends_stay_gapless() {
    let store = new_store();

    for (version, name) in [(-1, "A"), (0, "B"), (1, "C")] {
        let result = block_on(store.append(
            "pay-1",
            vec![event(name)],
            StreamState::AtVersion(version),
        ))
        .expect("append");
        assert_eq!(result, AppendResult::Success);
    }

    let events = block_on(store.read_stream(
        "pay-1",
        ReadDirection::Forward,
        StreamPosition::Start,
    ))
    .expect("read");
    assert_eq!(sequence_numbers(&events), vec![0, 1, 2]);

    // A stale append must fail and leave the stream at 3 records.
    let result = block_on(store.append(
        "pay-1",
        vec![event("D")],
        StreamState::AtVersion(0),
    ))
    .expect("stale append");
    assert_eq!(
        result,
        AppendResult::UnexpectedStreamState(StreamState::AtVersion(0))
    );

    let events = block_on(store.read_stream(
        "pay-1",
        ReadDirection::Forward,
        StreamPosition::Start,
    ))
    .expect("read");
    assert_eq!(events.len(), 3);
}

#[test]
fn stream_exists_append_requires_an_existing_stream() {
    let store = new_store();

    let result = block_on(store.append(
        "order-1",
        vec![event("Paid")],
        StreamState::StreamExists,
    ))
    .expect("append to missing stream");
    assert_eq!(
        result,
        AppendResult::UnexpectedStreamState(StreamState::StreamExists)
    );

    block_on(store.append("order-1", vec![event("Placed")], StreamState::NoStream))
        .expect("seed");
    let result = block_on(store.append(
        "order-1",
        vec![event("Paid")],
        StreamState::StreamExists,
    ))
    .expect("append to existing stream");
    assert_eq!(result, AppendResult::Success);
}

#[test]
fn any_append_creates_or_extends() {
    let store = new_store();

    let result = block_on(store.append("order-1", vec![event("Placed")], StreamState::Any))
        .expect("append to missing stream");
    assert_eq!(result, AppendResult::Success);

    let result = block_on(store.append("order-1", vec![event("Paid")], StreamState::Any))
        .expect("append to existing stream");
    assert_eq!(result, AppendResult::Success);

    let events = block_on(store.read_stream(
        "order-1",
        ReadDirection::Forward,
        StreamPosition::Start,
    ))
    .expect("read");
    assert_eq!(sequence_numbers(&events), vec![0, 1]);
}

#[test]
fn empty_append_is_a_no_op() {
    let store = new_store();

    let result = block_on(store.append("order-1", Vec::new(), StreamState::AtVersion(7)))
        .expect("empty append");
    assert_eq!(result, AppendResult::Success);

    let events = block_on(store.read_stream(
        "order-1",
        ReadDirection::Forward,
        StreamPosition::Start,
    ))
    .expect("read");
    assert!(events.is_empty(), "no-op append must not create the stream");
}

#[test]
fn empty_stream_id_is_rejected_before_io() {
    let store = new_store();

    let err = block_on(store.append("", vec![event("Placed")], StreamState::Any))
        .expect_err("empty stream id");
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[test]
fn any_append_losing_the_race_reports_the_resolved_version() {
    let documents = Arc::new(FakeDocumentStore::default());
    let store = DocumentEventStore::new(Arc::clone(&documents));
    block_on(store.append("order-1", vec![event("Placed")], StreamState::NoStream))
        .expect("seed");

    // A concurrent writer commits between the version lookup and the write.
    // The conflict carries the version the write actually used.
    documents.conflict_next_batch();
    let result = block_on(store.append("order-1", vec![event("Paid")], StreamState::Any))
        .expect("racing append");
    assert_eq!(
        result,
        AppendResult::UnexpectedStreamState(StreamState::AtVersion(0))
    );
}

#[test]
fn stream_exists_append_losing_the_race_reports_the_resolved_version() {
    let documents = Arc::new(FakeDocumentStore::default());
    let store = DocumentEventStore::new(Arc::clone(&documents));
    block_on(store.append("order-1", vec![event("Placed")], StreamState::NoStream))
        .expect("seed");

    documents.conflict_next_batch();
    let result = block_on(store.append(
        "order-1",
        vec![event("Paid")],
        StreamState::StreamExists,
    ))
    .expect("racing append");
    assert_eq!(
        result,
        AppendResult::UnexpectedStreamState(StreamState::AtVersion(0))
    );
}

#[test]
fn transport_failures_are_not_conflicts() {
    let documents = Arc::new(FakeDocumentStore::default());
    let store = DocumentEventStore::new(Arc::clone(&documents));

    documents.fail_next_batch();
    let err = block_on(store.append("order-1", vec![event("Placed")], StreamState::NoStream))
        .expect_err("transport failure must propagate");
    assert!(matches!(err, Error::Store(_)));
}

// -- Reads ---------------------------------------------------------------

#[test]
fn backward_read_is_exact_reverse_of_forward() {
    let store = new_store();
    let events: Vec<NewEvent> = ["A", "B", "C", "D"].iter().map(|name| event(name)).collect();
    block_on(store.append("order-1", events, StreamState::NoStream)).expect("seed");

    let forward = block_on(store.read_stream(
        "order-1",
        ReadDirection::Forward,
        StreamPosition::Start,
    ))
    .expect("forward read");
    let backward = block_on(store.read_stream(
        "order-1",
        ReadDirection::Backward,
        StreamPosition::Start,
    ))
    .expect("backward read");

    let mut reversed: Vec<_> = backward
        .iter()
        .map(|resolved| resolved.record().clone())
        .collect();
    reversed.reverse();
    let forward: Vec<_> = forward
        .iter()
        .map(|resolved| resolved.record().clone())
        .collect();
    assert_eq!(forward, reversed);
}

#[test]
fn read_from_a_position_is_inclusive() {
    let store = new_store();
    let events: Vec<NewEvent> = ["A", "B", "C", "D"].iter().map(|name| event(name)).collect();
    block_on(store.append("order-1", events, StreamState::NoStream)).expect("seed");

    let tail = block_on(store.read_stream(
        "order-1",
        ReadDirection::Forward,
        StreamPosition::At(2),
    ))
    .expect("forward from 2");
    assert_eq!(sequence_numbers(&tail), vec![2, 3]);

    let head = block_on(store.read_stream(
        "order-1",
        ReadDirection::Backward,
        StreamPosition::At(1),
    ))
    .expect("backward from 1");
    assert_eq!(sequence_numbers(&head), vec![1, 0]);
}

#[test]
fn reading_an_unknown_stream_yields_an_empty_sequence() {
    let store = new_store();

    let events = block_on(store.read_stream(
        "never-written",
        ReadDirection::Forward,
        StreamPosition::Start,
    ))
    .expect("read");
    assert!(events.is_empty());
}

#[test]
fn point_read_distinguishes_found_missing_and_invalid() {
    let store = new_store();
    block_on(store.append("order-1", vec![event("Placed")], StreamState::NoStream))
        .expect("seed");

    let found = block_on(store.read_stream_event("order-1", 0)).expect("point read");
    assert_eq!(
        found.map(|resolved| resolved.record().sequence_number()),
        Some(0)
    );

    let missing = block_on(store.read_stream_event("order-1", 5)).expect("point read");
    assert!(missing.is_none());

    let err = block_on(store.read_stream_event("order-1", -1))
        .expect_err("negative sequence is a contract violation");
    assert!(matches!(err, Error::InvalidArgument(_)));
}

// -- Cross-store interoperability ----------------------------------------

#[test]
fn copy_stream_reproduces_identical_records_across_store_kinds() {
    let source = InMemoryEventStore::new();
    let target = new_store();

    let events: Vec<NewEvent> = ["A", "B", "C"].iter().map(|name| event(name)).collect();
    block_on(source.append("order-1", events, StreamState::NoStream)).expect("seed source");

    let result = block_on(copy_stream(&source, &target, "order-1")).expect("copy");
    assert_eq!(result, AppendResult::Success);

    let original = block_on(source.read_stream(
        "order-1",
        ReadDirection::Forward,
        StreamPosition::Start,
    ))
    .expect("read source");
    let copied = block_on(target.read_stream(
        "order-1",
        ReadDirection::Forward,
        StreamPosition::Start,
    ))
    .expect("read target");

    let original: Vec<_> = original.iter().map(|r| r.record().clone()).collect();
    let copied: Vec<_> = copied.iter().map(|r| r.record().clone()).collect();
    assert_eq!(original, copied, "event ids, payloads and metadata survive");
}
