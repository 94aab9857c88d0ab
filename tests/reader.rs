//! Reader scenarios: import + re-open protocol, iterator batching laws, and
//! raw file streaming.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use checkpoint_transport::test_support::{
    column_family_envelope, write_source_sst, InMemoryTransport, StaticDirectory,
};
use checkpoint_transport::{
    new_checkpoint_reader, CheckpointConfig, CheckpointError, CheckpointFetcher, CheckpointId,
    CheckpointMetaData, CheckpointReader, KeyRange, KeyValue, NodeId, RangeReader,
};

const SOURCE: NodeId = NodeId::new(3);

fn range(begin: &[u8], end: &[u8]) -> KeyRange {
    KeyRange::new(begin.to_vec(), end.to_vec())
}

/// Fetches the standard two-file checkpoint {a: 1, b: 2} ∪ {m: 9} and hands
/// back the updated envelope plus the target directory.
async fn fetched_checkpoint() -> (TempDir, CheckpointMetaData) {
    let source_dir = TempDir::new().unwrap();
    let f1 = write_source_sst(source_dir.path(), "/000001.sst", &[(b"a", b"1"), (b"b", b"2")]);
    let f2 = write_source_sst(source_dir.path(), "/000002.sst", &[(b"m", b"9")]);

    let transport = InMemoryTransport::new();
    transport.add_file_from_disk("000001.sst", &source_dir.path().join("000001.sst"));
    transport.add_file_from_disk("000002.sst", &source_dir.path().join("000002.sst"));
    let directory = StaticDirectory::new();
    directory.insert(SOURCE, transport);

    let envelope = column_family_envelope(
        CheckpointId::new(1, 2),
        SOURCE,
        vec![range(b"a", b"z")],
        vec![f1, f2],
    );
    let fetcher = CheckpointFetcher::new(directory, CheckpointConfig::default());
    let target_dir = TempDir::new().unwrap();
    let fetched = fetcher
        .fetch(envelope, target_dir.path(), None)
        .await
        .unwrap();
    (target_dir, fetched)
}

async fn open_range_reader(checkpoint: &CheckpointMetaData) -> RangeReader {
    let mut reader = new_checkpoint_reader(checkpoint, true, &CheckpointConfig::default());
    reader.init("").await.unwrap();
    match reader {
        CheckpointReader::Ranges(reader) => reader,
        CheckpointReader::File(_) => panic!("expected a range reader"),
    }
}

/// Drains an iterator with the given per-batch limits until end of stream.
async fn drain(
    reader: &RangeReader,
    range: KeyRange,
    row_limit: usize,
    byte_limit: usize,
) -> Vec<(Vec<u8>, Vec<u8>)> {
    let iter = reader.get_iterator(range).unwrap();
    let mut out = Vec::new();
    loop {
        match iter.next_batch(row_limit, byte_limit).await {
            Ok(batch) => {
                assert!(!batch.is_empty(), "empty success batch is forbidden");
                out.extend(batch.into_iter().map(|kv| (kv.key, kv.value)));
            }
            Err(err) if err.is_end_of_stream() => break,
            Err(err) => panic!("unexpected iterator error: {err}"),
        }
    }
    out
}

fn pairs(raw: &[(&[u8], &[u8])]) -> Vec<(Vec<u8>, Vec<u8>)> {
    raw.iter().map(|(k, v)| (k.to_vec(), v.to_vec())).collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn full_range_yields_union_of_files() {
    let (_target, checkpoint) = fetched_checkpoint().await;
    let reader = open_range_reader(&checkpoint).await;

    let got = drain(&reader, range(b"a", b"z"), 1 << 10, 1 << 20).await;
    assert_eq!(got, pairs(&[(b"a", b"1"), (b"b", b"2"), (b"m", b"9")]));

    reader.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn iteration_respects_range_bounds() {
    let (_target, checkpoint) = fetched_checkpoint().await;
    let reader = open_range_reader(&checkpoint).await;

    let got = drain(&reader, range(b"b", b"n"), 1 << 10, 1 << 20).await;
    assert_eq!(got, pairs(&[(b"b", b"2"), (b"m", b"9")]));

    let iter = reader.get_iterator(range(b"x", b"z")).unwrap();
    let err = iter.next_batch(1 << 10, 1 << 20).await.unwrap_err();
    assert!(err.is_end_of_stream());

    drop(iter);
    reader.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn batch_limits_do_not_change_the_result() {
    let (_target, checkpoint) = fetched_checkpoint().await;
    let reader = open_range_reader(&checkpoint).await;

    let unlimited = drain(&reader, range(b"a", b"z"), usize::MAX, usize::MAX).await;
    let row_limited = drain(&reader, range(b"a", b"z"), 1, usize::MAX).await;
    // A 1-byte budget still emits one pair per batch.
    let byte_limited = drain(&reader, range(b"a", b"z"), usize::MAX, 1).await;

    let as_map = |pairs: &[(Vec<u8>, Vec<u8>)]| -> BTreeMap<Vec<u8>, Vec<u8>> {
        pairs.iter().cloned().collect()
    };
    assert_eq!(as_map(&unlimited), as_map(&row_limited));
    assert_eq!(as_map(&unlimited), as_map(&byte_limited));
    assert_eq!(unlimited.len(), 3);

    reader.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn zero_limits_yield_an_empty_batch_immediately() {
    let (_target, checkpoint) = fetched_checkpoint().await;
    let reader = open_range_reader(&checkpoint).await;

    let iter = reader.get_iterator(range(b"a", b"z")).unwrap();
    assert_eq!(iter.next_batch(0, 1 << 20).await.unwrap(), Vec::<KeyValue>::new());
    assert_eq!(iter.next_batch(1 << 10, 0).await.unwrap(), Vec::<KeyValue>::new());

    // The zero-limit calls consumed nothing.
    let batch = iter.next_batch(1 << 10, 1 << 20).await.unwrap();
    assert_eq!(batch.len(), 3);

    drop(iter);
    reader.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_range_reports_end_of_stream() {
    let (_target, checkpoint) = fetched_checkpoint().await;
    let reader = open_range_reader(&checkpoint).await;

    let iter = reader.get_iterator(range(b"g", b"g")).unwrap();
    let err = iter.next_batch(1 << 10, 1 << 20).await.unwrap_err();
    assert!(err.is_end_of_stream());

    drop(iter);
    reader.close().await.unwrap();
}

fn reader_dir_listing(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[tokio::test(flavor = "multi_thread")]
async fn reopening_the_same_checkpoint_is_idempotent_on_disk() {
    let (target, checkpoint) = fetched_checkpoint().await;
    let reader_dir = target.path().join("reader");

    let reader = open_range_reader(&checkpoint).await;
    reader.close().await.unwrap();
    let first_listing = reader_dir_listing(&reader_dir);
    assert!(!first_listing.is_empty());

    // The second open re-opens read-only instead of importing again.
    let reader = open_range_reader(&checkpoint).await;
    let got = drain(&reader, range(b"a", b"z"), 1 << 10, 1 << 20).await;
    assert_eq!(got.len(), 3);
    reader.close().await.unwrap();

    assert_eq!(reader_dir_listing(&reader_dir), first_listing);
}

#[tokio::test(flavor = "multi_thread")]
async fn in_use_tracks_live_iterators() {
    let (_target, checkpoint) = fetched_checkpoint().await;
    let reader = open_range_reader(&checkpoint).await;

    assert!(!reader.in_use());
    let iter = reader.get_iterator(range(b"a", b"z")).unwrap();
    assert!(reader.in_use());
    let second = reader.get_iterator(range(b"a", b"m")).unwrap();
    assert!(reader.in_use());
    drop(iter);
    assert!(reader.in_use());
    drop(second);
    assert!(!reader.in_use());

    reader.close().await.unwrap();
    // Close is idempotent.
    reader.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn init_is_memoized_across_concurrent_callers() {
    let (target, checkpoint) = fetched_checkpoint().await;
    let reader = Arc::new(match new_checkpoint_reader(
        &checkpoint,
        true,
        &CheckpointConfig::default(),
    ) {
        CheckpointReader::Ranges(reader) => reader,
        CheckpointReader::File(_) => panic!("expected a range reader"),
    });

    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let reader = Arc::clone(&reader);
            tokio::spawn(async move { reader.init("").await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert!(target.path().join("reader").exists());
    reader.close().await.unwrap();
}

#[tokio::test]
async fn non_column_family_checkpoint_cannot_be_opened() {
    let envelope = checkpoint_transport::test_support::key_values_envelope(
        CheckpointId::new(5, 5),
        SOURCE,
        vec![range(b"a", b"z")],
        vec![],
    );
    let mut reader = new_checkpoint_reader(&envelope, true, &CheckpointConfig::default());
    let err = reader.init("").await.unwrap_err();
    assert!(matches!(err, CheckpointError::NotImplemented(_)));
    reader.close().await.unwrap();
}

#[tokio::test]
async fn file_mode_streams_the_exact_file_bytes() {
    let (target, checkpoint) = fetched_checkpoint().await;

    // A column-family checkpoint read as raw files gets the chunk reader.
    let mut reader = new_checkpoint_reader(&checkpoint, false, &CheckpointConfig::default());
    reader.init("000001.sst").await.unwrap();
    let file_reader = reader.as_file_mut().unwrap();

    let mut streamed = Vec::new();
    loop {
        match file_reader.next_chunk(11).await {
            Ok(chunk) => {
                assert!(!chunk.is_empty());
                assert!(chunk.len() <= 11);
                streamed.extend_from_slice(&chunk);
            }
            Err(err) if err.is_end_of_stream() => break,
            Err(err) => panic!("unexpected chunk error: {err}"),
        }
    }

    let on_disk = std::fs::read(target.path().join("000001.sst")).unwrap();
    assert_eq!(streamed, on_disk);
    reader.close().await.unwrap();
}

#[tokio::test]
async fn file_mode_rejects_unknown_file_names() {
    let (_target, checkpoint) = fetched_checkpoint().await;
    let mut reader = new_checkpoint_reader(&checkpoint, false, &CheckpointConfig::default());
    let err = reader.init("999999.sst").await.unwrap_err();
    assert!(matches!(err, CheckpointError::CheckpointNotFound(_)));
}
