//! Range-fetch scenarios: materializing key/value streams as local SSTs,
//! resuming over prior progress, and empty ranges.

use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use checkpoint_transport::engine::SstFile;
use checkpoint_transport::test_support::{
    key_values_envelope, InMemoryTransport, StaticDirectory,
};
use checkpoint_transport::{
    key_values_checkpoint, CheckpointConfig, CheckpointFetcher, CheckpointFile, CheckpointId,
    KeyRange, NodeId, SstWriter,
};

const SOURCE: NodeId = NodeId::new(11);

fn range(begin: &[u8], end: &[u8]) -> KeyRange {
    KeyRange::new(begin.to_vec(), end.to_vec())
}

fn checkpoint_id() -> CheckpointId {
    CheckpointId::new(0x42, 0x43)
}

fn source_pairs() -> Vec<(&'static [u8], &'static [u8])> {
    vec![
        (b"apple", b"1"),
        (b"banana", b"2"),
        (b"cherry", b"3"),
        (b"grape", b"4"),
        (b"kiwi", b"5"),
        (b"lemon", b"6"),
    ]
}

fn scripted_source() -> (Arc<InMemoryTransport>, Arc<StaticDirectory>) {
    let transport = InMemoryTransport::new();
    transport.add_pairs(&source_pairs());
    let directory = StaticDirectory::new();
    directory.insert(SOURCE, transport.clone());
    (transport, directory)
}

fn read_sst_pairs(path: &Path) -> Vec<(Vec<u8>, Vec<u8>)> {
    let sst = Arc::new(SstFile::open(path).unwrap());
    let mut iter = sst.iter().unwrap();
    iter.seek_to_first().unwrap();
    let mut out = Vec::new();
    while let Some((key, value)) = iter.current() {
        out.push((key.to_vec(), value.to_vec()));
        iter.advance().unwrap();
    }
    out
}

#[tokio::test]
async fn range_fetch_materializes_exactly_the_streamed_pairs() {
    let (_transport, directory) = scripted_source();
    let fetcher = CheckpointFetcher::new(directory, CheckpointConfig::default());
    let target = TempDir::new().unwrap();

    let envelope = key_values_envelope(checkpoint_id(), SOURCE, vec![range(b"a", b"m")], vec![]);
    let fetched = fetcher.fetch(envelope, target.path(), None).await.unwrap();

    let descriptor = key_values_checkpoint(&fetched).unwrap();
    assert_eq!(descriptor.fetched_files.len(), 1);
    let file = &descriptor.fetched_files[0];
    assert_eq!(file.range, range(b"a", b"m"));

    let expected: Vec<(Vec<u8>, Vec<u8>)> = source_pairs()
        .iter()
        .map(|(k, v)| (k.to_vec(), v.to_vec()))
        .collect();
    assert_eq!(read_sst_pairs(Path::new(&file.path)), expected);

    let expected_bytes: u64 = expected
        .iter()
        .map(|(k, v)| (k.len() + v.len()) as u64)
        .sum();
    assert_eq!(file.size, expected_bytes);
}

#[tokio::test]
async fn partial_progress_fetches_only_the_uncovered_gap() {
    let (transport, directory) = scripted_source();
    let fetcher = CheckpointFetcher::new(directory, CheckpointConfig::default());
    let target = TempDir::new().unwrap();

    // Prior progress: ["a", "g") is already materialized on disk.
    let covered_pairs: Vec<(&[u8], &[u8])> =
        vec![(b"apple", b"1"), (b"banana", b"2"), (b"cherry", b"3")];
    let prior_path = target.path().join("prior.sst");
    let mut writer = SstWriter::new();
    writer.open(&prior_path).unwrap();
    for (key, value) in &covered_pairs {
        writer.write(key, value).unwrap();
    }
    assert!(writer.finish().unwrap());
    let prior = CheckpointFile {
        path: prior_path.to_string_lossy().into_owned(),
        range: range(b"a", b"g"),
        size: covered_pairs
            .iter()
            .map(|(k, v)| (k.len() + v.len()) as u64)
            .sum(),
    };

    let envelope =
        key_values_envelope(checkpoint_id(), SOURCE, vec![range(b"a", b"m")], vec![prior]);
    let fetched = fetcher.fetch(envelope, target.path(), None).await.unwrap();

    // Only the gap was requested from the source.
    assert_eq!(transport.attempts(&range(b"g", b"m").to_string()), 1);
    assert_eq!(transport.attempts(&range(b"a", b"g").to_string()), 0);
    assert_eq!(transport.attempts(&range(b"a", b"m").to_string()), 0);

    let descriptor = key_values_checkpoint(&fetched).unwrap();
    assert_eq!(descriptor.fetched_files.len(), 2);

    // Entries are pairwise disjoint and cover exactly ["a", "m").
    for (i, a) in descriptor.fetched_files.iter().enumerate() {
        for b in descriptor.fetched_files.iter().skip(i + 1) {
            assert!(!a.range.intersects(&b.range));
        }
    }
    let mut ranges: Vec<KeyRange> = descriptor
        .fetched_files
        .iter()
        .map(|file| file.range.clone())
        .collect();
    ranges.sort_by(|a, b| a.begin.cmp(&b.begin));
    assert_eq!(ranges[0], range(b"a", b"g"));
    assert_eq!(ranges[1], range(b"g", b"m"));

    let new_file = descriptor
        .fetched_files
        .iter()
        .find(|file| file.range == range(b"g", b"m"))
        .unwrap();
    assert_eq!(
        read_sst_pairs(Path::new(&new_file.path)),
        vec![
            (b"grape".to_vec(), b"4".to_vec()),
            (b"kiwi".to_vec(), b"5".to_vec()),
            (b"lemon".to_vec(), b"6".to_vec()),
        ]
    );
}

#[tokio::test]
async fn empty_range_produces_no_file_and_no_entry() {
    let (_transport, directory) = scripted_source();
    let fetcher = CheckpointFetcher::new(directory, CheckpointConfig::default());
    let target = TempDir::new().unwrap();

    // No source key lives in ["x", "z").
    let envelope = key_values_envelope(checkpoint_id(), SOURCE, vec![range(b"x", b"z")], vec![]);
    let fetched = fetcher.fetch(envelope, target.path(), None).await.unwrap();

    let descriptor = key_values_checkpoint(&fetched).unwrap();
    assert!(descriptor.fetched_files.is_empty());
    assert!(std::fs::read_dir(target.path()).unwrap().next().is_none());
}

#[tokio::test]
async fn range_fetch_retries_mid_stream_failures() {
    let (transport, directory) = scripted_source();
    transport.fail_first_attempts(&range(b"a", b"m").to_string(), 1);
    let fetcher = CheckpointFetcher::new(directory, CheckpointConfig::default());
    let target = TempDir::new().unwrap();

    let envelope = key_values_envelope(checkpoint_id(), SOURCE, vec![range(b"a", b"m")], vec![]);
    let fetched = fetcher.fetch(envelope, target.path(), None).await.unwrap();

    assert_eq!(transport.attempts(&range(b"a", b"m").to_string()), 2);
    let descriptor = key_values_checkpoint(&fetched).unwrap();
    assert_eq!(descriptor.fetched_files.len(), 1);
    assert_eq!(
        read_sst_pairs(Path::new(&descriptor.fetched_files[0].path)).len(),
        source_pairs().len()
    );
}

#[tokio::test]
async fn progress_is_persisted_once_for_range_fetches() {
    let (_transport, directory) = scripted_source();
    let fetcher = CheckpointFetcher::new(directory, CheckpointConfig::default());
    let target = TempDir::new().unwrap();

    let calls = Arc::new(std::sync::Mutex::new(0u32));
    let sink = Arc::clone(&calls);
    let progress: checkpoint_transport::ProgressCallback = Arc::new(move |_meta| {
        let sink = Arc::clone(&sink);
        Box::pin(async move {
            *sink.lock().unwrap() += 1;
            Ok(())
        })
    });

    let envelope = key_values_envelope(checkpoint_id(), SOURCE, vec![range(b"a", b"m")], vec![]);
    fetcher
        .fetch(envelope, target.path(), Some(progress))
        .await
        .unwrap();
    assert_eq!(*calls.lock().unwrap(), 1);
}
