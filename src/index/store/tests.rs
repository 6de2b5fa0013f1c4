use super::*;
use chrono::{TimeZone, Utc};
use serde_json::Map;
use tempfile::TempDir;

fn create_test_record(document_id: &str, chunk_idx: usize) -> DocumentRecord {
    DocumentRecord {
        source_type: "uploaded_document".to_string(),
        document_id: document_id.to_string(),
        filename: format!("{}.txt", document_id),
        chunk_idx,
        total_chunks: 3,
        content: format!("[uploaded_document:{}]\n\nchunk {}", document_id, chunk_idx),
        char_count: 120,
        file_type: "txt".to_string(),
        file_size: Some(120),
        uploaded_at: Utc
            .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .expect("valid timestamp"),
        extra: Map::new(),
    }
}

fn unit(values: &[f32]) -> Vec<f32> {
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    values.iter().map(|v| v / norm).collect()
}

fn sample_batch() -> (Vec<Vec<f32>>, Vec<DocumentRecord>) {
    let vectors = vec![
        unit(&[1.0, 0.0, 0.0]),
        unit(&[0.0, 1.0, 0.0]),
        unit(&[0.0, 0.0, 1.0]),
    ];
    let records = (0..3).map(|i| create_test_record("doc_a", i)).collect();
    (vectors, records)
}

fn artifact_paths(temp_dir: &TempDir) -> (PathBuf, PathBuf) {
    (
        temp_dir.path().join("data").join("index.bin"),
        temp_dir.path().join("data").join("metadata.json"),
    )
}

#[test]
fn new_store_is_not_ready() {
    let store = IndexStore::new(IndexConfig::default());
    assert!(!store.is_ready());
    assert_eq!(store.document_count(), 0);
    assert!(store.records().is_empty());
    assert_eq!(store.kind(), None);
}

#[test]
fn build_then_search_returns_added_row_first() {
    let mut store = IndexStore::new(IndexConfig::default());
    let (vectors, records) = sample_batch();
    store
        .build(vectors.clone(), records)
        .expect("build should succeed");

    assert!(store.is_ready());
    assert_eq!(store.kind(), Some(IndexKind::Flat));

    let results = store.search(&vectors[2], 3).expect("search should succeed");
    assert_eq!(results[0].row, Some(2));
    assert!(results.iter().all(|n| n.score <= results[0].score));
}

#[test]
fn build_rejects_mismatched_counts() {
    let mut store = IndexStore::new(IndexConfig::default());
    let (vectors, mut records) = sample_batch();
    records.pop();

    let result = store.build(vectors, records);
    assert!(matches!(result, Err(RagError::Validation(_))));
    assert!(!store.is_ready());
}

#[test]
fn build_rejects_ragged_vectors() {
    let mut store = IndexStore::new(IndexConfig::default());
    let (mut vectors, records) = sample_batch();
    vectors[1] = vec![1.0, 0.0];

    let result = store.build(vectors, records);
    assert!(matches!(result, Err(RagError::Validation(_))));
}

#[test]
fn append_without_index_builds() {
    let mut store = IndexStore::new(IndexConfig::default());
    let (vectors, records) = sample_batch();

    store.append(vectors, records).expect("append should succeed");
    assert!(store.is_ready());
    assert_eq!(store.document_count(), 3);
}

#[test]
fn append_keeps_vectors_and_records_parallel() {
    let mut store = IndexStore::new(IndexConfig::default());
    let (vectors, records) = sample_batch();
    store.build(vectors, records).expect("build should succeed");

    for round in 0..3 {
        let document_id = format!("doc_{}", round);
        let vectors = vec![unit(&[1.0, 1.0, round as f32]), unit(&[round as f32, 1.0, 1.0])];
        let records = vec![
            create_test_record(&document_id, 0),
            create_test_record(&document_id, 1),
        ];
        store.append(vectors, records).expect("append should succeed");
        assert_eq!(store.document_count(), store.records().len());
    }

    assert_eq!(store.document_count(), 9);
    assert_eq!(store.records()[3].document_id, "doc_0");
    assert_eq!(store.records()[8].document_id, "doc_2");
}

#[test]
fn failed_append_leaves_store_untouched() {
    let mut store = IndexStore::new(IndexConfig::default());
    let (vectors, records) = sample_batch();
    store.build(vectors, records).expect("build should succeed");

    let result = store.append(vec![vec![1.0, 0.0]], vec![create_test_record("doc_b", 0)]);
    assert!(matches!(result, Err(RagError::Validation(_))));

    let result = store.append(vec![unit(&[1.0, 0.0, 0.0])], Vec::new());
    assert!(matches!(result, Err(RagError::Validation(_))));

    assert_eq!(store.document_count(), 3);
    assert_eq!(store.records().len(), 3);
}

#[test]
fn appended_row_is_findable() {
    let mut store = IndexStore::new(IndexConfig::default());
    let (vectors, records) = sample_batch();
    store.build(vectors, records).expect("build should succeed");

    let new_vector = unit(&[1.0, 1.0, 1.0]);
    store
        .append(vec![new_vector.clone()], vec![create_test_record("doc_b", 0)])
        .expect("append should succeed");

    let results = store.search(&new_vector, 1).expect("search should succeed");
    assert_eq!(results[0].row, Some(3));
    assert_eq!(
        store.record(3).map(|r| r.document_id.as_str()),
        Some("doc_b")
    );
}

#[test]
fn search_rejects_wrong_dimension() {
    let mut store = IndexStore::new(IndexConfig::default());
    let (vectors, records) = sample_batch();
    store.build(vectors, records).expect("build should succeed");

    let result = store.search(&[1.0, 0.0], 1);
    assert!(matches!(result, Err(RagError::Validation(_))));
}

#[test]
fn search_without_index_fails() {
    let store = IndexStore::new(IndexConfig::default());
    assert!(matches!(store.search(&[1.0], 1), Err(RagError::Index(_))));
}

#[test]
fn large_batches_use_clustered_index() {
    let config = IndexConfig {
        ivf_threshold: 10,
        nlist: 4,
        nprobe: 4,
        ..IndexConfig::default()
    };
    let mut store = IndexStore::new(config);

    let vectors: Vec<Vec<f32>> = (0..40)
        .map(|i| unit(&[(i % 4) as f32 + 0.1, (i % 5) as f32 + 0.1, 1.0]))
        .collect();
    let records = (0..40).map(|i| create_test_record("big", i)).collect();
    store
        .build(vectors.clone(), records)
        .expect("build should succeed");

    assert_eq!(store.kind(), Some(IndexKind::Ivf));
    assert_eq!(store.document_count(), 40);

    // Probing every cluster makes the search exhaustive
    let results = store.search(&vectors[7], 1).expect("search should succeed");
    assert!((results[0].score - 1.0).abs() < 1e-5);
}

#[test]
fn persist_and_restore() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let (index_path, metadata_path) = artifact_paths(&temp_dir);

    let mut store = IndexStore::new(IndexConfig::default());
    let (vectors, records) = sample_batch();
    store
        .build(vectors.clone(), records)
        .expect("build should succeed");
    store
        .persist(&index_path, &metadata_path)
        .expect("persist should succeed");

    let mut restored = IndexStore::new(IndexConfig::default());
    let count = restored
        .restore(&index_path, &metadata_path)
        .expect("restore should succeed");

    assert_eq!(count, 3);
    assert!(restored.is_ready());
    assert_eq!(restored.records(), store.records());

    let results = restored.search(&vectors[1], 1).expect("search should succeed");
    assert_eq!(results[0].row, Some(1));
}

#[test]
fn persist_without_index_fails() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let (index_path, metadata_path) = artifact_paths(&temp_dir);

    let store = IndexStore::new(IndexConfig::default());
    let result = store.persist(&index_path, &metadata_path);
    assert!(matches!(result, Err(RagError::Validation(_))));
    assert!(!index_path.exists());
}

#[test]
fn persist_leaves_no_temp_files() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let (index_path, metadata_path) = artifact_paths(&temp_dir);

    let mut store = IndexStore::new(IndexConfig::default());
    let (vectors, records) = sample_batch();
    store.build(vectors, records).expect("build should succeed");
    store
        .persist(&index_path, &metadata_path)
        .expect("persist should succeed");

    let leftovers: Vec<_> = fs::read_dir(temp_dir.path().join("data"))
        .expect("data dir exists")
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty());
}

#[test]
fn restore_missing_files() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let (index_path, metadata_path) = artifact_paths(&temp_dir);

    let mut store = IndexStore::new(IndexConfig::default());
    let result = store.restore(&index_path, &metadata_path);

    assert!(matches!(result, Err(RestoreError::Missing(_))));
    assert!(!store.is_ready());
}

#[test]
fn restore_corrupted_metadata_resets_store() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let (index_path, metadata_path) = artifact_paths(&temp_dir);

    let mut store = IndexStore::new(IndexConfig::default());
    let (vectors, records) = sample_batch();
    store.build(vectors, records).expect("build should succeed");
    store
        .persist(&index_path, &metadata_path)
        .expect("persist should succeed");

    fs::write(&metadata_path, b"[{\"source_type\": ").expect("should write file");

    // Restoring over a ready store must not leave the old state behind
    let result = store.restore(&index_path, &metadata_path);
    assert!(matches!(
        result,
        Err(RestoreError::Corrupted {
            artifact: "metadata",
            ..
        })
    ));
    assert!(!store.is_ready());
    assert_eq!(store.document_count(), 0);
    assert!(store.records().is_empty());
}

#[test]
fn restore_corrupted_index_blob() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let (index_path, metadata_path) = artifact_paths(&temp_dir);
    fs::create_dir_all(temp_dir.path().join("data")).expect("should create dir");
    fs::write(&index_path, b"not an index").expect("should write file");
    fs::write(&metadata_path, b"[]").expect("should write file");

    let mut store = IndexStore::new(IndexConfig::default());
    let result = store.restore(&index_path, &metadata_path);

    assert!(matches!(
        result,
        Err(RestoreError::Corrupted {
            artifact: "index",
            ..
        })
    ));
    assert!(!store.is_ready());
}

#[test]
fn restore_detects_count_mismatch() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let (index_path, metadata_path) = artifact_paths(&temp_dir);

    let mut store = IndexStore::new(IndexConfig::default());
    let (vectors, records) = sample_batch();
    store.build(vectors, records).expect("build should succeed");
    store
        .persist(&index_path, &metadata_path)
        .expect("persist should succeed");

    let truncated = serde_json::to_vec(&store.records()[..2]).expect("should serialize");
    fs::write(&metadata_path, truncated).expect("should write file");

    let mut restored = IndexStore::new(IndexConfig::default());
    let result = restored.restore(&index_path, &metadata_path);

    assert!(matches!(
        result,
        Err(RestoreError::Inconsistent {
            vectors: 3,
            records: 2
        })
    ));
    assert_eq!(restored.document_count(), 0);
}

#[test]
fn restore_rejects_malformed_clustered_index() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let (index_path, metadata_path) = artifact_paths(&temp_dir);
    fs::create_dir_all(temp_dir.path().join("data")).expect("should create dir");

    // One centroid but no inverted lists: decodes cleanly, would panic on search
    let ivf: IvfIndex = serde_json::from_value(serde_json::json!({
        "dimension": 3,
        "nprobe": 1,
        "centroids": [[1.0, 0.0, 0.0]],
        "lists": [],
        "data": [1.0, 0.0, 0.0]
    }))
    .expect("should deserialize index");
    let envelope = IndexFile {
        magic: INDEX_MAGIC,
        version: INDEX_FORMAT_VERSION,
        index: VectorIndex::Ivf(ivf),
    };
    fs::write(
        &index_path,
        bincode::serialize(&envelope).expect("should encode index"),
    )
    .expect("should write file");
    let records = vec![create_test_record("doc_a", 0)];
    fs::write(
        &metadata_path,
        serde_json::to_vec(&records).expect("should serialize"),
    )
    .expect("should write file");

    let mut store = IndexStore::new(IndexConfig::default());
    let result = store.restore(&index_path, &metadata_path);

    assert!(matches!(
        result,
        Err(RestoreError::Corrupted {
            artifact: "index",
            ..
        })
    ));
    assert!(!store.is_ready());
    assert_eq!(store.document_count(), 0);
    assert!(store.records().is_empty());
}

#[cfg(unix)]
#[test]
fn restore_unreadable_metadata_is_permission_denied() {
    use std::os::unix::fs::PermissionsExt;

    let temp_dir = TempDir::new().expect("should create temp dir");
    let (index_path, metadata_path) = artifact_paths(&temp_dir);

    let mut store = IndexStore::new(IndexConfig::default());
    let (vectors, records) = sample_batch();
    store.build(vectors, records).expect("build should succeed");
    store
        .persist(&index_path, &metadata_path)
        .expect("persist should succeed");

    fs::set_permissions(&metadata_path, fs::Permissions::from_mode(0o000))
        .expect("should change permissions");
    if fs::read(&metadata_path).is_ok() {
        // Running with privileges that bypass file modes
        return;
    }

    let result = store.restore(&index_path, &metadata_path);
    fs::set_permissions(&metadata_path, fs::Permissions::from_mode(0o644))
        .expect("should restore permissions");

    assert!(matches!(result, Err(RestoreError::PermissionDenied(ref path)) if *path == metadata_path));
    assert!(!store.is_ready());
    assert_eq!(store.document_count(), 0);
    assert!(store.records().is_empty());
}

#[test]
fn restore_from_directory_is_unexpected() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let (index_path, metadata_path) = artifact_paths(&temp_dir);

    let mut store = IndexStore::new(IndexConfig::default());
    let (vectors, records) = sample_batch();
    store.build(vectors, records).expect("build should succeed");
    store
        .persist(&index_path, &metadata_path)
        .expect("persist should succeed");

    let directory = temp_dir.path().join("data");
    let result = store.restore(&directory, &metadata_path);

    assert!(matches!(result, Err(RestoreError::Unexpected(_))));
    assert!(!store.is_ready());
    assert_eq!(store.document_count(), 0);
    assert!(store.records().is_empty());
}
