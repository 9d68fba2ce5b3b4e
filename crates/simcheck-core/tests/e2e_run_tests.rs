use std::collections::HashMap;

use simcheck_core::blobstore::{BlobStore, FsBlobStore, MemoryBlobStore};
use simcheck_core::ingest::ingest_directory;
use simcheck_core::storage::models::{RunStage, RunStatus};
use simcheck_core::storage::Database;
use simcheck_core::{Error, RunConfig, RunEngine, SilentReporter};

const PROGRAM: &str = r#"
fn gcd(a, b) {
    while (b != 0) {
        let t = b;
        b = a % b;
        a = t;
    }
    return a;
}

fn lcm(a, b) {
    return a / gcd(a, b) * b;
}
"#;

const OTHER_PROGRAM: &str = r#"
class Stack {
    push(item) {
        this.items[this.top] = item;
        this.top = this.top + 1;
    }
    pop() {
        this.top = this.top - 1;
        return this.items[this.top];
    }
}
"#;

/// Seed a dataset directly through the storage layer.
/// Entries are (student_label, path, language, bytes).
fn seed_dataset(
    db: &Database,
    blobs: &dyn BlobStore,
    entries: &[(&str, &str, &str, &[u8])],
) -> i64 {
    let collection_id = db.find_or_create_collection("owner-test", "class").unwrap();
    let dataset_id = db.create_dataset(collection_id, "hw1").unwrap();

    let mut submissions: HashMap<String, i64> = HashMap::new();
    for (student, path, language, bytes) in entries {
        let submission_id = *submissions
            .entry(student.to_string())
            .or_insert_with(|| db.create_submission(dataset_id, student).unwrap());
        let content_hash = blake3::hash(bytes).to_hex().to_string();
        let storage_key = format!("blobs/{content_hash}");
        blobs.put(&storage_key, bytes).unwrap();
        db.create_file(
            submission_id,
            path,
            language,
            bytes.len() as i64,
            &content_hash,
            &storage_key,
        )
        .unwrap();
    }
    dataset_id
}

#[test]
fn three_identical_files_produce_all_pairs_at_score_one() {
    let db = Database::open_in_memory().unwrap();
    let blobs = MemoryBlobStore::new();
    let dataset_id = seed_dataset(
        &db,
        &blobs,
        &[
            ("alice", "main.rs", "rust", PROGRAM.as_bytes()),
            ("bob", "main.rs", "rust", PROGRAM.as_bytes()),
            ("carol", "main.rs", "rust", PROGRAM.as_bytes()),
        ],
    );

    let engine = RunEngine::new(&db, &blobs);
    let run_id = engine.submit(dataset_id, &RunConfig::default()).unwrap();
    let outcome = engine.execute(run_id, &SilentReporter).unwrap();

    assert_eq!(outcome.files_total, 3);
    assert_eq!(outcome.files_skipped, 0);
    assert_eq!(outcome.candidate_pairs, 3, "all three pairwise pairs");
    assert_eq!(outcome.pairs_compared, 3);

    let run = db.get_run(run_id).unwrap();
    assert_eq!(run.status, RunStatus::Done);
    assert_eq!(run.stage, RunStage::Report);
    assert_eq!(run.progress_pct, 100);
    assert!(run.started_at.is_some());
    assert!(run.finished_at.is_some());
    assert!(run.error_message.is_none());

    let pairs = db.get_candidate_pairs(run_id).unwrap();
    assert_eq!(pairs.len(), 3);
    for pair in &pairs {
        assert!(pair.file_a_id < pair.file_b_id);
        assert!((pair.fingerprint_score - 1.0).abs() < f64::EPSILON);
    }

    let results = db.get_pair_results(run_id).unwrap();
    assert_eq!(results.len(), 3);
    for result in &results {
        assert!((result.fingerprint_score - 1.0).abs() < f64::EPSILON);
        assert!((result.ast_score - 1.0).abs() < f64::EPSILON);
        assert!((result.final_score - 1.0).abs() < f64::EPSILON);
    }

    // Evidence explains each pair.
    for pair in &pairs {
        let evidence = db
            .get_match_evidence(run_id, pair.file_a_id, pair.file_b_id)
            .unwrap();
        assert!(!evidence.is_empty());
    }

    // The REPORT stage produced a stored artifact.
    let report = db.get_run_report(run_id).unwrap().unwrap();
    let key = report.csv_storage_key.unwrap();
    let csv = String::from_utf8(blobs.get(&key).unwrap()).unwrap();
    assert_eq!(csv.lines().count(), 4, "header plus one line per pair");
}

#[test]
fn evidence_ranges_stay_within_file_sizes() {
    let db = Database::open_in_memory().unwrap();
    let blobs = MemoryBlobStore::new();
    let dataset_id = seed_dataset(
        &db,
        &blobs,
        &[
            ("alice", "main.rs", "rust", PROGRAM.as_bytes()),
            ("bob", "main.rs", "rust", PROGRAM.as_bytes()),
        ],
    );

    let engine = RunEngine::new(&db, &blobs);
    let run_id = engine.submit(dataset_id, &RunConfig::default()).unwrap();
    engine.execute(run_id, &SilentReporter).unwrap();

    let files = db.get_dataset_files(dataset_id).unwrap();
    let sizes: HashMap<i64, i64> = files.iter().map(|f| (f.id, f.size_bytes)).collect();
    let pairs = db.get_candidate_pairs(run_id).unwrap();
    for pair in &pairs {
        let evidence = db
            .get_match_evidence(run_id, pair.file_a_id, pair.file_b_id)
            .unwrap();
        for row in evidence {
            assert!(row.a_start < row.a_end);
            assert!(row.b_start < row.b_end);
            assert!(row.a_end <= sizes[&pair.file_a_id]);
            assert!(row.b_end <= sizes[&pair.file_b_id]);
            assert!(row.weight > 0.0);
        }
    }
}

#[test]
fn renamed_copy_is_still_flagged_at_full_score() {
    let renamed = PROGRAM
        .replace("gcd", "euclid")
        .replace("lcm", "common")
        .replace('a', "x")
        .replace('b', "y");

    let db = Database::open_in_memory().unwrap();
    let blobs = MemoryBlobStore::new();
    let dataset_id = seed_dataset(
        &db,
        &blobs,
        &[
            ("alice", "main.rs", "rust", PROGRAM.as_bytes()),
            ("bob", "main.rs", "rust", renamed.as_bytes()),
        ],
    );

    let engine = RunEngine::new(&db, &blobs);
    let run_id = engine.submit(dataset_id, &RunConfig::default()).unwrap();
    engine.execute(run_id, &SilentReporter).unwrap();

    let results = db.get_pair_results(run_id).unwrap();
    assert_eq!(results.len(), 1);
    assert!((results[0].final_score - 1.0).abs() < f64::EPSILON);
}

#[test]
fn unrelated_submissions_score_low() {
    let db = Database::open_in_memory().unwrap();
    let blobs = MemoryBlobStore::new();
    let dataset_id = seed_dataset(
        &db,
        &blobs,
        &[
            ("alice", "main.rs", "rust", PROGRAM.as_bytes()),
            ("bob", "main.js", "javascript", OTHER_PROGRAM.as_bytes()),
        ],
    );

    let engine = RunEngine::new(&db, &blobs);
    let run_id = engine.submit(dataset_id, &RunConfig::default()).unwrap();
    engine.execute(run_id, &SilentReporter).unwrap();

    let run = db.get_run(run_id).unwrap();
    assert_eq!(run.status, RunStatus::Done);
    for result in db.get_pair_results(run_id).unwrap() {
        assert!(
            result.final_score < 0.5,
            "unrelated files scored {}",
            result.final_score
        );
    }
}

#[test]
fn lenient_run_skips_undecodable_file_and_completes() {
    let db = Database::open_in_memory().unwrap();
    let blobs = MemoryBlobStore::new();
    let dataset_id = seed_dataset(
        &db,
        &blobs,
        &[
            ("alice", "main.rs", "rust", PROGRAM.as_bytes()),
            ("bob", "main.rs", "rust", PROGRAM.as_bytes()),
            ("mallory", "garbled.rs", "rust", &[0x66, 0x6e, 0xff, 0xfe]),
        ],
    );

    let engine = RunEngine::new(&db, &blobs);
    let run_id = engine.submit(dataset_id, &RunConfig::default()).unwrap();
    let outcome = engine.execute(run_id, &SilentReporter).unwrap();

    assert_eq!(outcome.files_skipped, 1);

    let run = db.get_run(run_id).unwrap();
    assert_eq!(run.status, RunStatus::Done);
    assert!(run.error_message.is_none());

    // The undecodable file is excluded from every downstream stage.
    let files = db.get_dataset_files(dataset_id).unwrap();
    let garbled_id = files.iter().find(|f| f.path == "garbled.rs").unwrap().id;
    for pair in db.get_candidate_pairs(run_id).unwrap() {
        assert_ne!(pair.file_a_id, garbled_id);
        assert_ne!(pair.file_b_id, garbled_id);
    }
    assert_eq!(db.get_pair_results(run_id).unwrap().len(), 1);
}

#[test]
fn strict_run_fails_naming_the_offending_file() {
    let db = Database::open_in_memory().unwrap();
    let blobs = MemoryBlobStore::new();
    let dataset_id = seed_dataset(
        &db,
        &blobs,
        &[
            ("alice", "main.rs", "rust", PROGRAM.as_bytes()),
            ("mallory", "garbled.rs", "rust", &[0x66, 0x6e, 0xff, 0xfe]),
        ],
    );

    let engine = RunEngine::new(&db, &blobs);
    let config = RunConfig {
        strict: true,
        ..RunConfig::default()
    };
    let run_id = engine.submit(dataset_id, &config).unwrap();
    let err = engine.execute(run_id, &SilentReporter).unwrap_err();
    assert!(err.to_string().contains("garbled.rs"));

    let run = db.get_run(run_id).unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.stage, RunStage::Tokens, "failure happened in TOKENS");
    assert!(run.finished_at.is_some());
    let message = run.error_message.unwrap();
    assert!(message.contains("garbled.rs"), "got: {message}");
}

#[test]
fn unsupported_language_is_a_per_file_skip() {
    let db = Database::open_in_memory().unwrap();
    let blobs = MemoryBlobStore::new();
    let dataset_id = seed_dataset(
        &db,
        &blobs,
        &[
            ("alice", "main.rs", "rust", PROGRAM.as_bytes()),
            ("bob", "main.rs", "rust", PROGRAM.as_bytes()),
            ("dave", "legacy.pas", "pascal", b"begin writeln('x') end."),
        ],
    );

    let engine = RunEngine::new(&db, &blobs);
    let run_id = engine.submit(dataset_id, &RunConfig::default()).unwrap();
    let outcome = engine.execute(run_id, &SilentReporter).unwrap();

    assert_eq!(outcome.files_skipped, 1);
    assert_eq!(db.get_run(run_id).unwrap().status, RunStatus::Done);
}

#[test]
fn all_files_failing_to_tokenize_is_fatal() {
    let db = Database::open_in_memory().unwrap();
    let blobs = MemoryBlobStore::new();
    let dataset_id = seed_dataset(
        &db,
        &blobs,
        &[
            ("alice", "a.pas", "pascal", b"program a;"),
            ("bob", "b.pas", "pascal", b"program b;"),
        ],
    );

    let engine = RunEngine::new(&db, &blobs);
    let run_id = engine.submit(dataset_id, &RunConfig::default()).unwrap();
    let err = engine.execute(run_id, &SilentReporter).unwrap_err();
    assert!(err.to_string().contains("failed to tokenize"));

    let run = db.get_run(run_id).unwrap();
    assert_eq!(run.status, RunStatus::Failed);
}

#[test]
fn pair_with_unbalanced_braces_is_skipped_leniently() {
    // Shares enough of PROGRAM to become a candidate, but the dangling
    // opening brace fails structural parsing for every pair touching it.
    let broken = format!("{PROGRAM}\nfn broken(z) {{ return z;\n");

    let db = Database::open_in_memory().unwrap();
    let blobs = MemoryBlobStore::new();
    let dataset_id = seed_dataset(
        &db,
        &blobs,
        &[
            ("alice", "main.rs", "rust", PROGRAM.as_bytes()),
            ("bob", "main.rs", "rust", broken.as_bytes()),
        ],
    );

    let engine = RunEngine::new(&db, &blobs);
    let run_id = engine.submit(dataset_id, &RunConfig::default()).unwrap();
    let outcome = engine.execute(run_id, &SilentReporter).unwrap();

    assert_eq!(outcome.candidate_pairs, 1);
    assert_eq!(outcome.pairs_skipped, 1);
    assert_eq!(outcome.pairs_compared, 0);

    let run = db.get_run(run_id).unwrap();
    assert_eq!(run.status, RunStatus::Done);
    assert!(db.get_pair_results(run_id).unwrap().is_empty());
}

#[test]
fn strict_run_fails_naming_the_offending_pair() {
    let broken = format!("{PROGRAM}\nfn broken(z) {{ return z;\n");

    let db = Database::open_in_memory().unwrap();
    let blobs = MemoryBlobStore::new();
    let dataset_id = seed_dataset(
        &db,
        &blobs,
        &[
            ("alice", "main.rs", "rust", PROGRAM.as_bytes()),
            ("bob", "main.rs", "rust", broken.as_bytes()),
        ],
    );

    let engine = RunEngine::new(&db, &blobs);
    let config = RunConfig {
        strict: true,
        ..RunConfig::default()
    };
    let run_id = engine.submit(dataset_id, &config).unwrap();
    let err = engine.execute(run_id, &SilentReporter).unwrap_err();
    assert!(err.to_string().contains("pair"), "got: {err}");

    let run = db.get_run(run_id).unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.stage, RunStage::Ast);
}

#[test]
fn boilerplate_posting_lists_over_the_cap_produce_no_pairs() {
    let db = Database::open_in_memory().unwrap();
    let blobs = MemoryBlobStore::new();
    // Four identical submissions: every fingerprint's posting list has
    // length 4, over the cap of 3, so candidate generation drops them all.
    let dataset_id = seed_dataset(
        &db,
        &blobs,
        &[
            ("a", "main.rs", "rust", PROGRAM.as_bytes()),
            ("b", "main.rs", "rust", PROGRAM.as_bytes()),
            ("c", "main.rs", "rust", PROGRAM.as_bytes()),
            ("d", "main.rs", "rust", PROGRAM.as_bytes()),
        ],
    );

    let engine = RunEngine::new(&db, &blobs);
    let config = RunConfig {
        max_postings: 3,
        ..RunConfig::default()
    };
    let run_id = engine.submit(dataset_id, &config).unwrap();
    let outcome = engine.execute(run_id, &SilentReporter).unwrap();

    assert_eq!(outcome.candidate_pairs, 0);
    assert!(outcome.postings_dropped > 0);
    assert_eq!(db.get_run(run_id).unwrap().status, RunStatus::Done);
    assert!(db.get_pair_results(run_id).unwrap().is_empty());
}

#[test]
fn empty_dataset_completes_with_no_results() {
    let db = Database::open_in_memory().unwrap();
    let blobs = MemoryBlobStore::new();
    let dataset_id = seed_dataset(&db, &blobs, &[]);

    let engine = RunEngine::new(&db, &blobs);
    let run_id = engine.submit(dataset_id, &RunConfig::default()).unwrap();
    let outcome = engine.execute(run_id, &SilentReporter).unwrap();

    assert_eq!(outcome.files_total, 0);
    assert_eq!(outcome.candidate_pairs, 0);

    let run = db.get_run(run_id).unwrap();
    assert_eq!(run.status, RunStatus::Done);
    assert_eq!(run.progress_pct, 100);

    let report = db.get_run_report(run_id).unwrap().unwrap();
    let csv = blobs.get(&report.csv_storage_key.unwrap()).unwrap();
    assert_eq!(String::from_utf8(csv).unwrap().lines().count(), 1);
}

#[test]
fn invalid_configuration_fails_before_any_stage() {
    let db = Database::open_in_memory().unwrap();
    let blobs = MemoryBlobStore::new();
    let dataset_id = seed_dataset(
        &db,
        &blobs,
        &[("alice", "main.rs", "rust", PROGRAM.as_bytes())],
    );

    let run_id = db
        .create_run(dataset_id, r#"{"k": 0, "w": 4}"#)
        .unwrap();

    let engine = RunEngine::new(&db, &blobs);
    let err = engine.execute(run_id, &SilentReporter).unwrap_err();
    assert!(matches!(err, Error::ConfigurationInvalid(_)));

    let run = db.get_run(run_id).unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.stage, RunStage::Ingest);
    assert!(run.started_at.is_none(), "run never started processing");
}

#[test]
fn cancelled_run_is_marked_failed() {
    let db = Database::open_in_memory().unwrap();
    let blobs = MemoryBlobStore::new();
    let dataset_id = seed_dataset(
        &db,
        &blobs,
        &[("alice", "main.rs", "rust", PROGRAM.as_bytes())],
    );

    let engine = RunEngine::new(&db, &blobs);
    let run_id = engine.submit(dataset_id, &RunConfig::default()).unwrap();
    engine
        .cancel_token()
        .store(true, std::sync::atomic::Ordering::Relaxed);

    let err = engine.execute(run_id, &SilentReporter).unwrap_err();
    assert!(matches!(err, Error::Cancelled));

    let run = db.get_run(run_id).unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error_message.unwrap(), "run cancelled");
}

#[test]
fn only_queued_runs_can_execute() {
    let db = Database::open_in_memory().unwrap();
    let blobs = MemoryBlobStore::new();
    let dataset_id = seed_dataset(
        &db,
        &blobs,
        &[
            ("alice", "main.rs", "rust", PROGRAM.as_bytes()),
            ("bob", "main.rs", "rust", PROGRAM.as_bytes()),
        ],
    );

    let engine = RunEngine::new(&db, &blobs);
    let run_id = engine.submit(dataset_id, &RunConfig::default()).unwrap();
    engine.execute(run_id, &SilentReporter).unwrap();

    let err = engine.execute(run_id, &SilentReporter).unwrap_err();
    assert!(matches!(err, Error::InvalidTransition(_)));
    assert_eq!(db.get_run(run_id).unwrap().status, RunStatus::Done);
}

#[test]
fn identical_content_reuses_fingerprint_rows_deterministically() {
    let db = Database::open_in_memory().unwrap();
    let blobs = MemoryBlobStore::new();
    let dataset_id = seed_dataset(
        &db,
        &blobs,
        &[
            ("alice", "main.rs", "rust", PROGRAM.as_bytes()),
            ("bob", "main.rs", "rust", PROGRAM.as_bytes()),
        ],
    );

    let engine = RunEngine::new(&db, &blobs);
    let run_id = engine.submit(dataset_id, &RunConfig::default()).unwrap();
    engine.execute(run_id, &SilentReporter).unwrap();

    let fingerprints = db.get_file_fingerprints(run_id).unwrap();
    assert_eq!(fingerprints.len(), 2);
    assert_eq!(fingerprints[0].k, 5);
    assert_eq!(fingerprints[0].w, 4);
    assert_eq!(fingerprints[0].algo_version, "winnow-v1");
    assert!(fingerprints[0].fingerprint_count > 0);
    // Same bytes, same parameters: byte-identical blobs.
    assert_eq!(
        fingerprints[0].fingerprint_blob,
        fingerprints[1].fingerprint_blob
    );

    // A second run over the same dataset yields the same blobs again.
    let run2 = engine.submit(dataset_id, &RunConfig::default()).unwrap();
    engine.execute(run2, &SilentReporter).unwrap();
    let again = db.get_file_fingerprints(run2).unwrap();
    assert_eq!(again[0].fingerprint_blob, fingerprints[0].fingerprint_blob);
}

#[test]
fn ingested_directory_runs_end_to_end() {
    let tree = tempfile::tempdir().unwrap();
    let blob_dir = tempfile::tempdir().unwrap();
    for (student, content) in [("alice", PROGRAM), ("bob", PROGRAM), ("carol", OTHER_PROGRAM)] {
        let dir = tree.path().join(student);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("main.rs"), content).unwrap();
    }

    let db = Database::open_in_memory().unwrap();
    let blobs = FsBlobStore::new(blob_dir.path());
    let (dataset_id, summary) =
        ingest_directory(&db, &blobs, "owner-test", "class", "hw1", tree.path()).unwrap();
    assert_eq!(summary.submissions, 3);
    assert_eq!(summary.files, 3);

    let engine = RunEngine::new(&db, &blobs);
    let run_id = engine.submit(dataset_id, &RunConfig::default()).unwrap();
    let outcome = engine.execute(run_id, &SilentReporter).unwrap();

    assert_eq!(db.get_run(run_id).unwrap().status, RunStatus::Done);
    assert!(outcome.candidate_pairs >= 1);

    let results = db.get_pair_results(run_id).unwrap();
    assert!(!results.is_empty());
    // alice/bob are identical and must rank first.
    assert!((results[0].final_score - 1.0).abs() < f64::EPSILON);
}
