use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::blobstore::BlobStore;
use crate::error::Error;
use crate::storage::Database;

#[derive(Debug, Default, Clone, Copy)]
pub struct IngestSummary {
    pub submissions: usize,
    pub files: usize,
    pub bytes: u64,
    pub skipped: usize,
}

fn language_for_extension(ext: &str) -> Option<&'static str> {
    Some(match ext.to_ascii_lowercase().as_str() {
        "c" => "c",
        "h" => "h",
        "cc" | "cpp" | "cxx" => "cpp",
        "hpp" => "hpp",
        "cs" => "csharp",
        "dart" => "dart",
        "go" => "go",
        "java" => "java",
        "js" | "jsx" => "javascript",
        "kt" | "kts" => "kotlin",
        "php" => "php",
        "rs" => "rust",
        "scala" => "scala",
        "swift" => "swift",
        "ts" | "tsx" => "typescript",
        _ => return None,
    })
}

/// Build a dataset from a directory tree: every first-level subdirectory
/// becomes one submission (student label = directory name), every source
/// file inside it one file row. Bytes are stored content-addressed in the
/// blob store; files with unrecognized extensions are counted and skipped.
pub fn ingest_directory(
    db: &Database,
    blobs: &dyn BlobStore,
    owner_id: &str,
    collection_name: &str,
    dataset_name: &str,
    root: &Path,
) -> Result<(i64, IngestSummary), Error> {
    let collection_id = db.find_or_create_collection(owner_id, collection_name)?;
    let dataset_id = db.create_dataset(collection_id, dataset_name)?;
    info!(
        "Ingesting {} into dataset {} ({})",
        root.display(),
        dataset_id,
        dataset_name
    );

    let mut summary = IngestSummary::default();

    let mut entries: Vec<_> = fs::read_dir(root)?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        if !path.is_dir() {
            warn!(
                "Skipping {}: loose files at the dataset root are not part of any submission",
                path.display()
            );
            summary.skipped += 1;
            continue;
        }
        let student_label = entry.file_name().to_string_lossy().into_owned();
        let submission_id = db.create_submission(dataset_id, &student_label)?;
        summary.submissions += 1;

        for file_entry in WalkDir::new(&path)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let file_path = file_entry.path();
            let language = match file_path
                .extension()
                .and_then(|ext| ext.to_str())
                .and_then(language_for_extension)
            {
                Some(language) => language,
                None => {
                    debug!("Skipping {}: unrecognized extension", file_path.display());
                    summary.skipped += 1;
                    continue;
                }
            };

            let bytes = fs::read(file_path)?;
            let content_hash = blake3::hash(&bytes).to_hex().to_string();
            let storage_key = format!("blobs/{content_hash}");
            if !blobs.contains(&storage_key) {
                blobs.put(&storage_key, &bytes)?;
            }

            let rel_path = file_path
                .strip_prefix(&path)
                .unwrap_or(file_path)
                .to_string_lossy()
                .into_owned();
            db.create_file(
                submission_id,
                &rel_path,
                language,
                bytes.len() as i64,
                &content_hash,
                &storage_key,
            )?;
            summary.files += 1;
            summary.bytes += bytes.len() as u64;
        }
    }

    info!(
        "Ingested {} submissions, {} files, {} bytes ({} skipped)",
        summary.submissions, summary.files, summary.bytes, summary.skipped
    );
    Ok((dataset_id, summary))
}
