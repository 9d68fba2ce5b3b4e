use rusqlite::params;
use tracing::debug;

use super::models::{
    self, CandidatePair, Collection, Dataset, EvidenceKind, FileFingerprint, MatchEvidence,
    PairResult, Run, RunEvent, RunReport, RunStage, RunStatus, SourceFile, Submission,
};
use super::sqlite::Database;
use crate::error::Error;

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// A pair result joined with display names ("student_label/path") for both
/// files, used by the report stage and the CLI.
#[derive(Debug, Clone)]
pub struct PairResultRow {
    pub result: PairResult,
    pub file_a: String,
    pub file_b: String,
}

impl Database {
    // ── Collections / Datasets / Submissions / Files ─────────────

    pub fn find_or_create_collection(&self, owner_id: &str, name: &str) -> Result<i64, Error> {
        let existing = self
            .connection()
            .query_row(
                "SELECT id FROM collections WHERE owner_id = ?1 AND name = ?2",
                params![owner_id, name],
                |row| row.get::<_, i64>(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        if let Some(id) = existing {
            return Ok(id);
        }

        self.connection().execute(
            "INSERT INTO collections (owner_id, name, created_at) VALUES (?1, ?2, ?3)",
            params![owner_id, name, now_rfc3339()],
        )?;
        Ok(self.connection().last_insert_rowid())
    }

    pub fn get_collection(&self, collection_id: i64) -> Result<Collection, Error> {
        let collection = self.connection().query_row(
            "SELECT id, owner_id, name, created_at FROM collections WHERE id = ?1",
            params![collection_id],
            |row| {
                Ok(Collection {
                    id: row.get(0)?,
                    owner_id: row.get(1)?,
                    name: row.get(2)?,
                    created_at: row.get(3)?,
                })
            },
        )?;
        Ok(collection)
    }

    pub fn create_dataset(&self, collection_id: i64, name: &str) -> Result<i64, Error> {
        self.connection().execute(
            "INSERT INTO datasets (collection_id, name, created_at) VALUES (?1, ?2, ?3)",
            params![collection_id, name, now_rfc3339()],
        )?;
        Ok(self.connection().last_insert_rowid())
    }

    pub fn get_dataset(&self, dataset_id: i64) -> Result<Dataset, Error> {
        let dataset = self.connection().query_row(
            "SELECT id, collection_id, name, created_at FROM datasets WHERE id = ?1",
            params![dataset_id],
            |row| {
                Ok(Dataset {
                    id: row.get(0)?,
                    collection_id: row.get(1)?,
                    name: row.get(2)?,
                    created_at: row.get(3)?,
                })
            },
        )?;
        Ok(dataset)
    }

    pub fn create_submission(&self, dataset_id: i64, student_label: &str) -> Result<i64, Error> {
        self.connection().execute(
            "INSERT INTO submissions (dataset_id, student_label, created_at) \
             VALUES (?1, ?2, ?3)",
            params![dataset_id, student_label, now_rfc3339()],
        )?;
        Ok(self.connection().last_insert_rowid())
    }

    pub fn get_submissions(&self, dataset_id: i64) -> Result<Vec<Submission>, Error> {
        let mut stmt = self.connection().prepare(
            "SELECT id, dataset_id, student_label, created_at \
             FROM submissions WHERE dataset_id = ?1 ORDER BY student_label",
        )?;
        let submissions = stmt
            .query_map(params![dataset_id], |row| {
                Ok(Submission {
                    id: row.get(0)?,
                    dataset_id: row.get(1)?,
                    student_label: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(submissions)
    }

    pub fn create_file(
        &self,
        submission_id: i64,
        path: &str,
        language: &str,
        size_bytes: i64,
        content_hash: &str,
        storage_key: &str,
    ) -> Result<i64, Error> {
        self.connection().execute(
            "INSERT INTO files \
             (submission_id, path, language, size_bytes, content_hash, storage_key, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                submission_id,
                path,
                language,
                size_bytes,
                content_hash,
                storage_key,
                now_rfc3339()
            ],
        )?;
        Ok(self.connection().last_insert_rowid())
    }

    /// All files belonging to a dataset, across every submission, in stable
    /// (submission, path) order.
    pub fn get_dataset_files(&self, dataset_id: i64) -> Result<Vec<SourceFile>, Error> {
        let mut stmt = self.connection().prepare(
            "SELECT f.id, f.submission_id, f.path, f.language, f.size_bytes, \
                    f.content_hash, f.storage_key, f.created_at \
             FROM files f \
             JOIN submissions s ON s.id = f.submission_id \
             WHERE s.dataset_id = ?1 \
             ORDER BY s.student_label, f.path",
        )?;
        let files = stmt
            .query_map(params![dataset_id], |row| {
                Ok(SourceFile {
                    id: row.get(0)?,
                    submission_id: row.get(1)?,
                    path: row.get(2)?,
                    language: row.get(3)?,
                    size_bytes: row.get(4)?,
                    content_hash: row.get(5)?,
                    storage_key: row.get(6)?,
                    created_at: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(files)
    }

    // ── Runs ─────────────────────────────────────────────────────

    pub fn create_run(&self, dataset_id: i64, config_json: &str) -> Result<i64, Error> {
        self.connection().execute(
            "INSERT INTO runs (dataset_id, status, stage, progress_pct, config_json, created_at) \
             VALUES (?1, 'QUEUED', 'INGEST', 0, ?2, ?3)",
            params![dataset_id, config_json, now_rfc3339()],
        )?;
        let id = self.connection().last_insert_rowid();
        debug!("Created run {} for dataset {}", id, dataset_id);
        Ok(id)
    }

    pub fn get_run(&self, run_id: i64) -> Result<Run, Error> {
        let raw = self.connection().query_row(
            "SELECT id, dataset_id, status, stage, progress_pct, config_json, \
                    error_message, created_at, started_at, finished_at \
             FROM runs WHERE id = ?1",
            params![run_id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, Option<String>>(8)?,
                    row.get::<_, Option<String>>(9)?,
                ))
            },
        )?;
        Ok(Run {
            id: raw.0,
            dataset_id: raw.1,
            status: RunStatus::parse(&raw.2)?,
            stage: RunStage::parse(&raw.3)?,
            progress_pct: raw.4,
            config_json: raw.5,
            error_message: raw.6,
            created_at: raw.7,
            started_at: raw.8,
            finished_at: raw.9,
        })
    }

    /// Apply a state-machine event to a run and persist the result.
    ///
    /// The new (status, stage) comes from [`models::transition`]; the UPDATE
    /// is guarded on the previously observed state so a lost race surfaces
    /// as `InvalidTransition` instead of silently clobbering.
    pub fn apply_run_event(
        &self,
        run_id: i64,
        event: RunEvent,
    ) -> Result<(RunStatus, RunStage), Error> {
        let run = self.get_run(run_id)?;
        let (status, stage) = models::transition(run.status, run.stage, event)?;
        let now = now_rfc3339();

        let affected = match event {
            RunEvent::Start => self.connection().execute(
                "UPDATE runs SET status = ?1, stage = ?2, progress_pct = 0, \
                 started_at = ?3, error_message = NULL \
                 WHERE id = ?4 AND status = ?5",
                params![status.as_str(), stage.as_str(), now, run_id, run.status.as_str()],
            )?,
            RunEvent::AdvanceStage => self.connection().execute(
                "UPDATE runs SET stage = ?1, progress_pct = MAX(progress_pct, ?2) \
                 WHERE id = ?3 AND status = 'PROCESSING' AND stage = ?4",
                params![stage.as_str(), stage.progress_base(), run_id, run.stage.as_str()],
            )?,
            RunEvent::Complete => self.connection().execute(
                "UPDATE runs SET status = 'DONE', progress_pct = 100, finished_at = ?1 \
                 WHERE id = ?2 AND status = 'PROCESSING' AND stage = 'REPORT'",
                params![now, run_id],
            )?,
            RunEvent::Fail => self.connection().execute(
                "UPDATE runs SET status = 'FAILED', finished_at = ?1 \
                 WHERE id = ?2 AND status IN ('QUEUED', 'PROCESSING')",
                params![now, run_id],
            )?,
        };

        if affected == 0 {
            return Err(Error::InvalidTransition(format!(
                "run {} changed state concurrently (event {:?})",
                run_id, event
            )));
        }
        Ok((status, stage))
    }

    pub fn fail_run(&self, run_id: i64, message: &str) -> Result<(), Error> {
        self.apply_run_event(run_id, RunEvent::Fail)?;
        self.connection().execute(
            "UPDATE runs SET error_message = ?1 WHERE id = ?2",
            params![message, run_id],
        )?;
        debug!("Run {} failed: {}", run_id, message);
        Ok(())
    }

    /// Monotonic progress update; only moves forward and only while the run
    /// is PROCESSING.
    pub fn update_run_progress(&self, run_id: i64, progress_pct: i64) -> Result<(), Error> {
        self.connection().execute(
            "UPDATE runs SET progress_pct = MAX(progress_pct, MIN(?1, 100)) \
             WHERE id = ?2 AND status = 'PROCESSING'",
            params![progress_pct, run_id],
        )?;
        Ok(())
    }

    pub fn list_runs(&self, dataset_id: i64) -> Result<Vec<Run>, Error> {
        let ids: Vec<i64> = {
            let mut stmt = self
                .connection()
                .prepare("SELECT id FROM runs WHERE dataset_id = ?1 ORDER BY id")?;
            let ids = stmt
                .query_map(params![dataset_id], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            ids
        };
        ids.into_iter().map(|id| self.get_run(id)).collect()
    }

    /// Delete a run and everything it produced (fingerprints, pairs,
    /// results, evidence, reports) via foreign-key cascades.
    pub fn delete_run(&self, run_id: i64) -> Result<(), Error> {
        self.connection()
            .execute("DELETE FROM runs WHERE id = ?1", params![run_id])?;
        debug!("Deleted run {} and its derived rows", run_id);
        Ok(())
    }

    // ── File Fingerprints ────────────────────────────────────────

    pub fn insert_file_fingerprints(&self, rows: &[FileFingerprint]) -> Result<usize, Error> {
        let tx = self.connection().unchecked_transaction()?;
        let mut count = 0;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO file_fingerprints \
                 (run_id, file_id, k, w, algo_version, fingerprint_blob, fingerprint_count, \
                  created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
                 ON CONFLICT(run_id, file_id) DO UPDATE SET \
                     k = excluded.k, \
                     w = excluded.w, \
                     algo_version = excluded.algo_version, \
                     fingerprint_blob = excluded.fingerprint_blob, \
                     fingerprint_count = excluded.fingerprint_count",
            )?;
            let now = now_rfc3339();
            for row in rows {
                count += stmt.execute(params![
                    row.run_id,
                    row.file_id,
                    row.k,
                    row.w,
                    row.algo_version,
                    row.fingerprint_blob,
                    row.fingerprint_count,
                    now,
                ])?;
            }
        }
        tx.commit()?;
        debug!("Upserted {} file fingerprints", count);
        Ok(count)
    }

    pub fn get_file_fingerprints(&self, run_id: i64) -> Result<Vec<FileFingerprint>, Error> {
        let mut stmt = self.connection().prepare(
            "SELECT id, run_id, file_id, k, w, algo_version, fingerprint_blob, \
                    fingerprint_count \
             FROM file_fingerprints WHERE run_id = ?1 ORDER BY file_id",
        )?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok(FileFingerprint {
                    id: row.get(0)?,
                    run_id: row.get(1)?,
                    file_id: row.get(2)?,
                    k: row.get(3)?,
                    w: row.get(4)?,
                    algo_version: row.get(5)?,
                    fingerprint_blob: row.get(6)?,
                    fingerprint_count: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Candidate Pairs ──────────────────────────────────────────

    /// Insert candidate pairs for a run. Pairs are canonicalized to
    /// `file_a_id < file_b_id` before writing.
    pub fn insert_candidate_pairs(
        &self,
        run_id: i64,
        pairs: &[(i64, i64, i64, f64)],
    ) -> Result<usize, Error> {
        let tx = self.connection().unchecked_transaction()?;
        let mut count = 0;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO candidate_pairs \
                 (run_id, file_a_id, file_b_id, overlap_count, fingerprint_score, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                 ON CONFLICT(run_id, file_a_id, file_b_id) DO UPDATE SET \
                     overlap_count = excluded.overlap_count, \
                     fingerprint_score = excluded.fingerprint_score",
            )?;
            let now = now_rfc3339();
            for &(file_a, file_b, overlap, score) in pairs {
                let (a, b) = if file_a < file_b {
                    (file_a, file_b)
                } else {
                    (file_b, file_a)
                };
                count += stmt.execute(params![run_id, a, b, overlap, score, now])?;
            }
        }
        tx.commit()?;
        debug!("Inserted {} candidate pairs for run {}", count, run_id);
        Ok(count)
    }

    pub fn get_candidate_pairs(&self, run_id: i64) -> Result<Vec<CandidatePair>, Error> {
        let mut stmt = self.connection().prepare(
            "SELECT id, run_id, file_a_id, file_b_id, overlap_count, fingerprint_score \
             FROM candidate_pairs WHERE run_id = ?1 ORDER BY file_a_id, file_b_id",
        )?;
        let pairs = stmt
            .query_map(params![run_id], |row| {
                Ok(CandidatePair {
                    id: row.get(0)?,
                    run_id: row.get(1)?,
                    file_a_id: row.get(2)?,
                    file_b_id: row.get(3)?,
                    overlap_count: row.get(4)?,
                    fingerprint_score: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(pairs)
    }

    // ── Pair Results ─────────────────────────────────────────────

    /// Idempotent upsert: recomputing a pair's scores replaces the prior
    /// row for that pair in that run.
    pub fn upsert_pair_results(
        &self,
        run_id: i64,
        results: &[(i64, i64, f64, f64, f64)],
    ) -> Result<usize, Error> {
        let tx = self.connection().unchecked_transaction()?;
        let mut count = 0;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO pair_results \
                 (run_id, file_a_id, file_b_id, fingerprint_score, ast_score, final_score, \
                  created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
                 ON CONFLICT(run_id, file_a_id, file_b_id) DO UPDATE SET \
                     fingerprint_score = excluded.fingerprint_score, \
                     ast_score = excluded.ast_score, \
                     final_score = excluded.final_score",
            )?;
            let now = now_rfc3339();
            for &(file_a, file_b, fp_score, ast_score, final_score) in results {
                let (a, b) = if file_a < file_b {
                    (file_a, file_b)
                } else {
                    (file_b, file_a)
                };
                count += stmt.execute(params![run_id, a, b, fp_score, ast_score, final_score, now])?;
            }
        }
        tx.commit()?;
        debug!("Upserted {} pair results for run {}", count, run_id);
        Ok(count)
    }

    pub fn get_pair_results(&self, run_id: i64) -> Result<Vec<PairResult>, Error> {
        let mut stmt = self.connection().prepare(
            "SELECT id, run_id, file_a_id, file_b_id, fingerprint_score, ast_score, final_score \
             FROM pair_results WHERE run_id = ?1 \
             ORDER BY final_score DESC, file_a_id, file_b_id",
        )?;
        let results = stmt
            .query_map(params![run_id], |row| {
                Ok(PairResult {
                    id: row.get(0)?,
                    run_id: row.get(1)?,
                    file_a_id: row.get(2)?,
                    file_b_id: row.get(3)?,
                    fingerprint_score: row.get(4)?,
                    ast_score: row.get(5)?,
                    final_score: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(results)
    }

    pub fn get_pair_results_with_paths(&self, run_id: i64) -> Result<Vec<PairResultRow>, Error> {
        let mut stmt = self.connection().prepare(
            "SELECT pr.id, pr.run_id, pr.file_a_id, pr.file_b_id, pr.fingerprint_score, \
                    pr.ast_score, pr.final_score, \
                    sa.student_label, fa.path, sb.student_label, fb.path \
             FROM pair_results pr \
             JOIN files fa ON fa.id = pr.file_a_id \
             JOIN submissions sa ON sa.id = fa.submission_id \
             JOIN files fb ON fb.id = pr.file_b_id \
             JOIN submissions sb ON sb.id = fb.submission_id \
             WHERE pr.run_id = ?1 \
             ORDER BY pr.final_score DESC, pr.file_a_id, pr.file_b_id",
        )?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                let label_a: String = row.get(7)?;
                let path_a: String = row.get(8)?;
                let label_b: String = row.get(9)?;
                let path_b: String = row.get(10)?;
                Ok(PairResultRow {
                    result: PairResult {
                        id: row.get(0)?,
                        run_id: row.get(1)?,
                        file_a_id: row.get(2)?,
                        file_b_id: row.get(3)?,
                        fingerprint_score: row.get(4)?,
                        ast_score: row.get(5)?,
                        final_score: row.get(6)?,
                    },
                    file_a: format!("{label_a}/{path_a}"),
                    file_b: format!("{label_b}/{path_b}"),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Match Evidence ───────────────────────────────────────────

    pub fn insert_match_evidence(&self, rows: &[MatchEvidence]) -> Result<usize, Error> {
        let tx = self.connection().unchecked_transaction()?;
        let mut count = 0;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO match_evidence \
                 (run_id, file_a_id, file_b_id, a_start, a_end, b_start, b_end, kind, weight, \
                  created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            let now = now_rfc3339();
            for row in rows {
                count += stmt.execute(params![
                    row.run_id,
                    row.file_a_id,
                    row.file_b_id,
                    row.a_start,
                    row.a_end,
                    row.b_start,
                    row.b_end,
                    row.kind.as_str(),
                    row.weight,
                    now,
                ])?;
            }
        }
        tx.commit()?;
        debug!("Inserted {} evidence rows", count);
        Ok(count)
    }

    pub fn get_match_evidence(
        &self,
        run_id: i64,
        file_a_id: i64,
        file_b_id: i64,
    ) -> Result<Vec<MatchEvidence>, Error> {
        let mut stmt = self.connection().prepare(
            "SELECT id, run_id, file_a_id, file_b_id, a_start, a_end, b_start, b_end, \
                    kind, weight \
             FROM match_evidence \
             WHERE run_id = ?1 AND file_a_id = ?2 AND file_b_id = ?3 \
             ORDER BY a_start, b_start",
        )?;
        let raw = stmt
            .query_map(params![run_id, file_a_id, file_b_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, i64>(7)?,
                    row.get::<_, String>(8)?,
                    row.get::<_, f64>(9)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter()
            .map(|r| {
                Ok(MatchEvidence {
                    id: r.0,
                    run_id: r.1,
                    file_a_id: r.2,
                    file_b_id: r.3,
                    a_start: r.4,
                    a_end: r.5,
                    b_start: r.6,
                    b_end: r.7,
                    kind: EvidenceKind::parse(&r.8)?,
                    weight: r.9,
                })
            })
            .collect()
    }

    pub fn count_match_evidence(&self, run_id: i64) -> Result<i64, Error> {
        let count = self.connection().query_row(
            "SELECT COUNT(*) FROM match_evidence WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ── Run Reports ──────────────────────────────────────────────

    pub fn upsert_run_report(&self, run_id: i64, csv_storage_key: &str) -> Result<(), Error> {
        self.connection().execute(
            "INSERT INTO run_reports (run_id, csv_storage_key, generated_at) \
             VALUES (?1, ?2, ?3) \
             ON CONFLICT(run_id) DO UPDATE SET \
                 csv_storage_key = excluded.csv_storage_key, \
                 generated_at = excluded.generated_at",
            params![run_id, csv_storage_key, now_rfc3339()],
        )?;
        Ok(())
    }

    pub fn get_run_report(&self, run_id: i64) -> Result<Option<RunReport>, Error> {
        let report = self
            .connection()
            .query_row(
                "SELECT id, run_id, csv_storage_key, pdf_storage_key, generated_at \
                 FROM run_reports WHERE run_id = ?1",
                params![run_id],
                |row| {
                    Ok(RunReport {
                        id: row.get(0)?,
                        run_id: row.get(1)?,
                        csv_storage_key: row.get(2)?,
                        pdf_storage_key: row.get(3)?,
                        generated_at: row.get(4)?,
                    })
                },
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(report)
    }
}
