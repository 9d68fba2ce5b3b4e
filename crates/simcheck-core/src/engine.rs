use ahash::AHashMap;
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::blobstore::BlobStore;
use crate::config::RunConfig;
use crate::error::Error;
use crate::pipeline::fingerprint::{self, FingerprintCache, Fingerprints};
use crate::pipeline::structural::{self, PairComparison};
use crate::pipeline::tokenize::TokenStream;
use crate::pipeline::{aggregate, index, report, tokenize};
use crate::progress::ProgressReporter;
use crate::storage::models::{
    FileFingerprint, MatchEvidence, RunEvent, RunStage, RunStatus, SourceFile,
};
use crate::storage::Database;

/// Items processed between progress writes within a stage.
const PROGRESS_CHUNK: usize = 32;

/// Drives runs through the stage pipeline:
/// INGEST → TOKENS → FINGERPRINT → AST → AGGREGATE → REPORT.
///
/// One engine drives one run at a time; within a stage, per-file and
/// per-pair work fans out over rayon. Stage N fully completes (or accounts
/// for failed items) before stage N+1 begins. The fingerprint cache lives
/// on the engine so repeated runs with identical parameters share work.
pub struct RunEngine<'a> {
    db: &'a Database,
    blobs: &'a dyn BlobStore,
    cache: FingerprintCache,
    cancel: Arc<AtomicBool>,
}

#[derive(Debug)]
pub struct RunOutcome {
    pub run_id: i64,
    pub files_total: usize,
    pub files_skipped: usize,
    pub candidate_pairs: usize,
    pub pairs_compared: usize,
    pub pairs_skipped: usize,
    pub evidence_rows: usize,
    pub postings_dropped: u64,
    pub ingest_duration: Duration,
    pub tokens_duration: Duration,
    pub fingerprint_duration: Duration,
    pub ast_duration: Duration,
    pub aggregate_duration: Duration,
    pub report_duration: Duration,
}

struct Analysis {
    file: SourceFile,
    tokens: TokenStream,
    fingerprints: Arc<Fingerprints>,
}

impl<'a> RunEngine<'a> {
    pub fn new(db: &'a Database, blobs: &'a dyn BlobStore) -> Self {
        Self {
            db,
            blobs,
            cache: FingerprintCache::new(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Token for cooperative cancellation. Checked at stage boundaries;
    /// in-flight items within a stage are allowed to finish.
    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Validate the configuration and enqueue a run for a dataset.
    pub fn submit(&self, dataset_id: i64, config: &RunConfig) -> Result<i64, Error> {
        let config = config.clone().validated()?;
        self.db.get_dataset(dataset_id)?;
        self.db.create_run(dataset_id, &config.to_json())
    }

    /// Execute a QUEUED run to completion.
    ///
    /// Fatal errors (bad configuration, unreachable storage, every file
    /// failing to tokenize, cancellation) mark the run FAILED with an
    /// error message and are returned. Per-item failures are skipped and
    /// counted unless the run is strict.
    pub fn execute(
        &self,
        run_id: i64,
        reporter: &dyn ProgressReporter,
    ) -> Result<RunOutcome, Error> {
        let run = self.db.get_run(run_id)?;
        if run.status != RunStatus::Queued {
            return Err(Error::InvalidTransition(format!(
                "run {} is {}; only QUEUED runs can execute",
                run_id,
                run.status.as_str()
            )));
        }

        let config = match RunConfig::from_json(&run.config_json) {
            Ok(config) => config,
            Err(e) => {
                self.db.fail_run(run_id, &e.to_string())?;
                return Err(e);
            }
        };

        self.db.apply_run_event(run_id, RunEvent::Start)?;
        reporter.on_run_start(run_id);
        info!(
            "Run {} started (k={}, w={}, strict={})",
            run_id, config.k, config.w, config.strict
        );

        match self.run_stages(run_id, run.dataset_id, &config, reporter) {
            Ok(outcome) => {
                self.db.apply_run_event(run_id, RunEvent::Complete)?;
                reporter.on_run_complete(run_id, RunStatus::Done);
                info!("Run {} completed", run_id);
                Ok(outcome)
            }
            Err(e) => {
                if let Err(fail_err) = self.db.fail_run(run_id, &e.to_string()) {
                    warn!("Could not mark run {} failed: {}", run_id, fail_err);
                }
                reporter.on_run_complete(run_id, RunStatus::Failed);
                Err(e)
            }
        }
    }

    fn run_stages(
        &self,
        run_id: i64,
        dataset_id: i64,
        config: &RunConfig,
        reporter: &dyn ProgressReporter,
    ) -> Result<RunOutcome, Error> {
        // ── INGEST ───────────────────────────────────────────────
        self.check_cancelled()?;
        let ingest_start = Instant::now();
        let ingested = self.stage_ingest(run_id, dataset_id, reporter)?;
        let ingest_duration = ingest_start.elapsed();
        reporter.on_stage_complete(RunStage::Ingest, ingest_duration.as_secs_f64());
        let files_total = ingested.len();

        // ── TOKENS ───────────────────────────────────────────────
        self.check_cancelled()?;
        self.db.apply_run_event(run_id, RunEvent::AdvanceStage)?;
        let tokens_start = Instant::now();
        let (token_streams, files_skipped) =
            self.stage_tokens(run_id, &ingested, config, reporter)?;
        let tokens_duration = tokens_start.elapsed();
        reporter.on_stage_complete(RunStage::Tokens, tokens_duration.as_secs_f64());

        if token_streams.is_empty() && !ingested.is_empty() {
            return Err(Error::Other(format!(
                "all {} files failed to tokenize",
                ingested.len()
            )));
        }
        drop(ingested);

        // ── FINGERPRINT ──────────────────────────────────────────
        self.check_cancelled()?;
        self.db.apply_run_event(run_id, RunEvent::AdvanceStage)?;
        let fingerprint_start = Instant::now();
        let analyses = self.stage_fingerprint(run_id, token_streams, config, reporter)?;
        let fingerprint_duration = fingerprint_start.elapsed();
        reporter.on_stage_complete(RunStage::Fingerprint, fingerprint_duration.as_secs_f64());

        // ── AST ──────────────────────────────────────────────────
        self.check_cancelled()?;
        self.db.apply_run_event(run_id, RunEvent::AdvanceStage)?;
        let ast_start = Instant::now();
        let ast = self.stage_ast(run_id, &analyses, config, reporter)?;
        let ast_duration = ast_start.elapsed();
        reporter.on_stage_complete(RunStage::Ast, ast_duration.as_secs_f64());

        // ── AGGREGATE ────────────────────────────────────────────
        self.check_cancelled()?;
        self.db.apply_run_event(run_id, RunEvent::AdvanceStage)?;
        let aggregate_start = Instant::now();
        self.stage_aggregate(run_id, &ast.compared, config, reporter)?;
        let aggregate_duration = aggregate_start.elapsed();
        reporter.on_stage_complete(RunStage::Aggregate, aggregate_duration.as_secs_f64());

        // ── REPORT ───────────────────────────────────────────────
        self.check_cancelled()?;
        self.db.apply_run_event(run_id, RunEvent::AdvanceStage)?;
        let report_start = Instant::now();
        self.stage_report(run_id, reporter)?;
        let report_duration = report_start.elapsed();
        reporter.on_stage_complete(RunStage::Report, report_duration.as_secs_f64());

        Ok(RunOutcome {
            run_id,
            files_total,
            files_skipped,
            candidate_pairs: ast.candidate_pairs,
            pairs_compared: ast.compared.len(),
            pairs_skipped: ast.pairs_skipped,
            evidence_rows: ast.evidence_rows,
            postings_dropped: ast.postings_dropped,
            ingest_duration,
            tokens_duration,
            fingerprint_duration,
            ast_duration,
            aggregate_duration,
            report_duration,
        })
    }

    fn check_cancelled(&self) -> Result<(), Error> {
        if self.cancel.load(Ordering::Relaxed) {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    fn stage_progress(
        &self,
        run_id: i64,
        stage: RunStage,
        completed: usize,
        total: usize,
        reporter: &dyn ProgressReporter,
    ) -> Result<(), Error> {
        let pct = if total == 0 {
            stage.progress_base() + stage.progress_share()
        } else {
            stage.progress_base() + stage.progress_share() * completed as i64 / total as i64
        };
        self.db.update_run_progress(run_id, pct)?;
        reporter.on_stage_progress(stage, completed, total);
        Ok(())
    }

    /// Load the dataset's file rows and fetch their bytes from the blob
    /// store. Any unreadable blob is fatal: without bytes there is no
    /// pipeline to run for that dataset.
    fn stage_ingest(
        &self,
        run_id: i64,
        dataset_id: i64,
        reporter: &dyn ProgressReporter,
    ) -> Result<Vec<(SourceFile, Vec<u8>)>, Error> {
        let files = self.db.get_dataset_files(dataset_id)?;
        reporter.on_stage_start(RunStage::Ingest, files.len());
        debug!("Run {}: ingesting {} files", run_id, files.len());

        let blobs = self.blobs;
        let mut ingested = Vec::with_capacity(files.len());
        let mut completed = 0usize;
        for chunk in files.chunks(PROGRESS_CHUNK) {
            let bytes: Vec<Result<Vec<u8>, Error>> = chunk
                .par_iter()
                .map(|file| blobs.get(&file.storage_key))
                .collect();
            for (file, result) in chunk.iter().zip(bytes) {
                ingested.push((file.clone(), result?));
            }
            completed += chunk.len();
            self.stage_progress(run_id, RunStage::Ingest, completed, files.len(), reporter)?;
        }
        if files.is_empty() {
            self.stage_progress(run_id, RunStage::Ingest, 0, 0, reporter)?;
        }
        Ok(ingested)
    }

    /// Tokenize every ingested file. Unsupported languages and undecodable
    /// sources are per-file failures: skipped and counted, or fatal under
    /// strict mode.
    fn stage_tokens(
        &self,
        run_id: i64,
        ingested: &[(SourceFile, Vec<u8>)],
        config: &RunConfig,
        reporter: &dyn ProgressReporter,
    ) -> Result<(Vec<(SourceFile, TokenStream)>, usize), Error> {
        reporter.on_stage_start(RunStage::Tokens, ingested.len());

        let mut streams = Vec::with_capacity(ingested.len());
        let mut skipped = 0usize;
        let mut completed = 0usize;
        for chunk in ingested.chunks(PROGRESS_CHUNK) {
            let results: Vec<Result<TokenStream, Error>> = chunk
                .par_iter()
                .map(|(file, bytes)| tokenize::tokenize(bytes, &file.language))
                .collect();
            for ((file, _), result) in chunk.iter().zip(results) {
                match result {
                    Ok(tokens) => streams.push((file.clone(), tokens)),
                    Err(e @ (Error::LanguageUnsupported(_) | Error::ParseFailure(_))) => {
                        if config.strict {
                            return Err(Error::Other(format!(
                                "strict mode: file {} ({}) failed to tokenize: {}",
                                file.id, file.path, e
                            )));
                        }
                        warn!(
                            "Run {}: skipping file {} ({}): {}",
                            run_id, file.id, file.path, e
                        );
                        reporter.on_item_skipped(RunStage::Tokens, &file.path, &e.to_string());
                        skipped += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
            completed += chunk.len();
            self.stage_progress(run_id, RunStage::Tokens, completed, ingested.len(), reporter)?;
        }
        if ingested.is_empty() {
            self.stage_progress(run_id, RunStage::Tokens, 0, 0, reporter)?;
        }
        Ok((streams, skipped))
    }

    /// Winnow every token stream into a fingerprint set and persist the
    /// rows. Identical file bytes share one computation via the
    /// content-hash cache.
    fn stage_fingerprint(
        &self,
        run_id: i64,
        streams: Vec<(SourceFile, TokenStream)>,
        config: &RunConfig,
        reporter: &dyn ProgressReporter,
    ) -> Result<Vec<Analysis>, Error> {
        reporter.on_stage_start(RunStage::Fingerprint, streams.len());

        let cache = &self.cache;
        let total = streams.len();
        let mut analyses = Vec::with_capacity(total);
        let mut completed = 0usize;
        for chunk in streams.chunks(PROGRESS_CHUNK) {
            let chunk_fingerprints: Vec<Arc<Fingerprints>> = chunk
                .par_iter()
                .map(|(file, tokens)| {
                    cache.get_or_compute(
                        &file.content_hash,
                        config.k,
                        config.w,
                        &config.algo_version,
                        &tokens.codes,
                    )
                })
                .collect();

            let mut rows = Vec::with_capacity(chunk.len());
            for ((file, tokens), fingerprints) in chunk.iter().zip(chunk_fingerprints) {
                rows.push(FileFingerprint {
                    id: 0,
                    run_id,
                    file_id: file.id,
                    k: config.k as i64,
                    w: config.w as i64,
                    algo_version: config.algo_version.clone(),
                    fingerprint_blob: fingerprint::encode_blob(&fingerprints.hashes)?,
                    fingerprint_count: fingerprints.count() as i64,
                });
                analyses.push(Analysis {
                    file: file.clone(),
                    tokens: tokens.clone(),
                    fingerprints,
                });
            }
            self.db.insert_file_fingerprints(&rows)?;
            completed += rows.len();
            self.stage_progress(run_id, RunStage::Fingerprint, completed, total, reporter)?;
        }
        if total == 0 {
            self.stage_progress(run_id, RunStage::Fingerprint, 0, 0, reporter)?;
        }
        Ok(analyses)
    }

    /// Build the candidate index over all fingerprint sets, then compare
    /// every candidate pair structurally and persist evidence. A pair
    /// whose file cannot be parsed is skipped (or fails a strict run).
    fn stage_ast(
        &self,
        run_id: i64,
        analyses: &[Analysis],
        config: &RunConfig,
        reporter: &dyn ProgressReporter,
    ) -> Result<AstStageResult, Error> {
        let sets: Vec<(i64, Arc<Fingerprints>)> = analyses
            .iter()
            .map(|a| (a.file.id, Arc::clone(&a.fingerprints)))
            .collect();
        let (candidates, index_stats) =
            index::build_candidates(&sets, config.min_overlap, config.max_postings);

        let pair_rows: Vec<(i64, i64, i64, f64)> = candidates
            .iter()
            .map(|c| (c.file_a_id, c.file_b_id, c.overlap_count, c.fingerprint_score))
            .collect();
        self.db.insert_candidate_pairs(run_id, &pair_rows)?;

        reporter.on_stage_start(RunStage::Ast, candidates.len());
        debug!(
            "Run {}: {} candidate pairs ({} boilerplate hashes dropped)",
            run_id,
            candidates.len(),
            index_stats.postings_dropped
        );

        let by_id: AHashMap<i64, &Analysis> =
            analyses.iter().map(|a| (a.file.id, a)).collect();

        let mut result = AstStageResult {
            candidate_pairs: candidates.len(),
            postings_dropped: index_stats.postings_dropped,
            ..AstStageResult::default()
        };
        let mut completed = 0usize;
        for chunk in candidates.chunks(PROGRESS_CHUNK) {
            let comparisons: Vec<Result<PairComparison, Error>> = chunk
                .par_iter()
                .map(|candidate| {
                    let a = by_id[&candidate.file_a_id];
                    let b = by_id[&candidate.file_b_id];
                    structural::compare_pair(
                        &a.tokens,
                        &a.fingerprints,
                        &b.tokens,
                        &b.fingerprints,
                        config,
                    )
                })
                .collect();

            let mut evidence_batch: Vec<MatchEvidence> = Vec::new();
            for (candidate, comparison) in chunk.iter().zip(comparisons) {
                let subject = format!(
                    "pair (file {}, file {})",
                    candidate.file_a_id, candidate.file_b_id
                );
                match comparison {
                    Ok(comparison) => {
                        for span in &comparison.evidence {
                            evidence_batch.push(MatchEvidence {
                                id: 0,
                                run_id,
                                file_a_id: candidate.file_a_id,
                                file_b_id: candidate.file_b_id,
                                a_start: i64::from(span.a_start),
                                a_end: i64::from(span.a_end),
                                b_start: i64::from(span.b_start),
                                b_end: i64::from(span.b_end),
                                kind: span.kind,
                                weight: span.weight,
                            });
                        }
                        result
                            .compared
                            .push((candidate.clone(), comparison.ast_score));
                    }
                    Err(e @ Error::ParseFailure(_)) => {
                        if config.strict {
                            return Err(Error::Other(format!(
                                "strict mode: {} failed structural comparison: {}",
                                subject, e
                            )));
                        }
                        warn!("Run {}: skipping {}: {}", run_id, subject, e);
                        reporter.on_item_skipped(RunStage::Ast, &subject, &e.to_string());
                        result.pairs_skipped += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
            result.evidence_rows += self.db.insert_match_evidence(&evidence_batch)?;
            completed += chunk.len();
            self.stage_progress(run_id, RunStage::Ast, completed, candidates.len(), reporter)?;
        }
        if candidates.is_empty() {
            self.stage_progress(run_id, RunStage::Ast, 0, 0, reporter)?;
        }
        Ok(result)
    }

    /// Weighted score combination, upserted per pair. Pairs skipped in the
    /// AST stage are excluded here as well.
    fn stage_aggregate(
        &self,
        run_id: i64,
        compared: &[(index::Candidate, f64)],
        config: &RunConfig,
        reporter: &dyn ProgressReporter,
    ) -> Result<(), Error> {
        reporter.on_stage_start(RunStage::Aggregate, compared.len());

        let mut completed = 0usize;
        for chunk in compared.chunks(PROGRESS_CHUNK) {
            let rows: Vec<(i64, i64, f64, f64, f64)> = chunk
                .iter()
                .map(|(candidate, ast_score)| {
                    let final_score = aggregate::final_score(
                        candidate.fingerprint_score,
                        *ast_score,
                        &config.weights,
                    );
                    (
                        candidate.file_a_id,
                        candidate.file_b_id,
                        candidate.fingerprint_score,
                        *ast_score,
                        final_score,
                    )
                })
                .collect();
            self.db.upsert_pair_results(run_id, &rows)?;
            completed += chunk.len();
            self.stage_progress(run_id, RunStage::Aggregate, completed, compared.len(), reporter)?;
        }
        if compared.is_empty() {
            self.stage_progress(run_id, RunStage::Aggregate, 0, 0, reporter)?;
        }
        Ok(())
    }

    /// Render the CSV artifact, store it, and record the report row.
    fn stage_report(&self, run_id: i64, reporter: &dyn ProgressReporter) -> Result<(), Error> {
        reporter.on_stage_start(RunStage::Report, 1);

        let rows = self.db.get_pair_results_with_paths(run_id)?;
        let bytes = report::render_csv(&rows)?;
        let key = report::csv_storage_key(run_id);
        self.blobs.put(&key, &bytes)?;
        self.db.upsert_run_report(run_id, &key)?;

        self.stage_progress(run_id, RunStage::Report, 1, 1, reporter)?;
        Ok(())
    }
}

#[derive(Default)]
struct AstStageResult {
    candidate_pairs: usize,
    compared: Vec<(index::Candidate, f64)>,
    pairs_skipped: usize,
    evidence_rows: usize,
    postings_dropped: u64,
}
