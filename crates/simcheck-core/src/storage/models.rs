use crate::error::Error;

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Queued,
    Processing,
    Done,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "QUEUED",
            RunStatus::Processing => "PROCESSING",
            RunStatus::Done => "DONE",
            RunStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Result<Self, Error> {
        match s {
            "QUEUED" => Ok(RunStatus::Queued),
            "PROCESSING" => Ok(RunStatus::Processing),
            "DONE" => Ok(RunStatus::Done),
            "FAILED" => Ok(RunStatus::Failed),
            other => Err(Error::Other(format!("unknown run status: {other}"))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Done | RunStatus::Failed)
    }
}

/// Processing stage within a run. Stages only ever advance forward through
/// the fixed sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RunStage {
    Ingest,
    Tokens,
    Fingerprint,
    Ast,
    Aggregate,
    Report,
}

impl RunStage {
    pub const SEQUENCE: [RunStage; 6] = [
        RunStage::Ingest,
        RunStage::Tokens,
        RunStage::Fingerprint,
        RunStage::Ast,
        RunStage::Aggregate,
        RunStage::Report,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStage::Ingest => "INGEST",
            RunStage::Tokens => "TOKENS",
            RunStage::Fingerprint => "FINGERPRINT",
            RunStage::Ast => "AST",
            RunStage::Aggregate => "AGGREGATE",
            RunStage::Report => "REPORT",
        }
    }

    pub fn parse(s: &str) -> Result<Self, Error> {
        match s {
            "INGEST" => Ok(RunStage::Ingest),
            "TOKENS" => Ok(RunStage::Tokens),
            "FINGERPRINT" => Ok(RunStage::Fingerprint),
            "AST" => Ok(RunStage::Ast),
            "AGGREGATE" => Ok(RunStage::Aggregate),
            "REPORT" => Ok(RunStage::Report),
            other => Err(Error::Other(format!("unknown run stage: {other}"))),
        }
    }

    pub fn next(&self) -> Option<RunStage> {
        match self {
            RunStage::Ingest => Some(RunStage::Tokens),
            RunStage::Tokens => Some(RunStage::Fingerprint),
            RunStage::Fingerprint => Some(RunStage::Ast),
            RunStage::Ast => Some(RunStage::Aggregate),
            RunStage::Aggregate => Some(RunStage::Report),
            RunStage::Report => None,
        }
    }

    /// Progress value at which this stage begins.
    pub fn progress_base(&self) -> i64 {
        match self {
            RunStage::Ingest => 0,
            RunStage::Tokens => 10,
            RunStage::Fingerprint => 30,
            RunStage::Ast => 50,
            RunStage::Aggregate => 80,
            RunStage::Report => 90,
        }
    }

    /// Share of the overall 0–100 range owned by this stage.
    pub fn progress_share(&self) -> i64 {
        match self {
            RunStage::Ingest => 10,
            RunStage::Tokens => 20,
            RunStage::Fingerprint => 20,
            RunStage::Ast => 30,
            RunStage::Aggregate => 10,
            RunStage::Report => 10,
        }
    }
}

/// Events accepted by the run state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEvent {
    Start,
    AdvanceStage,
    Complete,
    Fail,
}

/// The single authoritative transition function for run status and stage.
/// Every persisted status/stage change goes through here so invalid
/// combinations (e.g. DONE while still at INGEST) cannot be stored.
pub fn transition(
    status: RunStatus,
    stage: RunStage,
    event: RunEvent,
) -> Result<(RunStatus, RunStage), Error> {
    match (status, event) {
        (RunStatus::Queued, RunEvent::Start) => Ok((RunStatus::Processing, RunStage::Ingest)),
        (RunStatus::Processing, RunEvent::AdvanceStage) => match stage.next() {
            Some(next) => Ok((RunStatus::Processing, next)),
            None => Err(Error::InvalidTransition(
                "no stage after REPORT; use Complete".to_string(),
            )),
        },
        (RunStatus::Processing, RunEvent::Complete) => {
            if stage == RunStage::Report {
                Ok((RunStatus::Done, RunStage::Report))
            } else {
                Err(Error::InvalidTransition(format!(
                    "cannot complete run at stage {}",
                    stage.as_str()
                )))
            }
        }
        (RunStatus::Queued | RunStatus::Processing, RunEvent::Fail) => {
            Ok((RunStatus::Failed, stage))
        }
        (status, event) => Err(Error::InvalidTransition(format!(
            "{:?} not accepted in status {}",
            event,
            status.as_str()
        ))),
    }
}

/// Kind of a match-evidence row: raw token-sequence match or structural
/// (subtree) match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvidenceKind {
    Token,
    Ast,
}

impl EvidenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvidenceKind::Token => "TOKEN",
            EvidenceKind::Ast => "AST",
        }
    }

    pub fn parse(s: &str) -> Result<Self, Error> {
        match s {
            "TOKEN" => Ok(EvidenceKind::Token),
            "AST" => Ok(EvidenceKind::Ast),
            other => Err(Error::Other(format!("unknown evidence kind: {other}"))),
        }
    }
}

/// A named group of datasets owned by one user.
#[derive(Debug, Clone)]
pub struct Collection {
    pub id: i64,
    pub owner_id: String,
    pub name: String,
    pub created_at: String,
}

/// A fixed set of submissions analyzed together.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub id: i64,
    pub collection_id: i64,
    pub name: String,
    pub created_at: String,
}

/// One student's submitted files within a dataset.
#[derive(Debug, Clone)]
pub struct Submission {
    pub id: i64,
    pub dataset_id: i64,
    pub student_label: String,
    pub created_at: String,
}

/// An immutable source unit. Identity is the content hash; bytes live in
/// the blob store under `storage_key`.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub id: i64,
    pub submission_id: i64,
    pub path: String,
    pub language: String,
    pub size_bytes: i64,
    pub content_hash: String,
    pub storage_key: String,
    pub created_at: String,
}

/// One analysis job over a dataset. Owns all fingerprints, pairs, results
/// and evidence it produces; deleting a run cascades to them.
#[derive(Debug, Clone)]
pub struct Run {
    pub id: i64,
    pub dataset_id: i64,
    pub status: RunStatus,
    pub stage: RunStage,
    pub progress_pct: i64,
    pub config_json: String,
    pub error_message: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

/// Winnowed fingerprint set for one file under one run's configuration.
#[derive(Debug, Clone)]
pub struct FileFingerprint {
    pub id: i64,
    pub run_id: i64,
    pub file_id: i64,
    pub k: i64,
    pub w: i64,
    pub algo_version: String,
    pub fingerprint_blob: Vec<u8>,
    pub fingerprint_count: i64,
}

/// An unordered file pair whose fingerprint sets overlap. Always stored
/// with `file_a_id < file_b_id`.
#[derive(Debug, Clone)]
pub struct CandidatePair {
    pub id: i64,
    pub run_id: i64,
    pub file_a_id: i64,
    pub file_b_id: i64,
    pub overlap_count: i64,
    pub fingerprint_score: f64,
}

/// Final verdict for a candidate pair.
#[derive(Debug, Clone)]
pub struct PairResult {
    pub id: i64,
    pub run_id: i64,
    pub file_a_id: i64,
    pub file_b_id: i64,
    pub fingerprint_score: f64,
    pub ast_score: f64,
    pub final_score: f64,
}

/// One matched byte region between two files.
#[derive(Debug, Clone)]
pub struct MatchEvidence {
    pub id: i64,
    pub run_id: i64,
    pub file_a_id: i64,
    pub file_b_id: i64,
    pub a_start: i64,
    pub a_end: i64,
    pub b_start: i64,
    pub b_end: i64,
    pub kind: EvidenceKind,
    pub weight: f64,
}

/// Generated artifact references for a completed run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub id: i64,
    pub run_id: i64,
    pub csv_storage_key: Option<String>,
    pub pdf_storage_key: Option<String>,
    pub generated_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_sequence_advances_forward_only() {
        let mut stage = RunStage::Ingest;
        let mut seen = vec![stage];
        while let Some(next) = stage.next() {
            assert!(next > stage, "stage must advance forward");
            stage = next;
            seen.push(stage);
        }
        assert_eq!(seen, RunStage::SEQUENCE);
    }

    #[test]
    fn progress_shares_cover_full_range() {
        let total: i64 = RunStage::SEQUENCE.iter().map(|s| s.progress_share()).sum();
        assert_eq!(total, 100);
        for pair in RunStage::SEQUENCE.windows(2) {
            assert_eq!(
                pair[0].progress_base() + pair[0].progress_share(),
                pair[1].progress_base()
            );
        }
    }

    #[test]
    fn queued_run_starts_at_ingest() {
        let (status, stage) =
            transition(RunStatus::Queued, RunStage::Ingest, RunEvent::Start).unwrap();
        assert_eq!(status, RunStatus::Processing);
        assert_eq!(stage, RunStage::Ingest);
    }

    #[test]
    fn completion_requires_report_stage() {
        let err = transition(RunStatus::Processing, RunStage::Ast, RunEvent::Complete).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition(_)));

        let (status, _) =
            transition(RunStatus::Processing, RunStage::Report, RunEvent::Complete).unwrap();
        assert_eq!(status, RunStatus::Done);
    }

    #[test]
    fn terminal_states_accept_no_events() {
        for status in [RunStatus::Done, RunStatus::Failed] {
            for event in [
                RunEvent::Start,
                RunEvent::AdvanceStage,
                RunEvent::Complete,
                RunEvent::Fail,
            ] {
                assert!(transition(status, RunStage::Report, event).is_err());
            }
        }
    }

    #[test]
    fn failure_preserves_the_failing_stage() {
        let (status, stage) =
            transition(RunStatus::Processing, RunStage::Fingerprint, RunEvent::Fail).unwrap();
        assert_eq!(status, RunStatus::Failed);
        assert_eq!(stage, RunStage::Fingerprint);
    }

    #[test]
    fn status_and_stage_round_trip_through_strings() {
        for status in [
            RunStatus::Queued,
            RunStatus::Processing,
            RunStatus::Done,
            RunStatus::Failed,
        ] {
            assert_eq!(RunStatus::parse(status.as_str()).unwrap(), status);
        }
        for stage in RunStage::SEQUENCE {
            assert_eq!(RunStage::parse(stage.as_str()).unwrap(), stage);
        }
    }
}
