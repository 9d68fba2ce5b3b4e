use crate::error::Error;
use crate::storage::PairResultRow;

/// Render the per-pair score report as CSV bytes, ready for the blob
/// store. Rows arrive already sorted by final score descending.
pub fn render_csv(rows: &[PairResultRow]) -> Result<Vec<u8>, Error> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record([
            "file_a",
            "file_b",
            "fingerprint_score",
            "ast_score",
            "final_score",
        ])
        .map_err(|e| Error::Other(format!("report write: {e}")))?;

    for row in rows {
        writer
            .write_record([
                row.file_a.clone(),
                row.file_b.clone(),
                format!("{:.6}", row.result.fingerprint_score),
                format!("{:.6}", row.result.ast_score),
                format!("{:.6}", row.result.final_score),
            ])
            .map_err(|e| Error::Other(format!("report write: {e}")))?;
    }

    writer
        .into_inner()
        .map_err(|e| Error::Other(format!("report write: {e}")))
}

/// Storage key for a run's CSV report.
pub fn csv_storage_key(run_id: i64) -> String {
    format!("runs/{run_id}/report.csv")
}
