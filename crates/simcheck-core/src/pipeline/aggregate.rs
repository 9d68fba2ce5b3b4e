use crate::config::ScoreWeights;

/// Combine the two similarity signals into the final score.
///
/// Pure and idempotent: the same inputs and weights always produce the
/// same bits, so re-running aggregation replaces a pair's row with an
/// identical one. Weights arrive normalized from config validation, which
/// keeps the result inside [0, 1].
pub fn final_score(fingerprint_score: f64, ast_score: f64, weights: &ScoreWeights) -> f64 {
    let score = weights.fingerprint * fingerprint_score + weights.ast * ast_score;
    score.clamp(0.0, 1.0)
}
