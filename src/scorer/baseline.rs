use crate::config::baseline_scores;

/// Fallback score for a record with no usable flags, so that every in-scope
/// record gets a row. Single-bidder awards start out more suspicious.
/// A reported count of zero is treated as unknown.
pub fn baseline_score(num_bidders: Option<u32>) -> u8 {
    match num_bidders {
        Some(1) => baseline_scores::SINGLE_BIDDER,
        Some(n) if n > 1 => baseline_scores::COMPETITIVE,
        _ => baseline_scores::UNKNOWN_BIDDERS,
    }
}
