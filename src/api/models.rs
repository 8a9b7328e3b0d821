//! API response models.

use crate::{
    crash::{Multiplier, RoundHash},
    types::RoundSummary,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub last_round_id: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub rounds: Vec<RoundSummary>,
}

/// Everything a player needs to check one ended round by hand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyResponse {
    pub round_id: u64,
    pub hash: RoundHash,
    pub crash_point: Multiplier,
    pub recomputed_crash_point: Multiplier,
    pub crash_point_valid: bool,
    /// Hash of the round before this one, or the segment commitment when this
    /// round opens its segment.
    pub previous_hash: Option<RoundHash>,
    pub link_valid: Option<bool>,
}
