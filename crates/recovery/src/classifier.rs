//! Decline classification
//!
//! A failure is "soft" only when its provider code is on a fixed allow-list
//! of transient, retryable declines. Everything else, including codes we
//! have never seen, is "hard". New soft codes are added to the list, never
//! inferred.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RecoveryError;

/// Failure code used when the provider does not send one
pub const UNKNOWN_FAILURE_CODE: &str = "unknown";

/// Provider failure codes that are worth a recovery message
pub const SOFT_DECLINE_CODES: &[&str] = &[
    "insufficient_funds",
    "generic_decline",
    "do_not_honor",
    "try_again_later",
    "processing_error",
    "card_velocity_exceeded",
    "approve_with_id",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeclineType {
    /// Transient failure; the customer can fix it
    Soft,
    /// Not retryable (stolen card, closed account, unknown codes)
    Hard,
}

impl DeclineType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeclineType::Soft => "soft",
            DeclineType::Hard => "hard",
        }
    }
}

impl fmt::Display for DeclineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeclineType {
    type Err = RecoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "soft" => Ok(DeclineType::Soft),
            "hard" => Ok(DeclineType::Hard),
            other => Err(RecoveryError::Validation(format!(
                "Unknown decline type: {}",
                other
            ))),
        }
    }
}

/// Classify a provider failure code. Matching is case-sensitive.
pub fn classify(failure_code: &str) -> DeclineType {
    if SOFT_DECLINE_CODES.contains(&failure_code) {
        DeclineType::Soft
    } else {
        DeclineType::Hard
    }
}

/// Classify an optional code; an absent code is treated as `"unknown"`
pub fn classify_optional(failure_code: Option<&str>) -> DeclineType {
    classify(failure_code.unwrap_or(UNKNOWN_FAILURE_CODE))
}
