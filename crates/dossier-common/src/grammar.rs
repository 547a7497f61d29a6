//! The eight-move reasoning grammar.
//!
//! The canonical order (framing through positioning) is a recommended path,
//! not an enforced one: the ledger only uses grammar positions to derive
//! per-type status after backtracking. Transition policy is a caller concern.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// One of the eight fixed reasoning steps that structure a decision run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveType {
    Framing,
    Issues,
    Evidence,
    Interpretation,
    Considerations,
    Balance,
    Negotiation,
    Positioning,
}

/// All move types in canonical grammar order.
pub const MOVE_TYPES: [MoveType; 8] = [
    MoveType::Framing,
    MoveType::Issues,
    MoveType::Evidence,
    MoveType::Interpretation,
    MoveType::Considerations,
    MoveType::Balance,
    MoveType::Negotiation,
    MoveType::Positioning,
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GrammarError {
    #[error("unknown move type: {0}")]
    UnknownMoveType(String),
}

impl MoveType {
    /// Position in the canonical grammar order, 0..=7.
    pub fn position(self) -> u8 {
        match self {
            MoveType::Framing => 0,
            MoveType::Issues => 1,
            MoveType::Evidence => 2,
            MoveType::Interpretation => 3,
            MoveType::Considerations => 4,
            MoveType::Balance => 5,
            MoveType::Negotiation => 6,
            MoveType::Positioning => 7,
        }
    }

    /// Stable string code used in persistence and wire payloads.
    pub fn code(self) -> &'static str {
        match self {
            MoveType::Framing => "framing",
            MoveType::Issues => "issues",
            MoveType::Evidence => "evidence",
            MoveType::Interpretation => "interpretation",
            MoveType::Considerations => "considerations",
            MoveType::Balance => "balance",
            MoveType::Negotiation => "negotiation",
            MoveType::Positioning => "positioning",
        }
    }
}

impl fmt::Display for MoveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for MoveType {
    type Err = GrammarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "framing" => Ok(MoveType::Framing),
            "issues" => Ok(MoveType::Issues),
            "evidence" => Ok(MoveType::Evidence),
            "interpretation" => Ok(MoveType::Interpretation),
            "considerations" => Ok(MoveType::Considerations),
            "balance" => Ok(MoveType::Balance),
            "negotiation" => Ok(MoveType::Negotiation),
            "positioning" => Ok(MoveType::Positioning),
            other => Err(GrammarError::UnknownMoveType(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_order_matches_positions() {
        for (i, mt) in MOVE_TYPES.iter().enumerate() {
            assert_eq!(mt.position() as usize, i);
        }
    }

    #[test]
    fn codes_round_trip() {
        for mt in MOVE_TYPES {
            assert_eq!(mt.code().parse::<MoveType>().unwrap(), mt);
        }
    }

    #[test]
    fn unknown_code_is_rejected() {
        assert_eq!(
            "synthesis".parse::<MoveType>(),
            Err(GrammarError::UnknownMoveType("synthesis".to_string()))
        );
    }

    #[test]
    fn serde_uses_snake_case_codes() {
        let json = serde_json::to_string(&MoveType::Interpretation).unwrap();
        assert_eq!(json, "\"interpretation\"");
        let back: MoveType = serde_json::from_str("\"balance\"").unwrap();
        assert_eq!(back, MoveType::Balance);
    }
}
