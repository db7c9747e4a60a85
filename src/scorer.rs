//! Weighted scoring and classification
//!
//! Pure function of an aggregate and the configured weight table. The
//! registry-forced override lives here so the live pipeline and the
//! retrospective scorer share identical semantics.

use serde::{Deserialize, Serialize};

use crate::{AggregatedDetection, Classification, EvidenceKind};

/// Score contribution per evidence kind. Gateway and judge evidence share the
/// judge weight; registry evidence carries no weight of its own, its effect is
/// the penalty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightTable {
    pub endpoint: u32,
    pub judge: u32,
    pub network: u32,
}

impl Default for WeightTable {
    fn default() -> Self {
        Self {
            endpoint: 11,
            judge: 5,
            network: 3,
        }
    }
}

impl WeightTable {
    pub fn contribution_for(&self, kind: EvidenceKind) -> u32 {
        match kind {
            EvidenceKind::Endpoint => self.endpoint,
            EvidenceKind::Network => self.network,
            EvidenceKind::Gateway | EvidenceKind::Judge => self.judge,
            EvidenceKind::Registry => 0,
        }
    }
}

/// Classification thresholds: `score <= authorized` is authorized,
/// `score <= suspect` is suspect, anything above is unauthorized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thresholds {
    pub authorized: i64,
    pub suspect: i64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            authorized: 4,
            suspect: 8,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Scorer {
    weights: WeightTable,
    thresholds: Thresholds,
    registry_penalty: i64,
}

impl Scorer {
    pub fn new(weights: WeightTable, thresholds: Thresholds, registry_penalty: i64) -> Self {
        Self {
            weights,
            thresholds,
            registry_penalty,
        }
    }

    pub fn weights(&self) -> &WeightTable {
        &self.weights
    }

    /// Recompute score, classification and the judge flag in place.
    ///
    /// `penalty` is the registry-reported penalty for this target (non-positive,
    /// zero when the registry did not supply one); the configured default is
    /// used in that case.
    pub fn score(&self, aggregate: &mut AggregatedDetection, penalty: i64) {
        let raw: i64 = aggregate
            .evidence
            .iter()
            .map(|e| e.score_contribution as i64)
            .sum();

        let applied_penalty = if aggregate.registry_matched {
            if penalty < 0 {
                penalty
            } else {
                self.registry_penalty
            }
        } else {
            0
        };

        aggregate.registry_penalty_applied = applied_penalty != 0;
        aggregate.score = (raw + applied_penalty).max(0) as u32;
        aggregate.judge_available = aggregate.evidence.iter().any(|e| {
            e.kind == EvidenceKind::Judge || e.source.starts_with("judge")
        });

        aggregate.classification = if aggregate.registry_matched {
            // Registry approval overrides the score unconditionally
            Classification::Authorized
        } else if (aggregate.score as i64) <= self.thresholds.authorized {
            Classification::Authorized
        } else if (aggregate.score as i64) <= self.thresholds.suspect {
            Classification::Suspect
        } else {
            Classification::Unauthorized
        };
    }
}

impl Default for Scorer {
    fn default() -> Self {
        Self::new(WeightTable::default(), Thresholds::default(), -6)
    }
}
