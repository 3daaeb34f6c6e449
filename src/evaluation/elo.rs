//! Elo rating calculation for pairwise comparisons.
//!
//! Ratings are seeded at a fixed baseline for every candidate entering a
//! pairwise phase and updated with the logistic expected-score formula:
//!
//! ```text
//! expected_a = 1 / (1 + 10^((r_b - r_a) / 400))
//! r_a'       = r_a + k * (actual_a - expected_a)
//! ```
//!
//! The loser's update is the exact negation of the winner's, so every fold
//! is zero-sum within the pair.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::run::{Candidate, CandidateId, PairwiseOutcome, PairwiseResult};

/// Default K-factor.
pub const DEFAULT_K_FACTOR: f64 = 32.0;

/// Default starting rating.
pub const DEFAULT_BASELINE: f64 = 1000.0;

/// Errors raised when folding results into a rating table.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EloError {
    #[error("Candidate '{0}' has no rating in this phase")]
    UnknownCandidate(CandidateId),

    #[error("Candidate '{0}' cannot be compared against itself")]
    SelfComparison(CandidateId),
}

/// Rating of one candidate within a pairwise phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EloRating {
    pub candidate_id: CandidateId,
    pub rating: f64,
    pub wins: u32,
    pub losses: u32,
    pub ties: u32,
    /// Creation ordinal of the candidate, used as the last tie-break.
    pub seq: u64,
}

impl EloRating {
    pub fn matches(&self) -> u32 {
        self.wins + self.losses + self.ties
    }
}

/// Ordering used for every winner decision: rating desc, wins desc, then
/// earliest created, then candidate id.
pub fn rank_order(a: &EloRating, b: &EloRating) -> Ordering {
    b.rating
        .total_cmp(&a.rating)
        .then_with(|| b.wins.cmp(&a.wins))
        .then_with(|| a.seq.cmp(&b.seq))
        .then_with(|| a.candidate_id.cmp(&b.candidate_id))
}

/// Ratings of all candidates in one pairwise phase.
///
/// Only [`EloCalculator`] mutates a table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EloTable {
    ratings: BTreeMap<CandidateId, EloRating>,
}

impl EloTable {
    pub fn get(&self, candidate_id: &str) -> Option<&EloRating> {
        self.ratings.get(candidate_id)
    }

    pub fn len(&self) -> usize {
        self.ratings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ratings.is_empty()
    }

    /// Sum of all ratings.
    pub fn total(&self) -> f64 {
        self.ratings.values().map(|r| r.rating).sum()
    }

    /// Ratings sorted best first, with the deterministic tie-break.
    pub fn ranking(&self) -> Vec<EloRating> {
        let mut ranked: Vec<EloRating> = self.ratings.values().cloned().collect();
        ranked.sort_by(rank_order);
        ranked
    }

    /// The top-ranked candidate.
    pub fn leader(&self) -> Option<EloRating> {
        self.ratings.values().min_by(|a, b| rank_order(a, b)).cloned()
    }
}

/// Stateless Elo update rules.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EloCalculator {
    k_factor: f64,
    baseline: f64,
}

impl Default for EloCalculator {
    fn default() -> Self {
        Self::new(DEFAULT_K_FACTOR, DEFAULT_BASELINE)
    }
}

impl EloCalculator {
    pub fn new(k_factor: f64, baseline: f64) -> Self {
        Self { k_factor, baseline }
    }

    pub fn k_factor(&self) -> f64 {
        self.k_factor
    }

    pub fn baseline(&self) -> f64 {
        self.baseline
    }

    /// Expected score of A against B.
    pub fn expected_score(&self, rating_a: f64, rating_b: f64) -> f64 {
        1.0 / (1.0 + 10f64.powf((rating_b - rating_a) / 400.0))
    }

    /// New ratings of A and B given A's actual score (1, 0.5 or 0).
    pub fn updated_ratings(&self, rating_a: f64, rating_b: f64, actual_a: f64) -> (f64, f64) {
        let delta = self.k_factor * (actual_a - self.expected_score(rating_a, rating_b));
        (rating_a + delta, rating_b - delta)
    }

    /// Fresh table with every candidate at the baseline.
    ///
    /// Nothing is carried over from earlier phases: a combined document starts
    /// from the same baseline as the candidate it is compared against.
    pub fn seed<'a>(&self, candidates: impl IntoIterator<Item = &'a Candidate>) -> EloTable {
        let ratings = candidates
            .into_iter()
            .map(|c| {
                (
                    c.id.clone(),
                    EloRating {
                        candidate_id: c.id.clone(),
                        rating: self.baseline,
                        wins: 0,
                        losses: 0,
                        ties: 0,
                        seq: c.seq,
                    },
                )
            })
            .collect();
        EloTable { ratings }
    }

    /// Folds one result into the table.
    ///
    /// Returns `Ok(false)` for inconclusive results, which leave ratings untouched.
    pub fn fold(&self, table: &mut EloTable, result: &PairwiseResult) -> Result<bool, EloError> {
        let actual_a = match result.outcome {
            PairwiseOutcome::WinnerA => 1.0,
            PairwiseOutcome::WinnerB => 0.0,
            PairwiseOutcome::Tie => 0.5,
            PairwiseOutcome::Inconclusive { .. } => return Ok(false),
        };

        if result.candidate_a == result.candidate_b {
            return Err(EloError::SelfComparison(result.candidate_a.clone()));
        }

        let rating_a = table
            .ratings
            .get(&result.candidate_a)
            .map(|r| r.rating)
            .ok_or_else(|| EloError::UnknownCandidate(result.candidate_a.clone()))?;
        let rating_b = table
            .ratings
            .get(&result.candidate_b)
            .map(|r| r.rating)
            .ok_or_else(|| EloError::UnknownCandidate(result.candidate_b.clone()))?;

        let (new_a, new_b) = self.updated_ratings(rating_a, rating_b, actual_a);

        if let Some(a) = table.ratings.get_mut(&result.candidate_a) {
            a.rating = new_a;
            match result.outcome {
                PairwiseOutcome::WinnerA => a.wins += 1,
                PairwiseOutcome::WinnerB => a.losses += 1,
                _ => a.ties += 1,
            }
        }
        if let Some(b) = table.ratings.get_mut(&result.candidate_b) {
            b.rating = new_b;
            match result.outcome {
                PairwiseOutcome::WinnerB => b.wins += 1,
                PairwiseOutcome::WinnerA => b.losses += 1,
                _ => b.ties += 1,
            }
        }

        Ok(true)
    }

    /// Seeds a table and folds `results` in order.
    pub fn replay<'a>(
        &self,
        candidates: impl IntoIterator<Item = &'a Candidate>,
        results: &[PairwiseResult],
    ) -> Result<EloTable, EloError> {
        let mut table = self.seed(candidates);
        for result in results {
            self.fold(&mut table, result)?;
        }
        Ok(table)
    }
}
