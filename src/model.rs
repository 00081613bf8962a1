//! Participation prediction engine.
//!
//! The model is a fixed heuristic standing in for a trained classifier.
//! It sits behind the [`ParticipationModel`] trait so a real model can be
//! swapped in without touching the dispatch protocol.

use std::collections::BTreeMap;

use crate::envelope::{Prediction, PredictionLabel};
use crate::features::FeatureVector;

/// A scoring strategy: feature vector in, prediction out.
///
/// Implementations must be deterministic and stateless per call; the
/// worker invokes them from its single-threaded processing loop.
pub trait ParticipationModel: Send + Sync {
    fn predict(&self, features: &FeatureVector) -> Prediction;

    /// Version string reported in results.
    fn version(&self) -> &str;
}

/// The built-in heuristic scorer.
///
/// Scoring: a stepped base from the balance-to-cost ratio, additive
/// adjustments for interest, past participation, event popularity, timing
/// and activity, clamped to [0, 1] and mapped to a likelihood label.
#[derive(Debug, Clone)]
pub struct HeuristicModel {
    version: String,
}

impl Default for HeuristicModel {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
        }
    }
}

impl HeuristicModel {
    pub fn new() -> Self {
        Self::default()
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

impl ParticipationModel for HeuristicModel {
    fn predict(&self, features: &FeatureVector) -> Prediction {
        let balance_ratio = features.get_or("balance_ratio", 0.0);
        let interest_level = features.get_or("interest_level", 0.5);
        let past_participation = features.get_or("past_participation", 0.3);
        let fill_rate = features.get_or("fill_rate", 0.0);
        let days_to_event = features.get_or("days_to_event", 30.0);
        let transaction_count = features.get_or("transaction_count", 0.0);

        let base_score = if balance_ratio < 0.5 {
            0.2
        } else if balance_ratio < 1.0 {
            0.4
        } else if balance_ratio < 2.0 {
            0.6
        } else {
            0.8
        };

        let mut score = base_score;
        score += (interest_level - 0.5) * 0.3;
        score += (past_participation - 0.3) * 0.2;

        // A moderately full event is more attractive; a nearly full one
        // signals scarcity.
        if (0.3..=0.7).contains(&fill_rate) {
            score += 0.1;
        } else if fill_rate > 0.9 {
            score -= 0.2;
        }

        if days_to_event < 3.0 {
            score -= 0.1;
        } else if days_to_event > 60.0 {
            score -= 0.1;
        }

        if transaction_count > 5.0 {
            score += 0.1;
        }

        let score = score.clamp(0.0, 1.0);
        let label = PredictionLabel::from_confidence(score);

        let mut signals = BTreeMap::new();
        signals.insert("balance_ratio".to_string(), round2(balance_ratio));
        signals.insert("interest_level".to_string(), round2(interest_level));
        signals.insert("past_participation".to_string(), round2(past_participation));
        signals.insert("event_popularity".to_string(), round2(fill_rate));

        Prediction {
            label,
            confidence: round3(score),
            recommendation: label.recommendation().to_string(),
            signals,
            model_version: self.version.clone(),
        }
    }

    fn version(&self) -> &str {
        &self.version
    }
}
