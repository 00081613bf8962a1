//! Feature-vector derivation for the prediction model.
//!
//! The vector is ephemeral: derived per task from the feature store
//! records plus the caller's hints, fed to the model, then discarded.
//! Derivation is deterministic and never fails; adapter errors are the
//! caller's concern and must be handled before calling [`extract`].

use std::collections::BTreeMap;

use chrono::Utc;
use serde::Serialize;

use crate::envelope::{hint_number, HintMap};
use crate::store::{Event, Transaction, User};

/// Default fill rate for events with no participant cap.
const UNCAPPED_FILL_RATE: f64 = 0.1;

/// Default days-to-event for unscheduled events.
const DEFAULT_DAYS_TO_EVENT: f64 = 30.0;

/// Named numeric inputs for one prediction.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FeatureVector {
    values: BTreeMap<String, f64>,
}

impl FeatureVector {
    pub fn insert(&mut self, name: impl Into<String>, value: f64) {
        self.values.insert(name.into(), value);
    }

    /// Looks up a feature, falling back to the supplied default.
    pub fn get_or(&self, name: &str, default: f64) -> f64 {
        self.values.get(name).copied().unwrap_or(default)
    }

    /// Feature names in deterministic (sorted) order.
    pub fn names(&self) -> Vec<String> {
        self.values.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Derives the feature vector for one (user, event) pair.
///
/// `transactions` is the user's history, newest first. Hints default to
/// fixed midpoints when absent: interest 0.5, past participation 0.3,
/// event-type preference 0.5.
pub fn extract(
    user: &User,
    event: &Event,
    transactions: &[Transaction],
    hints: &HintMap,
) -> FeatureVector {
    let now = Utc::now();
    let mut features = FeatureVector::default();

    features.insert("user_balance", user.balance);
    features.insert("event_cost", event.cost);
    // Cost is floored at 1 so a free event cannot divide by zero.
    features.insert("balance_ratio", user.balance / event.cost.max(1.0));
    features.insert("current_participants", event.current_participants as f64);

    features.insert("transaction_count", transactions.len() as f64);
    let total: f64 = transactions.iter().map(|t| t.amount).sum();
    features.insert(
        "avg_transaction_amount",
        total / (transactions.len().max(1) as f64),
    );

    let fill_rate = match event.max_participants {
        Some(cap) if cap > 0 => event.current_participants as f64 / cap as f64,
        _ => UNCAPPED_FILL_RATE,
    };
    features.insert("fill_rate", fill_rate);

    let days_to_event = match event.event_date {
        Some(date) => (date - now).num_days().max(0) as f64,
        None => DEFAULT_DAYS_TO_EVENT,
    };
    features.insert("days_to_event", days_to_event);

    features.insert("interest_level", hint_number(hints, "interest_level", 0.5));
    features.insert(
        "past_participation",
        hint_number(hints, "past_participation", 0.3),
    );
    features.insert(
        "event_type_preference",
        hint_number(hints, "event_type_preference", 0.5),
    );

    features.insert("is_admin", if user.role.is_admin() { 1.0 } else { 0.0 });

    let account_age_days = (now - user.created_at).num_days() as f64;
    features.insert("account_age_days", account_age_days);
    features.insert("account_age_weeks", account_age_days / 7.0);

    features
}
