//! Fact Store & Understanding Extractor: accumulates typed, scored
//! observations about a task over its lifetime.

use crate::error::FactError;
use crate::types::{Fact, FactCategory};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Score weights used by compaction: `score = confidence + category_bonus +
/// recency_bonus`.
#[derive(Clone, Copy, Debug)]
pub struct ScoringWeights {
    pub verification_error_bonus: f64,
    pub max_recency_bonus: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            verification_error_bonus: 0.15,
            max_recency_bonus: 0.05,
        }
    }
}

/// Append-only fact log with a supersession set.
///
/// Facts are never deleted. Superseding marks an older fact's id in
/// `superseded`; `get_active` filters it out but `facts` still holds it for
/// audit/replay.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FactStore {
    facts: Vec<Fact>,
    superseded: HashSet<String>,
    #[serde(default = "default_max_facts")]
    max_facts: usize,
}

fn default_max_facts() -> usize {
    15
}

impl FactStore {
    pub fn new(max_facts: usize) -> Self {
        Self {
            facts: Vec::new(),
            superseded: HashSet::new(),
            max_facts,
        }
    }

    /// Adds a fact, applying automatic supersession: a newer fact whose
    /// category matches an existing active fact and whose canonical subject
    /// (the leading clause of the statement up to the first parenthesis or
    /// colon) matches supersedes that older fact.
    pub fn add(&mut self, mut fact: Fact) -> Result<(), FactError> {
        if let Some(explicit) = fact.supersedes.clone() {
            if !self.facts.iter().any(|f| f.id == explicit) {
                return Err(FactError::SupersedesMissing(explicit));
            }
            self.superseded.insert(explicit);
        } else if let Some(older_id) = self.find_supersession_target(&fact) {
            fact.supersedes = Some(older_id.clone());
            self.superseded.insert(older_id);
        }
        self.facts.push(fact);
        self.compact();
        Ok(())
    }

    fn find_supersession_target(&self, incoming: &Fact) -> Option<String> {
        let subject = canonical_subject(&incoming.statement);
        self.get_active()
            .into_iter()
            .find(|f| f.category == incoming.category && canonical_subject(&f.statement) == subject)
            .map(|f| f.id.clone())
    }

    /// Active facts: those not in the superseded set, in insertion order.
    pub fn get_active(&self) -> Vec<&Fact> {
        self.facts
            .iter()
            .filter(|f| !self.superseded.contains(&f.id))
            .collect()
    }

    pub fn get_by_category(&self, category: FactCategory) -> Vec<&Fact> {
        self.get_active()
            .into_iter()
            .filter(|f| f.category == category)
            .collect()
    }

    pub fn get_recent(&self, n: usize) -> Vec<&Fact> {
        let active = self.get_active();
        let start = active.len().saturating_sub(n);
        active[start..].to_vec()
    }

    pub fn get_high_confidence(&self, threshold: f64) -> Vec<&Fact> {
        self.get_active()
            .into_iter()
            .filter(|f| f.confidence >= threshold)
            .collect()
    }

    pub fn all(&self) -> &[Fact] {
        &self.facts
    }

    pub fn is_superseded(&self, id: &str) -> bool {
        self.superseded.contains(id)
    }

    /// Compacts active facts down to `max_facts` by score. Superseded
    /// facts are unaffected; they are already excluded from
    /// `get_active` and compaction never touches the underlying log.
    pub fn compact(&mut self) {
        self.compact_with(ScoringWeights::default());
    }

    /// Read-only: the `n` active facts with the highest score, in descending
    /// score order. Unlike `compact`, does not mark anything superseded —
    /// used by context building to pick a bounded view without mutating the
    /// durable store.
    pub fn top_by_score(&self, n: usize) -> Vec<&Fact> {
        let weights = ScoringWeights::default();
        let active = self.get_active();
        let latest_step = self.facts.iter().map(|f| f.step).max().unwrap_or(0).max(1);
        let mut scored: Vec<(&Fact, f64)> = active
            .into_iter()
            .map(|f| (f, score(f, weights, latest_step)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().take(n).map(|(f, _)| f).collect()
    }

    pub fn compact_with(&mut self, weights: ScoringWeights) {
        let active_ids: Vec<String> = self.get_active().into_iter().map(|f| f.id.clone()).collect();
        if active_ids.len() <= self.max_facts {
            return;
        }
        let latest_step = self.facts.iter().map(|f| f.step).max().unwrap_or(0).max(1);
        let mut scored: Vec<(String, f64)> = active_ids
            .iter()
            .map(|id| {
                let fact = self.facts.iter().find(|f| &f.id == id).expect("active id exists");
                (id.clone(), score(fact, weights, latest_step))
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        for (id, _) in scored.into_iter().skip(self.max_facts) {
            self.superseded.insert(id);
        }
    }
}

fn score(fact: &Fact, weights: ScoringWeights, latest_step: u32) -> f64 {
    let category_bonus = match fact.category {
        FactCategory::Verification | FactCategory::Error => weights.verification_error_bonus,
        _ => 0.0,
    };
    let recency_bonus = weights.max_recency_bonus * (fact.step as f64 / latest_step as f64);
    fact.confidence + category_bonus + recency_bonus.min(weights.max_recency_bonus)
}

/// The leading clause of a statement, used as the canonical subject for
/// supersession matching (e.g. `"Check foo passed"` and
/// `"Check foo: complexity 12"` share subject `"Check foo"`).
fn canonical_subject(statement: &str) -> String {
    let cut = statement
        .find(|c: char| c == ':' || c == '(')
        .unwrap_or(statement.len());
    statement[..cut].trim().to_lowercase()
}
