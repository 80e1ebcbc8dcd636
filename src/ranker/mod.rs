//! Candidate ranker
//!
//! Aggregates extracted property usage over the trailing window and selects a
//! bounded top-N set for materialization. Selection is deterministic: identical
//! aggregates always yield the identical ordered candidate list (score desc,
//! then usage count desc, then lexicographic property path).
//!
//! The benefit formula is a reconstruction, not gospel, so it lives behind
//! [`BenefitModel`]; swapping the heuristic never touches selection mechanics.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::PipelineConfig;
use crate::extractor;
use crate::query_log::QueryRecord;
use crate::schema_mutator::derive_column_name;
use crate::state::{state_key, CandidateState, MaterializationCandidate, StateStore};

/// Observed usage of one (table, property) pair across a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyUsage {
    /// Qualified `db.table`
    pub table: String,
    pub property: String,
    /// Number of queries that accessed the property
    pub count: u64,
    pub total_duration_ms: u64,
    pub total_read_bytes: u64,
}

impl PropertyUsage {
    pub fn avg_duration_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_duration_ms as f64 / self.count as f64
        }
    }
}

/// Usage aggregates for one window, plus mining counters for the cycle report.
#[derive(Debug, Default, Clone)]
pub struct UsageAggregate {
    /// Keyed by `db.table::property`; BTreeMap keeps iteration deterministic
    pub usages: BTreeMap<String, PropertyUsage>,
    pub records_scanned: usize,
    pub parse_skips: usize,
}

/// Fold extracted property accesses from every record into per-property
/// aggregates. Records for tables outside the watch list are ignored.
pub fn aggregate(records: &[QueryRecord], config: &PipelineConfig) -> UsageAggregate {
    let mut agg = UsageAggregate::default();

    for record in records {
        let Some(watched) = config.watched_table(&record.table) else {
            continue;
        };
        agg.records_scanned += 1;

        let outcome = extractor::extract_properties(record, &watched.json_column);
        agg.parse_skips += outcome.skipped;

        for property in outcome.properties {
            let entry = agg
                .usages
                .entry(state_key(&record.table, &property))
                .or_insert_with(|| PropertyUsage {
                    table: record.table.clone(),
                    property,
                    count: 0,
                    total_duration_ms: 0,
                    total_read_bytes: 0,
                });
            entry.count += 1;
            entry.total_duration_ms += record.duration_ms;
            entry.total_read_bytes += record.read_bytes;
        }
    }

    agg
}

/// Estimates the per-query cost saved by materializing a property.
///
/// The production scoring formula is unknown; implementations are replaceable
/// heuristics behind this stable interface.
pub trait BenefitModel: Send + Sync {
    fn estimated_saving_ms(&self, usage: &PropertyUsage) -> f64;
}

/// Static heuristic: a fixed fraction of the observed average duration is
/// attributed to raw JSON extraction and assumed saved.
pub struct StaticSavingsModel {
    pub factor: f64,
}

impl BenefitModel for StaticSavingsModel {
    fn estimated_saving_ms(&self, usage: &PropertyUsage) -> f64 {
        usage.avg_duration_ms() * self.factor
    }
}

/// benefit = usage_count x estimated per-query saving
pub fn benefit_score(usage: &PropertyUsage, model: &dyn BenefitModel) -> f64 {
    usage.count as f64 * model.estimated_saving_ms(usage)
}

/// Select up to `top_n` new candidates from the window's aggregates.
///
/// Properties already Materialized or Pending in the store are never
/// re-selected; Failed ones are eligible again. Idempotent over its inputs.
pub fn select_candidates(
    agg: &UsageAggregate,
    store: &StateStore,
    config: &PipelineConfig,
    model: &dyn BenefitModel,
) -> Vec<MaterializationCandidate> {
    let mut excluded: BTreeMap<String, HashSet<String>> = BTreeMap::new();
    for watched in &config.watched_tables {
        let qualified = watched.qualified_name();
        let props = store.excluded_properties(&qualified);
        excluded.insert(qualified, props);
    }

    let mut scored: Vec<(&PropertyUsage, f64)> = agg
        .usages
        .values()
        .filter(|u| u.count >= config.min_usage_threshold)
        .filter(|u| {
            excluded
                .get(&u.table)
                .map(|props| !props.contains(&u.property))
                .unwrap_or(true)
        })
        .map(|u| (u, benefit_score(u, model)))
        .collect();

    scored.sort_by(|(a, score_a), (b, score_b)| {
        score_b
            .partial_cmp(score_a)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.count.cmp(&a.count))
            .then_with(|| a.property.cmp(&b.property))
            .then_with(|| a.table.cmp(&b.table))
    });

    let now = Utc::now();
    scored
        .into_iter()
        .take(config.top_n)
        .map(|(usage, score)| MaterializationCandidate {
            table: usage.table.clone(),
            property: usage.property.clone(),
            column: derive_column_name(&usage.property),
            score,
            usage_count: usage.count,
            state: CandidateState::NotMaterialized,
            selected_at: now,
        })
        .collect()
}
