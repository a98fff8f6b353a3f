//! Reciprocal Rank Fusion over heterogeneous agent rankings.
//!
//! Agent scores live on unrelated scales, so only rank position is compared:
//! an item at rank `r` in some agent's list contributes `1 / (k + r)` and
//! contributions for the same citation are summed across agents.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::envelope::{AgentId, AgentResult};
use crate::error::DocketError;

/// Conventional RRF smoothing constant
pub const DEFAULT_RRF_K: f64 = 60.0;

/// Fusion parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Smoothing constant; larger values flatten the rank curve
    pub k: f64,
    /// Keep only the best `top_n` fused items
    pub top_n: Option<usize>,
}

impl FusionConfig {
    pub fn with_k(k: f64) -> Self {
        Self { k, ..Self::default() }
    }

    pub fn validate(&self) -> Result<(), DocketError> {
        if !self.k.is_finite() || self.k < 0.0 {
            return Err(DocketError::Config(format!(
                "fusion.k must be a finite non-negative number, got {}",
                self.k
            )));
        }
        Ok(())
    }
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            k: DEFAULT_RRF_K,
            top_n: None,
        }
    }
}

/// One deduplicated item of the fused ranking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedItem {
    /// Empty when no agent supplied one; the item is then identified by content
    pub citation: String,
    /// Content of the best-ranked occurrence
    pub content: String,
    /// Sum of reciprocal-rank contributions
    pub score: f64,
    /// Lowest rank this item had in any agent's list
    pub best_rank: usize,
    /// Agent that produced the best-ranked occurrence
    pub best_agent: AgentId,
    /// That agent's own score, kept for display only
    pub agent_score: f64,
    /// Every agent that returned the item, sorted
    pub sources: Vec<AgentId>,
}

/// Identity used for deduplication: the citation, or the content when an
/// agent returned no citation. The two never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum Identity<'a> {
    Citation(&'a str),
    Content(&'a str),
}

fn identity(item: &AgentResult) -> Identity<'_> {
    if item.citation.is_empty() {
        Identity::Content(&item.content)
    } else {
        Identity::Citation(&item.citation)
    }
}

/// Fuse per-agent rankings into one deterministic list.
///
/// Items repeated inside one agent's list count once, at their best rank.
/// Ordering: fused score descending, then best rank ascending, then citation,
/// then content.
pub fn fuse(results: &BTreeMap<AgentId, Vec<AgentResult>>, config: &FusionConfig) -> Vec<FusedItem> {
    let mut fused: HashMap<Identity<'_>, FusedItem> = HashMap::new();

    for (agent_id, items) in results {
        let mut best_per_key: BTreeMap<Identity<'_>, (usize, &AgentResult)> = BTreeMap::new();
        for (position, item) in items.iter().enumerate() {
            let rank = if item.rank == 0 { position + 1 } else { item.rank };
            best_per_key
                .entry(identity(item))
                .and_modify(|best| {
                    if rank < best.0 {
                        *best = (rank, item);
                    }
                })
                .or_insert((rank, item));
        }

        for (key, (rank, item)) in best_per_key {
            let contribution = 1.0 / (config.k + rank as f64);
            match fused.get_mut(&key) {
                Some(existing) => {
                    existing.score += contribution;
                    existing.sources.push(agent_id.clone());
                    if rank < existing.best_rank {
                        existing.best_rank = rank;
                        existing.best_agent = agent_id.clone();
                        existing.content = item.content.clone();
                        existing.agent_score = item.score;
                    }
                }
                None => {
                    fused.insert(
                        key,
                        FusedItem {
                            citation: item.citation.clone(),
                            content: item.content.clone(),
                            score: contribution,
                            best_rank: rank,
                            best_agent: agent_id.clone(),
                            agent_score: item.score,
                            sources: vec![agent_id.clone()],
                        },
                    );
                }
            }
        }
    }

    let mut ranked: Vec<FusedItem> = fused.into_values().collect();
    ranked.sort_by(compare);
    if let Some(top_n) = config.top_n {
        ranked.truncate(top_n);
    }
    ranked
}

fn compare(a: &FusedItem, b: &FusedItem) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.best_rank.cmp(&b.best_rank))
        .then_with(|| a.citation.cmp(&b.citation))
        .then_with(|| a.content.cmp(&b.content))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranked(agent: &str, citations: &[&str]) -> (AgentId, Vec<AgentResult>) {
        let agent_id = AgentId::new(agent);
        let items = citations
            .iter()
            .enumerate()
            .map(|(i, c)| AgentResult {
                agent_id: agent_id.clone(),
                rank: i + 1,
                score: 100.0 - i as f64,
                citation: c.to_string(),
                content: format!("{agent}:{c}"),
            })
            .collect();
        (agent_id, items)
    }

    fn inputs(lists: &[(&str, &[&str])]) -> BTreeMap<AgentId, Vec<AgentResult>> {
        lists.iter().map(|(a, c)| ranked(a, c)).collect()
    }

    fn citations(items: &[FusedItem]) -> Vec<&str> {
        items.iter().map(|i| i.citation.as_str()).collect()
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn test_two_agent_example() {
        let input = inputs(&[("a", &["p1", "p2", "p3"]), ("b", &["p2", "p4"])]);
        let fused = fuse(&input, &FusionConfig::default());

        assert_eq!(citations(&fused), vec!["p2", "p1", "p4", "p3"]);
        assert!(approx(fused[0].score, 1.0 / 62.0 + 1.0 / 61.0));
        assert!((fused[0].score - 0.03252).abs() < 1e-4);
        assert!(approx(fused[1].score, 1.0 / 61.0));
        assert!(approx(fused[2].score, 1.0 / 62.0));
        assert!(approx(fused[3].score, 1.0 / 63.0));
    }

    #[test]
    fn test_duplicate_citation_merges_contributions() {
        let input = inputs(&[("a", &["x"]), ("b", &["y", "x"])]);
        let fused = fuse(&input, &FusionConfig::default());

        let x: Vec<&FusedItem> = fused.iter().filter(|i| i.citation == "x").collect();
        assert_eq!(x.len(), 1);
        assert!(approx(x[0].score, 1.0 / 61.0 + 1.0 / 62.0));
        assert_eq!(x[0].best_rank, 1);
        assert_eq!(x[0].best_agent, AgentId::new("a"));
        assert_eq!(x[0].content, "a:x");
        assert_eq!(x[0].sources, vec![AgentId::new("a"), AgentId::new("b")]);
    }

    #[test]
    fn test_repeat_within_one_agent_counts_once() {
        let input = inputs(&[("a", &["x", "y", "x"])]);
        let fused = fuse(&input, &FusionConfig::default());
        assert_eq!(fused.len(), 2);
        assert!(approx(fused[0].score, 1.0 / 61.0));
    }

    #[test]
    fn test_ties_break_on_rank_then_citation() {
        let input = inputs(&[("a", &["zeta", "beta"]), ("b", &["alpha", "gamma"])]);
        let fused = fuse(&input, &FusionConfig::default());
        assert_eq!(citations(&fused), vec!["alpha", "zeta", "beta", "gamma"]);
    }

    #[test]
    fn test_deterministic() {
        let input = inputs(&[
            ("local", &["c1", "c2", "c3", "c4"]),
            ("global", &["c3", "c5", "c1"]),
            ("drift", &["c6", "c2"]),
        ]);
        let config = FusionConfig::default();
        let first = fuse(&input, &config);
        for _ in 0..10 {
            assert_eq!(fuse(&input, &config), first);
        }
    }

    #[test]
    fn test_empty_lists() {
        let input = inputs(&[("a", &[]), ("b", &[])]);
        assert!(fuse(&input, &FusionConfig::default()).is_empty());
        assert!(fuse(&BTreeMap::new(), &FusionConfig::default()).is_empty());
    }

    #[test]
    fn test_k_changes_weighting() {
        let input = inputs(&[("a", &["p1", "p2"])]);
        let fused = fuse(&input, &FusionConfig::with_k(0.0));
        assert!(approx(fused[0].score, 1.0));
        assert!(approx(fused[1].score, 0.5));
    }

    #[test]
    fn test_top_n_truncates_after_sort() {
        let input = inputs(&[("a", &["p1", "p2", "p3"]), ("b", &["p3"])]);
        let config = FusionConfig { k: 60.0, top_n: Some(1) };
        let fused = fuse(&input, &config);
        assert_eq!(citations(&fused), vec!["p3"]);
    }

    #[test]
    fn test_missing_citation_falls_back_to_content() {
        let agent = AgentId::new("a");
        let item = |content: &str| AgentResult {
            agent_id: agent.clone(),
            rank: 1,
            score: 1.0,
            citation: String::new(),
            content: content.into(),
        };
        let input: BTreeMap<_, _> = [
            (agent.clone(), vec![item("same text")]),
            (AgentId::new("b"), vec![item("same text")]),
        ]
        .into_iter()
        .collect();
        let fused = fuse(&input, &FusionConfig::default());
        assert_eq!(fused.len(), 1);
        assert!(fused[0].citation.is_empty());
        assert_eq!(fused[0].content, "same text");
        assert_eq!(fused[0].sources.len(), 2);
    }

    #[test]
    fn test_content_identity_does_not_merge_with_citation() {
        let agent = AgentId::new("a");
        let input: BTreeMap<_, _> = [(
            agent.clone(),
            vec![
                AgentResult {
                    agent_id: agent.clone(),
                    rank: 1,
                    score: 1.0,
                    citation: "p1".into(),
                    content: "first".into(),
                },
                AgentResult {
                    agent_id: agent.clone(),
                    rank: 2,
                    score: 0.5,
                    citation: String::new(),
                    content: "p1".into(),
                },
            ],
        )]
        .into_iter()
        .collect();

        let fused = fuse(&input, &FusionConfig::default());
        assert_eq!(citations(&fused), vec!["p1", ""]);
        assert_eq!(fused[1].content, "p1");
    }

    #[test]
    fn test_validate_k() {
        assert!(FusionConfig::default().validate().is_ok());
        assert!(FusionConfig::with_k(-1.0).validate().is_err());
        assert!(FusionConfig::with_k(f64::NAN).validate().is_err());
    }
}
