//! Graph shaping: turns raw candidate edges into a bounded, pruned edge set
//! for one owner.
//!
//! Structural decisions work on unordered pairs whose strength is the best
//! score among the pair's typed edges; every typed edge of a surviving pair
//! is kept. Ordering ties always fall back to identifiers, so the output is
//! a deterministic function of the input set.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::{debug, warn};

use super::types::{RelationEdge, RelationType};
use crate::config::RelationsConfig;

type Pair = (String, String);

struct PairEdges {
    strength: f64,
    typed: BTreeMap<RelationType, RelationEdge>,
}

/// Shape `candidates` for `owner_id`: collapse, low-score cleanup, mutual
/// k-nearest-neighbor pruning, degree cap. Output sorted by
/// (source, target, type).
pub fn shape(owner_id: &str, candidates: Vec<RelationEdge>, cfg: &RelationsConfig) -> Vec<RelationEdge> {
    let total = candidates.len();

    // 1. Per-pair collapse
    let mut pairs: BTreeMap<Pair, PairEdges> = BTreeMap::new();
    for edge in candidates {
        if edge.owner_id != owner_id {
            warn!(owner = owner_id, edge_owner = %edge.owner_id, "dropping edge from another owner");
            continue;
        }
        if edge.source_id == edge.target_id || !edge.score.is_finite() {
            continue;
        }
        let (a, b) = edge.pair();
        let entry = pairs
            .entry((a.to_string(), b.to_string()))
            .or_insert_with(|| PairEdges {
                strength: f64::MIN,
                typed: BTreeMap::new(),
            });
        entry.strength = entry.strength.max(edge.score);
        let better = entry
            .typed
            .get(&edge.relation_type)
            .map_or(true, |existing| replaces(&edge, existing));
        if better {
            entry.typed.insert(edge.relation_type, edge);
        }
    }

    // 2. Low-score cleanup
    pairs.retain(|_, p| p.strength >= cfg.min_strength);

    let (pair_count, mutual_count, kept) = {
        let strengths: Vec<(&Pair, f64)> = pairs.iter().map(|(k, p)| (k, p.strength)).collect();

        // 3. Mutual kNN
        let mutual = mutual_knn(&strengths, cfg.mutual_k);

        // 4. Degree cap
        let kept: HashSet<Pair> = cap_degree(&mutual, cfg.degree_cap)
            .into_iter()
            .cloned()
            .collect();
        (strengths.len(), mutual.len(), kept)
    };

    let mut out: Vec<RelationEdge> = pairs
        .into_iter()
        .filter(|(key, _)| kept.contains(key))
        .flat_map(|(_, p)| p.typed.into_values())
        .collect();
    out.sort_by(|a, b| {
        (&a.source_id, &a.target_id, a.relation_type).cmp(&(&b.source_id, &b.target_id, b.relation_type))
    });

    debug!(
        owner = owner_id,
        candidates = total,
        pairs = pair_count,
        mutual = mutual_count,
        kept = kept.len(),
        edges = out.len(),
        "graph shaped"
    );
    out
}

/// For duplicate (pair, type) rows keep the higher score; on a tie keep the
/// row whose source id is smaller.
fn replaces(candidate: &RelationEdge, existing: &RelationEdge) -> bool {
    match candidate.score.total_cmp(&existing.score) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => candidate.source_id < existing.source_id,
    }
}

/// Strongest first, then by identifiers.
fn by_strength<'a>(a: (&'a str, f64), b: (&'a str, f64)) -> Ordering {
    b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0))
}

/// Keep pairs where each endpoint is among the other's `k` strongest neighbors.
fn mutual_knn<'a>(pairs: &[(&'a Pair, f64)], k: usize) -> Vec<(&'a Pair, f64)> {
    let mut neighbors: HashMap<&str, Vec<(&str, f64)>> = HashMap::new();
    for ((a, b), strength) in pairs.iter().map(|(p, s)| (*p, *s)) {
        neighbors.entry(a.as_str()).or_default().push((b.as_str(), strength));
        neighbors.entry(b.as_str()).or_default().push((a.as_str(), strength));
    }

    let top_k: HashMap<&str, HashSet<&str>> = neighbors
        .into_iter()
        .map(|(node, mut list)| {
            list.sort_by(|x, y| by_strength(*x, *y));
            (node, list.into_iter().take(k).map(|(n, _)| n).collect())
        })
        .collect();

    let in_top = |node: &str, other: &str| top_k.get(node).is_some_and(|s| s.contains(other));

    pairs
        .iter()
        .filter(|((a, b), _)| in_top(a, b) && in_top(b, a))
        .copied()
        .collect()
}

/// Walk pairs strongest first and keep one only while both endpoints are
/// below `cap` distinct neighbors.
fn cap_degree<'a>(pairs: &[(&'a Pair, f64)], cap: usize) -> HashSet<&'a Pair> {
    let mut ordered = pairs.to_vec();
    ordered.sort_by(|(pa, sa), (pb, sb)| sb.total_cmp(sa).then_with(|| pa.cmp(pb)));

    let mut degree: HashMap<&str, usize> = HashMap::new();
    let mut kept = HashSet::new();
    for (pair, _) in ordered {
        let (a, b) = (pair.0.as_str(), pair.1.as_str());
        let da = degree.get(a).copied().unwrap_or(0);
        let db = degree.get(b).copied().unwrap_or(0);
        if da < cap && db < cap {
            *degree.entry(a).or_default() += 1;
            *degree.entry(b).or_default() += 1;
            kept.insert(pair);
        }
    }
    kept
}
