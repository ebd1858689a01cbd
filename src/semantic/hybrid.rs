//! Rank fusion for hybrid search.
//!
//! Merges independently scored lists (vector similarity, keyword relevance)
//! with Reciprocal Rank Fusion:
//!
//!   rrf(d) = Σ_sources 1/(k + rank_source(d))
//!
//! Ranks are 1-based. A larger `k` flattens the gap between top and lower
//! ranks. Sources that do not contain `d` contribute nothing.
//!
//! The top slice of the fused list can then be refined by a reranker using
//! position-aware blending, where the retrieval/reranker weight split depends
//! on the candidate's pre-rerank rank.

use std::collections::HashMap;

use serde::Serialize;

use crate::config::BlendWeights;

/// Where a ranked list came from.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RankSource {
    Vector,
    Keyword,
    Named(String),
}

/// A single source's raw, source-scaled relevance for one skill.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RankerResult {
    pub skill_name: String,
    pub score: f32,
}

impl RankerResult {
    pub fn new(skill_name: impl Into<String>, score: f32) -> Self {
        Self {
            skill_name: skill_name.into(),
            score,
        }
    }
}

/// One ranked list to fuse.
#[derive(Clone, Debug, PartialEq)]
pub struct RrfInput {
    pub source: RankSource,
    pub results: Vec<RankerResult>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SourceRank {
    pub source: RankSource,
    /// 1-based
    pub rank: usize,
}

/// Fused score plus the ranks that produced it.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RrfRanking {
    pub skill_name: String,
    pub rrf_score: f32,
    pub ranks: Vec<SourceRank>,
}

impl RrfRanking {
    pub fn rank_in(&self, source: &RankSource) -> Option<usize> {
        self.ranks
            .iter()
            .find(|r| &r.source == source)
            .map(|r| r.rank)
    }
}

fn by_score_desc(a: f32, b: f32) -> std::cmp::Ordering {
    b.partial_cmp(&a).unwrap_or(std::cmp::Ordering::Equal)
}

/// Accumulates per-skill entries in first-seen order.
#[derive(Default)]
struct Accumulator {
    positions: HashMap<String, usize>,
    rankings: Vec<RrfRanking>,
}

impl Accumulator {
    fn entry(&mut self, skill_name: &str) -> &mut RrfRanking {
        let index = match self.positions.get(skill_name) {
            Some(&index) => index,
            None => {
                self.positions
                    .insert(skill_name.to_string(), self.rankings.len());
                self.rankings.push(RrfRanking {
                    skill_name: skill_name.to_string(),
                    rrf_score: 0.0,
                    ranks: Vec::new(),
                });
                self.rankings.len() - 1
            }
        };
        &mut self.rankings[index]
    }

    fn into_sorted(mut self) -> Vec<RrfRanking> {
        // Stable: ties keep first-seen order
        self.rankings
            .sort_by(|a, b| by_score_desc(a.rrf_score, b.rrf_score));
        self.rankings
    }
}

/// Fuse ranked lists with Reciprocal Rank Fusion.
///
/// Each source is sorted by raw score (descending) before ranks are assigned,
/// so inputs need not be pre-sorted. A skill listed twice in one source only
/// counts at its best rank.
///
/// # Returns
/// One entry per distinct skill, sorted by RRF score (highest first).
pub fn reciprocal_rank_fusion(inputs: &[RrfInput], k: f32) -> Vec<RrfRanking> {
    let mut acc = Accumulator::default();

    for input in inputs {
        let mut ordered: Vec<&RankerResult> = input.results.iter().collect();
        ordered.sort_by(|a, b| by_score_desc(a.score, b.score));

        let mut rank = 0;
        for result in ordered {
            let entry = acc.entry(&result.skill_name);
            if entry.rank_in(&input.source).is_some() {
                continue;
            }
            rank += 1;
            entry.rrf_score += 1.0 / (k + rank as f32);
            entry.ranks.push(SourceRank {
                source: input.source.clone(),
                rank,
            });
        }
    }

    acc.into_sorted()
}

/// Min-max scale scores into `[0, 1]`.
///
/// A list with zero range (including a single entry) maps every score to 1.
pub fn normalize_scores(results: &[RankerResult]) -> Vec<RankerResult> {
    let (min, max) = results
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), r| {
            (lo.min(r.score), hi.max(r.score))
        });
    let range = max - min;

    results
        .iter()
        .map(|r| RankerResult {
            skill_name: r.skill_name.clone(),
            score: if range > 0.0 {
                (r.score - min) / range
            } else {
                1.0
            },
        })
        .collect()
}

/// Normalize each list, scale it by its weight and sum per skill.
///
/// Unlike RRF this honors raw score gaps and gives deterministic source
/// priority through the weights.
pub fn weighted_combine(sources: &[(&[RankerResult], f32)]) -> Vec<RankerResult> {
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut combined: Vec<RankerResult> = Vec::new();

    for (results, weight) in sources {
        for result in normalize_scores(results) {
            let contribution = result.score * weight;
            match positions.get(&result.skill_name) {
                Some(&index) => combined[index].score += contribution,
                None => {
                    positions.insert(result.skill_name.clone(), combined.len());
                    combined.push(RankerResult {
                        skill_name: result.skill_name,
                        score: contribution,
                    });
                }
            }
        }
    }

    combined.sort_by(|a, b| by_score_desc(a.score, b.score));
    combined
}

/// Combine two fused rankings with an explicit weight split.
///
/// `score = w·primary + (1-w)·secondary`, with `w` clamped to `[0, 1]`.
/// Rank provenance from both sides is kept.
pub fn merge_rankings(
    primary: &[RrfRanking],
    secondary: &[RrfRanking],
    primary_weight: f32,
) -> Vec<RrfRanking> {
    let primary_weight = primary_weight.clamp(0.0, 1.0);
    let mut acc = Accumulator::default();

    for (rankings, weight) in [(primary, primary_weight), (secondary, 1.0 - primary_weight)] {
        for ranking in rankings {
            let entry = acc.entry(&ranking.skill_name);
            entry.rrf_score += ranking.rrf_score * weight;
            entry.ranks.extend(ranking.ranks.iter().cloned());
        }
    }

    acc.into_sorted()
}

/// A reranked candidate with its blend inputs.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BlendedCandidate {
    pub skill_name: String,
    /// 1-based position in the pre-rerank window
    pub rank: usize,
    /// rrf / max rrf in window
    pub retrieval_score: f32,
    /// reranker / max reranker in window
    pub reranker_score: f32,
    pub blended_score: f32,
}

/// Blend retrieval and reranker scores for a window of RRF candidates.
///
/// Both signals are scaled by their maximum inside the window. The weight
/// pair comes from the candidate's rank bucket. Candidates the reranker did
/// not score, and negative reranker scores, count as 0.
///
/// # Returns
/// The window sorted by blended score (highest first).
pub fn position_aware_blend(
    window: &[RrfRanking],
    reranker_scores: &HashMap<String, f32>,
    weights: &BlendWeights,
) -> Vec<BlendedCandidate> {
    let reranker_of = |name: &str| reranker_scores.get(name).copied().unwrap_or(0.0).max(0.0);

    let max_rrf = window.iter().map(|r| r.rrf_score).fold(0.0, f32::max);
    let max_reranker = window
        .iter()
        .map(|r| reranker_of(&r.skill_name))
        .fold(0.0, f32::max);

    let scale = |value: f32, max: f32| if max > 0.0 { value / max } else { 0.0 };

    let mut blended: Vec<BlendedCandidate> = window
        .iter()
        .enumerate()
        .map(|(i, ranking)| {
            let rank = i + 1;
            let retrieval_score = scale(ranking.rrf_score, max_rrf);
            let reranker_score = scale(reranker_of(&ranking.skill_name), max_reranker);
            let pair = weights.for_rank(rank);

            BlendedCandidate {
                skill_name: ranking.skill_name.clone(),
                rank,
                retrieval_score,
                reranker_score,
                blended_score: retrieval_score * pair.retrieval + reranker_score * pair.reranker,
            }
        })
        .collect();

    blended.sort_by(|a, b| by_score_desc(a.blended_score, b.blended_score));
    blended
}

/// Final ordering entry produced from a fused list.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ScoredCandidate {
    pub skill_name: String,
    pub rrf_score: f32,
    pub ranks: Vec<SourceRank>,
    pub reranker_score: Option<f32>,
    pub blended_score: Option<f32>,
    /// Ordering score in `[0, 1]`
    pub score: f32,
}

/// Turn a fused list into the final, scored order.
///
/// Without blending, order is the RRF order and `score = rrf / max rrf`.
/// With blending, the first `window` candidates are reordered by blended
/// score; the rest keep RRF order after them, with scores capped at the
/// lowest blended score so they can never outrank a reranked candidate.
pub fn finalize_ranking(
    rankings: Vec<RrfRanking>,
    reranker_scores: Option<&HashMap<String, f32>>,
    window: usize,
    blend: Option<&BlendWeights>,
) -> Vec<ScoredCandidate> {
    let max_rrf = rankings.iter().map(|r| r.rrf_score).fold(0.0, f32::max);
    let normalized = |rrf: f32| if max_rrf > 0.0 { rrf / max_rrf } else { 0.0 };
    let window = window.min(rankings.len());

    let into_candidate = |ranking: RrfRanking, in_window: bool| ScoredCandidate {
        reranker_score: reranker_scores
            .filter(|_| in_window)
            .and_then(|scores| scores.get(&ranking.skill_name).copied()),
        blended_score: None,
        score: normalized(ranking.rrf_score),
        skill_name: ranking.skill_name,
        rrf_score: ranking.rrf_score,
        ranks: ranking.ranks,
    };

    let (Some(scores), Some(weights)) = (reranker_scores, blend) else {
        return rankings
            .into_iter()
            .enumerate()
            .map(|(i, ranking)| into_candidate(ranking, i < window))
            .collect();
    };

    let blended = position_aware_blend(&rankings[..window], scores, weights);
    let floor = blended
        .iter()
        .map(|b| b.blended_score)
        .fold(f32::INFINITY, f32::min);

    let mut by_name: HashMap<String, RrfRanking> = HashMap::new();
    let mut tail = Vec::with_capacity(rankings.len() - window);
    for (i, ranking) in rankings.into_iter().enumerate() {
        if i < window {
            by_name.insert(ranking.skill_name.clone(), ranking);
        } else {
            tail.push(ranking);
        }
    }

    let mut result: Vec<ScoredCandidate> = blended
        .into_iter()
        .filter_map(|b| {
            let ranking = by_name.remove(&b.skill_name)?;
            let mut candidate = into_candidate(ranking, true);
            candidate.blended_score = Some(b.blended_score);
            candidate.score = b.blended_score;
            Some(candidate)
        })
        .collect();

    result.extend(tail.into_iter().map(|ranking| {
        let mut candidate = into_candidate(ranking, false);
        candidate.score = candidate.score.min(floor);
        candidate
    }));

    result
}
