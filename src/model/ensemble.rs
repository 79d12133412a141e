//! Tree ensembles: a bagged random forest and a log-loss gradient booster.

use rand::Rng;

use super::calibration::{logit, sigmoid};
use super::tree::{RegressionTree, TreeParams};

/// Which ensemble a classifier fits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ModelKind {
    #[default]
    RandomForest,
    GradientBoosting,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForestParams {
    pub n_trees: usize,
    pub max_depth: usize,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_trees: 200,
            max_depth: 12,
            min_samples_split: 10,
            min_samples_leaf: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoostingParams {
    pub n_trees: usize,
    pub max_depth: usize,
    pub learning_rate: f64,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
}

impl Default for BoostingParams {
    fn default() -> Self {
        Self {
            n_trees: 150,
            max_depth: 6,
            learning_rate: 0.08,
            min_samples_split: 10,
            min_samples_leaf: 5,
        }
    }
}

/// Bootstrap-aggregated probability trees with balanced class weights and
/// √m features per node.
#[derive(Debug, Clone)]
pub struct RandomForest {
    trees: Vec<RegressionTree>,
}

impl RandomForest {
    pub fn fit<R: Rng>(
        x: &[Vec<f64>],
        y: &[u8],
        sample_weights: &[f64],
        params: &ForestParams,
        rng: &mut R,
    ) -> Self {
        let n = x.len();
        let n_features = x.first().map(Vec::len).unwrap_or(0);
        let targets: Vec<f64> = y.iter().map(|&v| f64::from(v)).collect();
        let class_weight = balanced_class_weights(y);
        let weights: Vec<f64> = y
            .iter()
            .zip(sample_weights)
            .map(|(&label, &w)| class_weight[usize::from(label.min(1))] * w)
            .collect();

        let tree_params = TreeParams {
            max_depth: params.max_depth,
            min_samples_split: params.min_samples_split,
            min_samples_leaf: params.min_samples_leaf,
            max_features: Some(((n_features as f64).sqrt().floor() as usize).max(1)),
        };

        let trees = (0..params.n_trees)
            .map(|_| {
                let bootstrap: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();
                RegressionTree::fit(x, &targets, &weights, &bootstrap, &tree_params, rng)
            })
            .collect();
        Self { trees }
    }

    /// Positive-class probability from every tree.
    pub fn tree_probabilities(&self, row: &[f64]) -> Vec<f64> {
        self.trees
            .iter()
            .map(|t| t.predict(row).clamp(0.0, 1.0))
            .collect()
    }

    pub fn predict_proba(&self, row: &[f64]) -> f64 {
        let probs = self.tree_probabilities(row);
        if probs.is_empty() {
            return 0.5;
        }
        probs.iter().sum::<f64>() / probs.len() as f64
    }

    #[cfg(test)]
    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }
}

/// `n / (classes · n_class)`, the usual "balanced" weighting.
fn balanced_class_weights(y: &[u8]) -> [f64; 2] {
    let positives = y.iter().filter(|&&v| v > 0).count();
    let negatives = y.len() - positives;
    if positives == 0 || negatives == 0 {
        return [1.0, 1.0];
    }
    let n = y.len() as f64;
    [n / (2.0 * negatives as f64), n / (2.0 * positives as f64)]
}

/// Binary log-loss gradient boosting with Newton-step leaves.
#[derive(Debug, Clone)]
pub struct GradientBoosting {
    init: f64,
    learning_rate: f64,
    trees: Vec<RegressionTree>,
}

impl GradientBoosting {
    pub fn fit<R: Rng>(
        x: &[Vec<f64>],
        y: &[u8],
        sample_weights: &[f64],
        params: &BoostingParams,
        rng: &mut R,
    ) -> Self {
        let n = x.len();
        let targets: Vec<f64> = y.iter().map(|&v| f64::from(v)).collect();
        let total_w: f64 = sample_weights.iter().sum();
        let prior = if total_w > 0.0 {
            targets
                .iter()
                .zip(sample_weights)
                .map(|(t, w)| t * w)
                .sum::<f64>()
                / total_w
        } else {
            0.5
        };
        let init = logit(prior);

        let tree_params = TreeParams {
            max_depth: params.max_depth,
            min_samples_split: params.min_samples_split,
            min_samples_leaf: params.min_samples_leaf,
            max_features: None,
        };
        let all: Vec<usize> = (0..n).collect();
        let mut scores = vec![init; n];
        let mut trees = Vec::with_capacity(params.n_trees);

        for _ in 0..params.n_trees {
            let probs: Vec<f64> = scores.iter().map(|&s| sigmoid(s)).collect();
            let residuals: Vec<f64> = targets.iter().zip(&probs).map(|(t, p)| t - p).collect();

            let mut tree =
                RegressionTree::fit(x, &residuals, sample_weights, &all, &tree_params, rng);
            tree.refit_leaves(x, &all, |members| {
                let (mut num, mut den) = (0.0, 0.0);
                for &i in members {
                    num += sample_weights[i] * residuals[i];
                    den += sample_weights[i] * probs[i] * (1.0 - probs[i]);
                }
                if den.abs() < 1e-150 {
                    0.0
                } else {
                    num / den
                }
            });

            for (score, row) in scores.iter_mut().zip(x) {
                *score += params.learning_rate * tree.predict(row);
            }
            trees.push(tree);
        }

        Self {
            init,
            learning_rate: params.learning_rate,
            trees,
        }
    }

    pub fn predict_proba(&self, row: &[f64]) -> f64 {
        let score = self.init
            + self.learning_rate * self.trees.iter().map(|t| t.predict(row)).sum::<f64>();
        sigmoid(score)
    }
}

/// A fitted ensemble of either kind.
#[derive(Debug, Clone)]
pub enum Ensemble {
    Forest(RandomForest),
    Boosted(GradientBoosting),
}

impl Ensemble {
    pub fn predict_proba(&self, row: &[f64]) -> f64 {
        match self {
            Ensemble::Forest(f) => f.predict_proba(row),
            Ensemble::Boosted(b) => b.predict_proba(row),
        }
    }
}
