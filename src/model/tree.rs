//! Weighted CART regression tree.
//!
//! Splits minimise the weighted sum of squared errors. On 0/1 targets that
//! is proportional to Gini impurity, so the same tree serves as a
//! probability tree inside the forest (leaf = weighted positive fraction)
//! and as a residual tree inside gradient boosting (leaves re-fitted with a
//! Newton step).

use rand::seq::SliceRandom;
use rand::Rng;

const MIN_GAIN: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TreeParams {
    pub max_depth: usize,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    /// Features inspected per node before settling; `None` = all.
    pub max_features: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Leaf {
        value: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegressionTree {
    nodes: Vec<Node>,
}

struct Split {
    feature: usize,
    threshold: f64,
    gain: f64,
}

/// Running weighted sums for one side of a split.
#[derive(Default, Clone, Copy)]
struct Sums {
    w: f64,
    wy: f64,
    wyy: f64,
}

impl Sums {
    fn add(&mut self, w: f64, y: f64) {
        self.w += w;
        self.wy += w * y;
        self.wyy += w * y * y;
    }

    fn sse(&self) -> f64 {
        if self.w <= 0.0 {
            0.0
        } else {
            (self.wyy - self.wy * self.wy / self.w).max(0.0)
        }
    }
}

impl RegressionTree {
    /// Grow a tree on the rows listed in `sample` (duplicates allowed).
    pub fn fit<R: Rng>(
        x: &[Vec<f64>],
        targets: &[f64],
        weights: &[f64],
        sample: &[usize],
        params: &TreeParams,
        rng: &mut R,
    ) -> Self {
        let mut tree = RegressionTree { nodes: Vec::new() };
        let n_features = x.first().map(Vec::len).unwrap_or(0);
        let mut ctx = Grow {
            x,
            targets,
            weights,
            params,
            n_features,
            rng,
        };
        tree.grow(&mut ctx, sample.to_vec(), 0);
        tree
    }

    pub fn predict(&self, row: &[f64]) -> f64 {
        match &self.nodes[self.leaf_index(row)] {
            Node::Leaf { value } => *value,
            Node::Split { .. } => unreachable!("leaf_index always lands on a leaf"),
        }
    }

    pub fn leaf_index(&self, row: &[f64]) -> usize {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                Node::Leaf { .. } => return idx,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    let v = row.get(*feature).copied().unwrap_or(0.0);
                    idx = if v <= *threshold { *left } else { *right };
                }
            }
        }
    }

    /// Replace every reached leaf's value with `value(members)`.
    pub fn refit_leaves<F>(&mut self, x: &[Vec<f64>], sample: &[usize], mut value: F)
    where
        F: FnMut(&[usize]) -> f64,
    {
        let mut members: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        for &i in sample {
            members[self.leaf_index(&x[i])].push(i);
        }
        for (idx, rows) in members.iter().enumerate() {
            if rows.is_empty() {
                continue;
            }
            if let Node::Leaf { value: v } = &mut self.nodes[idx] {
                *v = value(rows);
            }
        }
    }

    #[cfg(test)]
    pub fn depth(&self) -> usize {
        fn walk(nodes: &[Node], idx: usize) -> usize {
            match &nodes[idx] {
                Node::Leaf { .. } => 0,
                Node::Split { left, right, .. } => 1 + walk(nodes, *left).max(walk(nodes, *right)),
            }
        }
        if self.nodes.is_empty() {
            0
        } else {
            walk(&self.nodes, 0)
        }
    }

    fn grow<R: Rng>(&mut self, ctx: &mut Grow<'_, R>, sample: Vec<usize>, depth: usize) -> usize {
        let mut sums = Sums::default();
        for &i in &sample {
            sums.add(ctx.weights[i], ctx.targets[i]);
        }
        let value = if sums.w > 0.0 {
            sums.wy / sums.w
        } else if sample.is_empty() {
            0.0
        } else {
            sample.iter().map(|&i| ctx.targets[i]).sum::<f64>() / sample.len() as f64
        };

        let node = self.nodes.len();
        self.nodes.push(Node::Leaf { value });

        let p = ctx.params;
        if depth >= p.max_depth
            || sample.len() < p.min_samples_split
            || sample.len() < 2 * p.min_samples_leaf
            || sums.sse() <= MIN_GAIN
        {
            return node;
        }

        let Some(split) = ctx.best_split(&sample, sums.sse()) else {
            return node;
        };

        let (left, right): (Vec<usize>, Vec<usize>) = sample
            .iter()
            .partition(|&&i| ctx.x[i][split.feature] <= split.threshold);

        let left = self.grow(ctx, left, depth + 1);
        let right = self.grow(ctx, right, depth + 1);
        self.nodes[node] = Node::Split {
            feature: split.feature,
            threshold: split.threshold,
            left,
            right,
        };
        node
    }
}

struct Grow<'a, R> {
    x: &'a [Vec<f64>],
    targets: &'a [f64],
    weights: &'a [f64],
    params: &'a TreeParams,
    n_features: usize,
    rng: &'a mut R,
}

impl<R: Rng> Grow<'_, R> {
    fn best_split(&mut self, sample: &[usize], parent_sse: f64) -> Option<Split> {
        let mut features: Vec<usize> = (0..self.n_features).collect();
        let budget = match self.params.max_features {
            Some(k) if k < self.n_features => {
                features.shuffle(&mut *self.rng);
                k.max(1)
            }
            _ => self.n_features,
        };

        let mut best: Option<Split> = None;
        for (inspected, &feature) in features.iter().enumerate() {
            // Keep looking past the budget until at least one valid split turns up.
            if inspected >= budget && best.is_some() {
                break;
            }
            if let Some(candidate) = self.best_split_on(feature, sample, parent_sse) {
                if best.as_ref().map_or(true, |b| candidate.gain > b.gain) {
                    best = Some(candidate);
                }
            }
        }
        best
    }

    fn best_split_on(&self, feature: usize, sample: &[usize], parent_sse: f64) -> Option<Split> {
        if sample.len() < 2 {
            return None;
        }
        let mut order = sample.to_vec();
        order.sort_by(|&a, &b| self.x[a][feature].total_cmp(&self.x[b][feature]));

        let mut total = Sums::default();
        for &i in &order {
            total.add(self.weights[i], self.targets[i]);
        }

        let min_leaf = self.params.min_samples_leaf.max(1);
        let mut left = Sums::default();
        let mut best: Option<Split> = None;
        for k in 0..order.len() - 1 {
            let i = order[k];
            left.add(self.weights[i], self.targets[i]);

            let n_left = k + 1;
            let n_right = order.len() - n_left;
            if n_left < min_leaf || n_right < min_leaf {
                continue;
            }
            let here = self.x[i][feature];
            let next = self.x[order[k + 1]][feature];
            if here >= next {
                continue;
            }
            let right = Sums {
                w: total.w - left.w,
                wy: total.wy - left.wy,
                wyy: total.wyy - left.wyy,
            };
            if left.w <= 0.0 || right.w <= 0.0 {
                continue;
            }
            let gain = parent_sse - left.sse() - right.sse();
            if gain > MIN_GAIN && best.as_ref().map_or(true, |b| gain > b.gain) {
                best = Some(Split {
                    feature,
                    threshold: here + (next - here) / 2.0,
                    gain,
                });
            }
        }
        best
    }
}
