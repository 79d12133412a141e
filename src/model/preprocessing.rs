//! Training-set preparation: held-out split, variance filter, univariate
//! selection and standardisation. Every transform is fitted on the training
//! split only and replayed verbatim at prediction time.

use rand::seq::SliceRandom;
use rand::Rng;

pub const VARIANCE_THRESHOLD: f64 = 0.01;
pub const HELD_OUT_FRACTION: f64 = 0.2;

/// Row indices of a train / held-out partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    pub train: Vec<usize>,
    pub held_out: Vec<usize>,
    pub stratified: bool,
}

/// Shuffle-split `y` into train and held-out rows.
///
/// Held-out size is `ceil(fraction · n)`, kept within `[1, n − 1]` when
/// `n ≥ 2`. The split is stratified when both classes have at least two
/// rows: that total is then shared between the classes in proportion to
/// their sizes, largest remainder first, leaving each class a training row.
pub fn train_test_split<R: Rng>(y: &[u8], fraction: f64, rng: &mut R) -> Split {
    let n = y.len();
    if n < 2 {
        return Split {
            train: (0..n).collect(),
            held_out: Vec::new(),
            stratified: false,
        };
    }

    let (mut negatives, mut positives): (Vec<usize>, Vec<usize>) =
        (0..n).partition(|&i| y[i] == 0);
    let stratified = negatives.len() >= 2 && positives.len() >= 2;

    let mut split = if stratified {
        negatives.shuffle(rng);
        positives.shuffle(rng);
        let quota = class_quota(held_out_size(n, fraction), [negatives.len(), positives.len()]);
        let mut train = Vec::with_capacity(n);
        let mut held_out = Vec::new();
        for (class, k) in [negatives, positives].into_iter().zip(quota) {
            held_out.extend_from_slice(&class[..k]);
            train.extend_from_slice(&class[k..]);
        }
        Split {
            train,
            held_out,
            stratified,
        }
    } else {
        let mut order: Vec<usize> = (0..n).collect();
        order.shuffle(rng);
        let k = held_out_size(n, fraction);
        Split {
            train: order[k..].to_vec(),
            held_out: order[..k].to_vec(),
            stratified,
        }
    };
    split.train.sort_unstable();
    split.held_out.sort_unstable();
    split
}

/// Largest-remainder apportionment of `total` rows over two classes. Ties in
/// the remainder go to the larger class. Each class keeps at least one row.
fn class_quota(total: usize, counts: [usize; 2]) -> [usize; 2] {
    let n = (counts[0] + counts[1]) as f64;
    let shares = counts.map(|c| total as f64 * c as f64 / n);
    let mut quota = shares.map(|s| s.floor() as usize);

    let mut order = [0usize, 1];
    order.sort_by(|&a, &b| {
        let (fa, fb) = (shares[a] - shares[a].floor(), shares[b] - shares[b].floor());
        fb.total_cmp(&fa).then(counts[b].cmp(&counts[a]))
    });
    let mut missing = total.saturating_sub(quota[0] + quota[1]);
    for &c in order.iter().cycle().take(2 * missing) {
        if missing == 0 {
            break;
        }
        if quota[c] + 1 < counts[c] {
            quota[c] += 1;
            missing -= 1;
        }
    }
    quota
}

fn held_out_size(n: usize, fraction: f64) -> usize {
    if n < 2 {
        return 0;
    }
    ((fraction * n as f64).ceil() as usize).clamp(1, n - 1)
}

/// Drops columns whose training variance is at or below the threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct VarianceFilter {
    keep: Vec<usize>,
}

impl VarianceFilter {
    /// Keeps every column when none clears the threshold.
    pub fn fit(x: &[Vec<f64>], threshold: f64) -> Self {
        let m = x.first().map(Vec::len).unwrap_or(0);
        let keep: Vec<usize> = (0..m)
            .filter(|&j| population_variance(x.iter().map(|r| r[j])) > threshold)
            .collect();
        if keep.is_empty() {
            return Self::passthrough(m);
        }
        Self { keep }
    }

    pub fn passthrough(m: usize) -> Self {
        Self {
            keep: (0..m).collect(),
        }
    }

    pub fn kept(&self) -> &[usize] {
        &self.keep
    }

    pub fn transform(&self, row: &[f64]) -> Vec<f64> {
        self.keep.iter().map(|&j| row[j]).collect()
    }
}

/// Top-K columns by ANOVA F score against a binary label.
#[derive(Debug, Clone, PartialEq)]
pub struct KBestSelector {
    keep: Vec<usize>,
}

impl KBestSelector {
    pub fn k_for(m: usize) -> usize {
        let eighty = (m as f64 * 0.8).floor() as usize;
        eighty.max(10).min(m)
    }

    pub fn fit(x: &[Vec<f64>], y: &[u8], k: usize) -> Self {
        let m = x.first().map(Vec::len).unwrap_or(0);
        let scores: Vec<f64> = (0..m).map(|j| f_score(x, y, j)).collect();
        let mut order: Vec<usize> = (0..m).collect();
        // Stable sort: equal scores keep column order.
        order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));
        let mut keep: Vec<usize> = order.into_iter().take(k.min(m)).collect();
        keep.sort_unstable();
        Self { keep }
    }

    pub fn passthrough(m: usize) -> Self {
        Self {
            keep: (0..m).collect(),
        }
    }

    pub fn kept(&self) -> &[usize] {
        &self.keep
    }

    pub fn transform(&self, row: &[f64]) -> Vec<f64> {
        self.keep.iter().map(|&j| row[j]).collect()
    }
}

/// One-way ANOVA F statistic of column `j` across the two label groups.
///
/// Zero within-class variance with a between-class gap scores +∞; an
/// undefined score (constant column, single class) scores 0.
pub fn f_score(x: &[Vec<f64>], y: &[u8], j: usize) -> f64 {
    let mut groups: [Vec<f64>; 2] = [Vec::new(), Vec::new()];
    for (row, &label) in x.iter().zip(y) {
        groups[usize::from(label.min(1))].push(row[j]);
    }
    let n = x.len() as f64;
    if groups.iter().any(Vec::is_empty) || x.len() <= 2 {
        return 0.0;
    }
    let grand = x.iter().map(|r| r[j]).sum::<f64>() / n;

    let mut between = 0.0;
    let mut within = 0.0;
    for group in &groups {
        let g_mean = group.iter().sum::<f64>() / group.len() as f64;
        between += group.len() as f64 * (g_mean - grand).powi(2);
        within += group.iter().map(|v| (v - g_mean).powi(2)).sum::<f64>();
    }
    let total = between + within;
    if total.is_nan() || total <= 0.0 {
        return 0.0;
    }
    if within <= total * 1e-12 {
        return f64::INFINITY;
    }
    // One degree of freedom between two groups.
    let f = between / (within / (n - 2.0));
    if f.is_nan() {
        0.0
    } else {
        f
    }
}

/// Zero-mean / unit-variance scaling with population statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct StandardScaler {
    mean: Vec<f64>,
    scale: Vec<f64>,
}

impl StandardScaler {
    pub fn fit(x: &[Vec<f64>]) -> Self {
        let m = x.first().map(Vec::len).unwrap_or(0);
        let mut mean = Vec::with_capacity(m);
        let mut scale = Vec::with_capacity(m);
        for j in 0..m {
            let column = || x.iter().map(|r| r[j]);
            let mu = column().sum::<f64>() / x.len() as f64;
            let std = population_variance(column()).sqrt();
            mean.push(mu);
            scale.push(if std > 0.0 { std } else { 1.0 });
        }
        Self { mean, scale }
    }

    pub fn transform(&self, row: &[f64]) -> Vec<f64> {
        row.iter()
            .zip(self.mean.iter().zip(&self.scale))
            .map(|(v, (mu, s))| (v - mu) / s)
            .collect()
    }
}

fn population_variance(values: impl Iterator<Item = f64> + Clone) -> f64 {
    let (n, sum) = values.clone().fold((0usize, 0.0), |(n, s), v| (n + 1, s + v));
    if n == 0 {
        return 0.0;
    }
    let mean = sum / n as f64;
    values.map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64
}
