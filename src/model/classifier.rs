//! Per-proposition classifier.
//!
//! A fresh `PropClassifier` is trained for every proposition from that
//! player's own history and thrown away afterwards. Lifecycle:
//! `Untrained → Trained` or `Untrained → BaselineOnly` (all labels equal).

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::error::ModelError;

use super::calibration::calibrate;
use super::ensemble::{
    BoostingParams, Ensemble, ForestParams, GradientBoosting, ModelKind, RandomForest,
};
use super::features::FeatureMatrix;
use super::metrics::{accuracy, roc_auc};
use super::preprocessing::{
    train_test_split, KBestSelector, StandardScaler, VarianceFilter, HELD_OUT_FRACTION,
    VARIANCE_THRESHOLD,
};

pub const DEFAULT_SEED: u64 = 42;
/// Half-width of the band reported around a baseline probability.
const BASELINE_BAND: f64 = 0.20;
/// Standard error used when the training size is unknown.
const DEFAULT_STANDARD_ERROR: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassifierConfig {
    pub kind: ModelKind,
    pub seed: u64,
    pub held_out_fraction: f64,
    pub forest: ForestParams,
    pub boosting: BoostingParams,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            kind: ModelKind::RandomForest,
            seed: DEFAULT_SEED,
            held_out_fraction: HELD_OUT_FRACTION,
            forest: ForestParams::default(),
            boosting: BoostingParams::default(),
        }
    }
}

/// Point estimate with a confidence band, all calibrated unless the model
/// fell back to a baseline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbabilityInterval {
    pub point: f64,
    pub lower: f64,
    pub upper: f64,
}

/// Diagnostics from one training run. Logged, never used as a gate.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingReport {
    pub kind: ModelKind,
    pub training_rows: usize,
    pub held_out_rows: usize,
    pub stratified: bool,
    pub input_columns: usize,
    pub selected_columns: usize,
    pub train_accuracy: f64,
    pub train_auc: f64,
    pub held_out_accuracy: Option<f64>,
    pub held_out_auc: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifierState {
    Untrained,
    BaselineOnly,
    Trained,
}

#[derive(Debug, Clone)]
struct Fitted {
    input_columns: Vec<String>,
    variance: VarianceFilter,
    selector: KBestSelector,
    scaler: StandardScaler,
    ensemble: Ensemble,
    training_samples: usize,
    report: TrainingReport,
}

#[derive(Debug, Clone)]
enum Fit {
    Untrained,
    BaselineOnly { probability: f64 },
    Trained(Box<Fitted>),
}

#[derive(Debug, Clone)]
pub struct PropClassifier {
    config: ClassifierConfig,
    fit: Fit,
}

impl PropClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self {
            config,
            fit: Fit::Untrained,
        }
    }

    pub fn state(&self) -> ClassifierState {
        match self.fit {
            Fit::Untrained => ClassifierState::Untrained,
            Fit::BaselineOnly { .. } => ClassifierState::BaselineOnly,
            Fit::Trained(_) => ClassifierState::Trained,
        }
    }

    /// Rows the ensemble was fitted on (training split only).
    pub fn training_samples(&self) -> Option<usize> {
        match &self.fit {
            Fit::Trained(f) => Some(f.training_samples),
            _ => None,
        }
    }

    pub fn report(&self) -> Option<&TrainingReport> {
        match &self.fit {
            Fit::Trained(f) => Some(&f.report),
            _ => None,
        }
    }

    /// Train on `x` with outcome values `y`.
    ///
    /// `y` with more than two distinct values is binarised as `y > 0`.
    /// Identical labels leave the classifier in `BaselineOnly` with the
    /// label mean as its probability.
    pub fn fit(
        &mut self,
        x: &FeatureMatrix,
        y: &[f64],
        sample_weights: Option<&[f64]>,
    ) -> Result<(), ModelError> {
        if !matches!(self.fit, Fit::Untrained) {
            return Err(ModelError::AlreadyFitted);
        }
        if x.is_empty() || y.is_empty() {
            return Err(ModelError::EmptyTrainingSet);
        }
        if x.len() != y.len() {
            return Err(ModelError::DimensionMismatch(format!(
                "{} feature rows vs {} labels",
                x.len(),
                y.len()
            )));
        }
        if let Some(w) = sample_weights {
            if w.len() != x.len() {
                return Err(ModelError::DimensionMismatch(format!(
                    "{} feature rows vs {} sample weights",
                    x.len(),
                    w.len()
                )));
            }
        }

        let labels = binarise(y);
        if labels.iter().all(|&l| l == labels[0]) {
            let probability = labels.iter().map(|&l| f64::from(l)).sum::<f64>() / labels.len() as f64;
            info!(
                "All {} outcomes identical; using baseline probability {:.3}",
                labels.len(),
                probability
            );
            self.fit = Fit::BaselineOnly { probability };
            return Ok(());
        }

        let rows: Vec<Vec<f64>> = x.rows.iter().map(|r| sanitise(r)).collect();
        let weights: Vec<f64> = match sample_weights {
            Some(w) => w.iter().map(|v| if v.is_finite() && *v > 0.0 { *v } else { 0.0 }).collect(),
            None => vec![1.0; rows.len()],
        };

        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let split = train_test_split(&labels, self.config.held_out_fraction, &mut rng);
        let pick = |idx: &[usize]| -> (Vec<Vec<f64>>, Vec<u8>) {
            (
                idx.iter().map(|&i| rows[i].clone()).collect(),
                idx.iter().map(|&i| labels[i]).collect(),
            )
        };
        let (x_train, y_train) = pick(&split.train);
        let (x_held, y_held) = pick(&split.held_out);
        let w_train: Vec<f64> = split.train.iter().map(|&i| weights[i]).collect();

        let m = x.n_columns();
        let two_classes = y_train.contains(&0) && y_train.contains(&1);
        let (variance, selector) = if two_classes {
            let variance = VarianceFilter::fit(&x_train, VARIANCE_THRESHOLD);
            let filtered: Vec<Vec<f64>> = x_train.iter().map(|r| variance.transform(r)).collect();
            let k = KBestSelector::k_for(variance.kept().len());
            let selector = KBestSelector::fit(&filtered, &y_train, k);
            (variance, selector)
        } else {
            (VarianceFilter::passthrough(m), KBestSelector::passthrough(m))
        };

        let reduce = |row: &[f64]| selector.transform(&variance.transform(row));
        let reduced_train: Vec<Vec<f64>> = x_train.iter().map(|r| reduce(r.as_slice())).collect();
        let scaler = StandardScaler::fit(&reduced_train);
        let scaled_train: Vec<Vec<f64>> =
            reduced_train.iter().map(|r| scaler.transform(r)).collect();
        let scaled_held: Vec<Vec<f64>> =
            x_held.iter().map(|r| scaler.transform(&reduce(r.as_slice()))).collect();

        let ensemble = match self.config.kind {
            ModelKind::RandomForest => Ensemble::Forest(RandomForest::fit(
                &scaled_train,
                &y_train,
                &w_train,
                &self.config.forest,
                &mut rng,
            )),
            ModelKind::GradientBoosting => Ensemble::Boosted(GradientBoosting::fit(
                &scaled_train,
                &y_train,
                &w_train,
                &self.config.boosting,
                &mut rng,
            )),
        };

        let train_probs: Vec<f64> = scaled_train.iter().map(|r| ensemble.predict_proba(r)).collect();
        let held_probs: Vec<f64> = scaled_held.iter().map(|r| ensemble.predict_proba(r)).collect();
        let report = TrainingReport {
            kind: self.config.kind,
            training_rows: y_train.len(),
            held_out_rows: y_held.len(),
            stratified: split.stratified,
            input_columns: m,
            selected_columns: selector.kept().len(),
            train_accuracy: accuracy(&y_train, &train_probs),
            train_auc: roc_auc(&y_train, &train_probs),
            held_out_accuracy: (!y_held.is_empty()).then(|| accuracy(&y_held, &held_probs)),
            held_out_auc: (!y_held.is_empty()).then(|| roc_auc(&y_held, &held_probs)),
        };
        info!(
            "Model trained ({:?}, {} rows, {}/{} features) - Train Acc: {:.3}, Held-out Acc: {}, Train AUC: {:.3}, Held-out AUC: {}",
            report.kind,
            report.training_rows,
            report.selected_columns,
            report.input_columns,
            report.train_accuracy,
            fmt_metric(report.held_out_accuracy),
            report.train_auc,
            fmt_metric(report.held_out_auc),
        );

        self.fit = Fit::Trained(Box::new(Fitted {
            input_columns: x.columns.clone(),
            variance,
            selector,
            scaler,
            ensemble,
            training_samples: y_train.len(),
            report,
        }));
        Ok(())
    }

    /// Calibrated probability for the last row of `x`.
    pub fn predict_probability(&self, x: &FeatureMatrix) -> Result<f64, ModelError> {
        match &self.fit {
            Fit::Untrained => Ok(0.5),
            Fit::BaselineOnly { probability } => Ok(*probability),
            Fit::Trained(fitted) => {
                let row = fitted.prepare(x)?;
                Ok(calibrate(fitted.ensemble.predict_proba(&row), None))
            }
        }
    }

    /// Calibrated probability and normal-approximation band for the last
    /// row of `x`. `confidence` picks z: 0.95 → 1.96, 0.99 → 2.576, else
    /// 1.645.
    pub fn predict_with_interval(
        &self,
        x: &FeatureMatrix,
        confidence: f64,
    ) -> Result<ProbabilityInterval, ModelError> {
        let fitted = match &self.fit {
            Fit::Untrained => return Ok(baseline_interval(0.5)),
            Fit::BaselineOnly { probability } => return Ok(baseline_interval(*probability)),
            Fit::Trained(fitted) => fitted,
        };
        let row = fitted.prepare(x)?;
        let z = z_score(confidence);

        let (centre, spread) = match &fitted.ensemble {
            Ensemble::Forest(forest) => {
                let probs = forest.tree_probabilities(&row);
                let n = probs.len().max(1) as f64;
                let mean = probs.iter().sum::<f64>() / n;
                let var = probs.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / n;
                (mean, var.sqrt())
            }
            Ensemble::Boosted(model) => {
                let p = model.predict_proba(&row);
                let se = match fitted.training_samples {
                    0 => DEFAULT_STANDARD_ERROR,
                    n => (p * (1.0 - p) / n as f64).sqrt(),
                };
                (p, se)
            }
        };

        let lower = (centre - z * spread).max(0.0);
        let upper = (centre + z * spread).min(1.0);
        Ok(ProbabilityInterval {
            point: calibrate(centre, None),
            lower: calibrate(lower, None),
            upper: calibrate(upper, None),
        })
    }
}

impl Fitted {
    /// Align the last row of `x` to the training schema and replay the
    /// fitted transforms.
    fn prepare(&self, x: &FeatureMatrix) -> Result<Vec<f64>, ModelError> {
        let last = x.last_row().ok_or_else(|| {
            ModelError::DimensionMismatch("prediction matrix has no rows".to_string())
        })?;

        let mut missing = Vec::new();
        let aligned: Vec<f64> = self
            .input_columns
            .iter()
            .map(|name| match x.column_index(name) {
                Some(j) => last.get(j).copied().unwrap_or(0.0),
                None => {
                    missing.push(name.as_str());
                    0.0
                }
            })
            .collect();
        if !missing.is_empty() {
            debug!("Missing features {:?}, filling with 0", missing);
        }

        let aligned = sanitise(&aligned);
        let reduced = self.selector.transform(&self.variance.transform(&aligned));
        Ok(self.scaler.transform(&reduced))
    }
}

fn binarise(y: &[f64]) -> Vec<u8> {
    let mut distinct: Vec<u64> = y.iter().map(|v| v.to_bits()).collect();
    distinct.sort_unstable();
    distinct.dedup();
    if distinct.len() > 2 {
        debug!("Target has {} distinct values; binarising as > 0", distinct.len());
    }
    y.iter().map(|&v| u8::from(v > 0.0)).collect()
}

fn sanitise(row: &[f64]) -> Vec<f64> {
    row.iter()
        .map(|v| if v.is_finite() { *v } else { 0.0 })
        .collect()
}

fn baseline_interval(p: f64) -> ProbabilityInterval {
    ProbabilityInterval {
        point: p,
        lower: (p - BASELINE_BAND).max(0.0),
        upper: (p + BASELINE_BAND).min(1.0),
    }
}

pub fn z_score(confidence: f64) -> f64 {
    if (confidence - 0.95).abs() < 1e-9 {
        1.96
    } else if (confidence - 0.99).abs() < 1e-9 {
        2.576
    } else {
        1.645
    }
}

fn fmt_metric(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{v:.3}"))
}
