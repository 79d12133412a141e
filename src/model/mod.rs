pub mod calibration;
pub mod classifier;
pub mod ensemble;
pub mod ev;
pub mod features;
pub mod labels;
pub mod metrics;
pub mod preprocessing;
pub mod schema;
pub mod tree;

pub use classifier::{ClassifierConfig, ClassifierState, ProbabilityInterval, PropClassifier};
pub use ensemble::ModelKind;
pub use features::{FeatureBuilder, FeatureMatrix};
pub use labels::label_outcomes;
pub use schema::StatColumns;
