pub mod openrouter_classifier;

pub use openrouter_classifier::{ClassifierSettings, OpenRouterClassifier, UnconfiguredClassifier};
