// Core moderation module - signals, rule evaluation, decisions and the
// pipeline tying them to enforcement.

pub mod decision_engine;
pub mod moderation_models;
pub mod moderation_service;
pub mod rule_evaluator;

pub use decision_engine::*;
pub use moderation_models::*;
pub use moderation_service::*;
pub use rule_evaluator::*;
