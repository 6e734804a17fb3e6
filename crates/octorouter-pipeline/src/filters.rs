//! Receiver filter evaluation.
//!
//! Each receiver carries ordered groups of boolean expressions. A group passes
//! when every expression in it evaluates true against the bundle; an empty
//! group always passes.

use std::fmt;
use std::sync::Arc;

use octorouter_core::Topic;
use serde_json::Value;

use crate::error::PipelineResult;
use crate::expression::ExpressionEngine;
use crate::settings::Receiver;

/// The kind of a filter group, as it appears in action logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterType {
    Jurisdictional,
    Quality,
    Routing,
    ProcessingMode,
    Condition,
    MappedCondition,
}

impl FilterType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jurisdictional => "JURISDICTIONAL_FILTER",
            Self::Quality => "QUALITY_FILTER",
            Self::Routing => "ROUTING_FILTER",
            Self::ProcessingMode => "PROCESSING_MODE_FILTER",
            Self::Condition => "CONDITION_FILTER",
            Self::MappedCondition => "MAPPED_CONDITION_FILTER",
        }
    }
}

impl fmt::Display for FilterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterOutcome {
    Pass,
    /// The expressions responsible for the failure.
    Fail { failing: Vec<String> },
}

impl FilterOutcome {
    pub fn passed(&self) -> bool {
        matches!(self, Self::Pass)
    }
}

/// Result of the status and topic check done before any expression runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routability {
    Routable,
    Inactive,
    TopicMismatch { expected: Topic, actual: Topic },
}

impl Routability {
    pub fn is_routable(&self) -> bool {
        matches!(self, Self::Routable)
    }

    /// Why the receiver was skipped, for `ItemNotRouted` events.
    pub fn reason(&self) -> String {
        match self {
            Self::Routable => "routable".to_string(),
            Self::Inactive => "receiver is inactive".to_string(),
            Self::TopicMismatch { expected, actual } => {
                format!("receiver topic {expected} does not match report topic {actual}")
            }
        }
    }
}

/// Evaluates filter groups with a shared expression engine.
#[derive(Debug, Clone)]
pub struct FilterEngine {
    expressions: Arc<ExpressionEngine>,
}

impl FilterEngine {
    pub fn new(expressions: Arc<ExpressionEngine>) -> Self {
        Self { expressions }
    }

    pub fn expressions(&self) -> &ExpressionEngine {
        &self.expressions
    }

    /// Status and topic check. Runs before any expression is evaluated.
    pub fn check_receiver_routable(&self, receiver: &Receiver, topic: &Topic) -> Routability {
        if !receiver.is_routable() {
            return Routability::Inactive;
        }
        if &receiver.topic != topic {
            return Routability::TopicMismatch {
                expected: receiver.topic.clone(),
                actual: topic.clone(),
            };
        }
        Routability::Routable
    }

    /// Evaluates `filters` as a conjunction against `bundle`, stopping at the
    /// first expression that does not hold.
    ///
    /// With `reverse`, the combined result of a non-empty group is inverted;
    /// an empty group still passes.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Expression` if an expression does not parse or
    /// does not yield a boolean.
    pub fn evaluate_group(
        &self,
        filters: &[String],
        bundle: &Value,
        filter_type: FilterType,
        reverse: bool,
    ) -> PipelineResult<FilterOutcome> {
        if filters.is_empty() {
            return Ok(FilterOutcome::Pass);
        }

        let mut first_failing = None;
        for filter in filters {
            if !self.expressions.evaluate_condition(filter, bundle)? {
                first_failing = Some(filter.clone());
                break;
            }
        }

        let outcome = match (first_failing, reverse) {
            (None, false) => FilterOutcome::Pass,
            (Some(filter), false) => FilterOutcome::Fail {
                failing: vec![filter],
            },
            (None, true) => FilterOutcome::Fail {
                failing: filters.to_vec(),
            },
            (Some(_), true) => FilterOutcome::Pass,
        };
        tracing::debug!(
            filter_type = %filter_type,
            reverse,
            passed = outcome.passed(),
            "Evaluated filter group"
        );
        Ok(outcome)
    }

    /// `true` if any expression holds with `focus` as the context, e.g. one
    /// observation inside `root`.
    pub fn matches_any(
        &self,
        filters: &[String],
        focus: &Value,
        root: &Value,
    ) -> PipelineResult<bool> {
        for filter in filters {
            if self.expressions.evaluate_condition_on(filter, focus, root)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl Default for FilterEngine {
    fn default() -> Self {
        Self::new(Arc::new(ExpressionEngine::new()))
    }
}
