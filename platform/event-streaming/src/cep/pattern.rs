//! Declarative pattern model and its compiled form
//!
//! Patterns arrive as JSON (embedded defaults, a patterns file, or operator
//! calls) and are compiled once at registration: regexes are built, numeric
//! comparison operands parsed, and structural limits checked.

use event_bus::{value_to_plain_string, EventEnvelope, EventType};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::error::{StreamingError, StreamingResult};
use crate::window::MAX_WINDOW_SPAN;

/// Upper bound on rules in one pattern; keeps sequence search O(n·k) bounded
pub const MAX_PATTERN_RULES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    Contains,
    Regex,
}

/// Predicate over one payload field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: ConditionOperator,
    pub value: Value,
}

impl Condition {
    pub fn new(
        field: impl Into<String>,
        operator: ConditionOperator,
        value: impl Into<Value>,
    ) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }
}

/// Event predicate: type and source allow-lists plus payload conditions
///
/// Empty allow-lists accept anything.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EventRule {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub event_types: Vec<EventType>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl EventRule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn of_type(event_type: EventType) -> Self {
        Self {
            event_types: vec![event_type],
            ..Self::default()
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.sources.push(source.into());
        self
    }

    pub fn with_condition(
        mut self,
        field: impl Into<String>,
        operator: ConditionOperator,
        value: impl Into<Value>,
    ) -> Self {
        self.conditions.push(Condition::new(field, operator, value));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PatternDefinition {
    Sequence { rules: Vec<EventRule> },
    Conjunction { rules: Vec<EventRule> },
    Disjunction { rules: Vec<EventRule> },
    Negation {
        positive_rule: EventRule,
        negative_rule: EventRule,
    },
}

impl PatternDefinition {
    pub fn kind(&self) -> &'static str {
        match self {
            PatternDefinition::Sequence { .. } => "sequence",
            PatternDefinition::Conjunction { .. } => "conjunction",
            PatternDefinition::Disjunction { .. } => "disjunction",
            PatternDefinition::Negation { .. } => "negation",
        }
    }
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPattern {
    pub id: String,
    pub name: String,
    pub definition: PatternDefinition,
    /// How far back from the triggering event to look
    pub time_window_secs: u64,
    /// Payload field whose value segments the buffers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_key: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl EventPattern {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        definition: PatternDefinition,
        time_window: Duration,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            definition,
            time_window_secs: time_window.as_secs(),
            partition_key: None,
            enabled: true,
        }
    }

    pub fn with_partition_key(mut self, field: impl Into<String>) -> Self {
        self.partition_key = Some(field.into());
        self
    }

    pub fn time_window(&self) -> Duration {
        Duration::from_secs(self.time_window_secs)
    }

    /// Parse a JSON array of patterns
    pub fn list_from_json(json: &str) -> StreamingResult<Vec<EventPattern>> {
        Ok(serde_json::from_str(json)?)
    }
}

#[derive(Debug)]
enum Operand {
    Text(String),
    Number(f64),
    Pattern(Regex),
}

#[derive(Debug)]
struct CompiledCondition {
    field: String,
    operator: ConditionOperator,
    raw: Value,
    operand: Operand,
}

impl CompiledCondition {
    fn compile(pattern_id: &str, condition: &Condition) -> StreamingResult<Self> {
        if condition.field.trim().is_empty() {
            return Err(StreamingError::invalid_pattern(pattern_id, "condition field is empty"));
        }

        let operand = match condition.operator {
            ConditionOperator::GreaterThan | ConditionOperator::LessThan => {
                let number = as_number(&condition.value).ok_or_else(|| {
                    StreamingError::invalid_pattern(
                        pattern_id,
                        format!("operand for '{}' is not numeric", condition.field),
                    )
                })?;
                Operand::Number(number)
            }
            ConditionOperator::Regex => {
                let source = value_to_plain_string(&condition.value);
                let regex = Regex::new(&source).map_err(|e| {
                    StreamingError::invalid_pattern(
                        pattern_id,
                        format!("invalid regex '{source}': {e}"),
                    )
                })?;
                Operand::Pattern(regex)
            }
            ConditionOperator::Equals
            | ConditionOperator::NotEquals
            | ConditionOperator::Contains => Operand::Text(value_to_plain_string(&condition.value)),
        };

        Ok(Self {
            field: condition.field.clone(),
            operator: condition.operator,
            raw: condition.value.clone(),
            operand,
        })
    }

    /// A missing field fails every operator, `not_equals` included
    fn evaluate(&self, event: &EventEnvelope) -> bool {
        let Some(actual) = event.payload_field(&self.field) else {
            return false;
        };

        match (&self.operator, &self.operand) {
            (ConditionOperator::Equals, Operand::Text(text)) => self.equals(actual, text),
            (ConditionOperator::NotEquals, Operand::Text(text)) => !self.equals(actual, text),
            (ConditionOperator::GreaterThan, Operand::Number(n)) => {
                as_number(actual).is_some_and(|a| a > *n)
            }
            (ConditionOperator::LessThan, Operand::Number(n)) => {
                as_number(actual).is_some_and(|a| a < *n)
            }
            (ConditionOperator::Contains, Operand::Text(text)) => match actual {
                Value::Array(items) => {
                    items.iter().any(|item| value_to_plain_string(item) == *text)
                }
                other => value_to_plain_string(other).contains(text.as_str()),
            },
            (ConditionOperator::Regex, Operand::Pattern(regex)) => {
                regex.is_match(&value_to_plain_string(actual))
            }
            _ => false,
        }
    }

    fn equals(&self, actual: &Value, text: &str) -> bool {
        match (actual.as_f64(), self.raw.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => value_to_plain_string(actual) == text,
        }
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[derive(Debug)]
pub(crate) struct CompiledRule {
    event_types: Vec<EventType>,
    sources: Vec<String>,
    conditions: Vec<CompiledCondition>,
}

impl CompiledRule {
    fn compile(pattern_id: &str, rule: &EventRule) -> StreamingResult<Self> {
        let conditions = rule
            .conditions
            .iter()
            .map(|c| CompiledCondition::compile(pattern_id, c))
            .collect::<StreamingResult<Vec<_>>>()?;
        Ok(Self {
            event_types: rule.event_types.clone(),
            sources: rule.sources.clone(),
            conditions,
        })
    }

    pub(crate) fn matches(&self, event: &EventEnvelope) -> bool {
        (self.event_types.is_empty() || self.event_types.contains(&event.event_type))
            && (self.sources.is_empty() || self.sources.iter().any(|s| *s == event.source))
            && self.conditions.iter().all(|c| c.evaluate(event))
    }
}

#[derive(Debug)]
pub(crate) enum CompiledDefinition {
    Sequence(Vec<CompiledRule>),
    Conjunction(Vec<CompiledRule>),
    Disjunction(Vec<CompiledRule>),
    Negation {
        positive: CompiledRule,
        negative: CompiledRule,
    },
}

impl CompiledDefinition {
    fn compile(pattern_id: &str, definition: &PatternDefinition) -> StreamingResult<Self> {
        let compile_list = |rules: &[EventRule]| -> StreamingResult<Vec<CompiledRule>> {
            if rules.is_empty() {
                return Err(StreamingError::invalid_pattern(pattern_id, "rule list is empty"));
            }
            if rules.len() > MAX_PATTERN_RULES {
                return Err(StreamingError::invalid_pattern(
                    pattern_id,
                    format!("{} rules exceeds the limit of {MAX_PATTERN_RULES}", rules.len()),
                ));
            }
            rules
                .iter()
                .map(|rule| CompiledRule::compile(pattern_id, rule))
                .collect()
        };

        Ok(match definition {
            PatternDefinition::Sequence { rules } => Self::Sequence(compile_list(rules)?),
            PatternDefinition::Conjunction { rules } => Self::Conjunction(compile_list(rules)?),
            PatternDefinition::Disjunction { rules } => Self::Disjunction(compile_list(rules)?),
            PatternDefinition::Negation {
                positive_rule,
                negative_rule,
            } => Self::Negation {
                positive: CompiledRule::compile(pattern_id, positive_rule)?,
                negative: CompiledRule::compile(pattern_id, negative_rule)?,
            },
        })
    }

    /// Whether an event can take part in any match of this definition
    pub(crate) fn is_relevant(&self, event: &EventEnvelope) -> bool {
        match self {
            Self::Sequence(rules) | Self::Conjunction(rules) | Self::Disjunction(rules) => {
                rules.iter().any(|rule| rule.matches(event))
            }
            Self::Negation { positive, .. } => positive.matches(event),
        }
    }
}

/// Registered pattern together with its compiled rules
#[derive(Debug)]
pub(crate) struct CompiledPattern {
    pub(crate) pattern: EventPattern,
    pub(crate) definition: CompiledDefinition,
    pub(crate) window: chrono::Duration,
}

impl CompiledPattern {
    pub(crate) fn compile(pattern: EventPattern) -> StreamingResult<Self> {
        if pattern.id.trim().is_empty() {
            return Err(StreamingError::invalid_pattern(&pattern.id, "pattern id is empty"));
        }
        if pattern.time_window_secs == 0 {
            return Err(StreamingError::invalid_pattern(
                &pattern.id,
                "time window must be positive",
            ));
        }
        if pattern.time_window() > MAX_WINDOW_SPAN {
            return Err(StreamingError::invalid_pattern(
                &pattern.id,
                format!(
                    "time window exceeds {} seconds",
                    MAX_WINDOW_SPAN.as_secs()
                ),
            ));
        }
        let window = i64::try_from(pattern.time_window_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .ok_or_else(|| {
                StreamingError::invalid_pattern(&pattern.id, "time window is too large")
            })?;

        let definition = CompiledDefinition::compile(&pattern.id, &pattern.definition)?;
        Ok(Self {
            pattern,
            definition,
            window,
        })
    }
}
