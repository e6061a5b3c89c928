//! Match algorithms over a time-filtered buffer
//!
//! Each function returns the matched event sets; an empty result means no
//! match. Buffers are in arrival order.

use event_bus::EventEnvelope;
use std::sync::Arc;

use super::pattern::{CompiledDefinition, CompiledRule};

pub(crate) type Matched = Vec<Arc<EventEnvelope>>;

pub(crate) fn evaluate(
    definition: &CompiledDefinition,
    events: &[Arc<EventEnvelope>],
) -> Vec<Matched> {
    match definition {
        CompiledDefinition::Sequence(rules) => sequence(rules, events),
        CompiledDefinition::Conjunction(rules) => {
            conjunction(rules, events).into_iter().collect()
        }
        CompiledDefinition::Disjunction(rules) => {
            disjunction(rules, events).into_iter().collect()
        }
        CompiledDefinition::Negation { positive, negative } => {
            negation(positive, negative, events).into_iter().collect()
        }
    }
}

/// One chain per start position satisfying the first rule
///
/// From each start, the chain takes the earliest event satisfying each later
/// rule in turn, so overlapping chains from different starts are all emitted.
/// Chains from later starts never sit earlier than those from earlier starts:
/// once one start cannot complete, no later start can.
fn sequence(rules: &[CompiledRule], events: &[Arc<EventEnvelope>]) -> Vec<Matched> {
    let Some((first, rest)) = rules.split_first() else {
        return Vec::new();
    };

    let mut matches = Vec::new();
    for (start, event) in events.iter().enumerate() {
        if !first.matches(event) {
            continue;
        }
        match chain_from(rest, events, start) {
            Some(chain) => matches.push(chain),
            None => break,
        }
    }
    matches
}

fn chain_from(
    rules: &[CompiledRule],
    events: &[Arc<EventEnvelope>],
    start: usize,
) -> Option<Matched> {
    let mut chain = Vec::with_capacity(rules.len() + 1);
    chain.push(events[start].clone());

    let mut position = start + 1;
    for rule in rules {
        let offset = events[position..]
            .iter()
            .position(|event| rule.matches(event))?;
        chain.push(events[position + offset].clone());
        position += offset + 1;
    }
    Some(chain)
}

/// Every rule must be met by some event; the union of satisfying events is reported
fn conjunction(rules: &[CompiledRule], events: &[Arc<EventEnvelope>]) -> Option<Matched> {
    let mut satisfied = vec![false; rules.len()];
    let mut matched = Vec::new();

    for event in events {
        let mut hit = false;
        for (i, rule) in rules.iter().enumerate() {
            if rule.matches(event) {
                satisfied[i] = true;
                hit = true;
            }
        }
        if hit {
            matched.push(event.clone());
        }
    }

    satisfied.iter().all(|&s| s).then_some(matched)
}

fn disjunction(rules: &[CompiledRule], events: &[Arc<EventEnvelope>]) -> Option<Matched> {
    let matched: Matched = events
        .iter()
        .filter(|event| rules.iter().any(|rule| rule.matches(event)))
        .cloned()
        .collect();
    (!matched.is_empty()).then_some(matched)
}

fn negation(
    positive: &CompiledRule,
    negative: &CompiledRule,
    events: &[Arc<EventEnvelope>],
) -> Option<Matched> {
    let matched: Matched = events
        .iter()
        .filter(|event| positive.matches(event) && !negative.matches(event))
        .cloned()
        .collect();
    (!matched.is_empty()).then_some(matched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cep::pattern::{
        CompiledPattern, ConditionOperator, EventPattern, EventRule, PatternDefinition,
    };
    use event_bus::EventType;
    use serde_json::json;
    use std::time::Duration;

    fn step(name: &str) -> Arc<EventEnvelope> {
        Arc::new(EventEnvelope::new(EventType::SystemEvent, "test", json!({"step": name})))
    }

    fn rule(name: &str) -> EventRule {
        EventRule::new().with_condition("step", ConditionOperator::Equals, name)
    }

    fn compiled(definition: PatternDefinition) -> CompiledDefinition {
        CompiledPattern::compile(EventPattern::new("p", "P", definition, Duration::from_secs(60)))
            .unwrap()
            .definition
    }

    fn ids(matched: &Matched) -> Vec<String> {
        matched
            .iter()
            .filter_map(|e| e.payload_field_string("step"))
            .collect()
    }

    #[test]
    fn test_sequence_requires_order() {
        let abc = compiled(PatternDefinition::Sequence {
            rules: vec![rule("a"), rule("b"), rule("c")],
        });

        let ordered = vec![step("a"), step("b"), step("c")];
        let matches = evaluate(&abc, &ordered);
        assert_eq!(matches.len(), 1);
        assert_eq!(ids(&matches[0]), vec!["a", "b", "c"]);

        let swapped = vec![step("b"), step("a"), step("c")];
        assert!(evaluate(&abc, &swapped).is_empty());
    }

    #[test]
    fn test_sequence_skips_noise() {
        let abc = compiled(PatternDefinition::Sequence {
            rules: vec![rule("a"), rule("b"), rule("c")],
        });
        let events = vec![step("a"), step("x"), step("b"), step("b"), step("c")];
        let matches = evaluate(&abc, &events);
        assert_eq!(matches.len(), 1);
        assert_eq!(ids(&matches[0]), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_sequence_reports_overlapping_starts() {
        let aa = compiled(PatternDefinition::Sequence {
            rules: vec![rule("a"), rule("a")],
        });
        let events = vec![step("a"), step("a"), step("a")];
        // Starts 0 and 1 each complete a chain; start 2 has no successor
        assert_eq!(evaluate(&aa, &events).len(), 2);
    }

    #[test]
    fn test_sequence_takes_earliest_successor() {
        let abc = compiled(PatternDefinition::Sequence {
            rules: vec![rule("a"), rule("b"), rule("c")],
        });
        let first_b = step("b");
        let events = vec![step("a"), first_b.clone(), step("b"), step("c")];
        let matches = evaluate(&abc, &events);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0][1].id, first_b.id);
    }

    #[test]
    fn test_unfinished_sequence_over_large_buffer_is_linear() {
        let aaab = compiled(PatternDefinition::Sequence {
            rules: vec![rule("a"), rule("a"), rule("a"), rule("b")],
        });
        let events: Vec<Arc<EventEnvelope>> = (0..5_000).map(|_| step("a")).collect();

        let started = std::time::Instant::now();
        assert!(evaluate(&aaab, &events).is_empty());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_conjunction_needs_every_rule() {
        let ab = compiled(PatternDefinition::Conjunction {
            rules: vec![rule("a"), rule("b")],
        });
        assert!(evaluate(&ab, &[step("a"), step("a")]).is_empty());

        let matches = evaluate(&ab, &[step("b"), step("x"), step("a")]);
        assert_eq!(matches.len(), 1);
        assert_eq!(ids(&matches[0]), vec!["b", "a"]);
    }

    #[test]
    fn test_disjunction_collects_any() {
        let ab = compiled(PatternDefinition::Disjunction {
            rules: vec![rule("a"), rule("b")],
        });
        assert!(evaluate(&ab, &[step("x")]).is_empty());
        let matches = evaluate(&ab, &[step("a"), step("x"), step("b")]);
        assert_eq!(ids(&matches[0]), vec!["a", "b"]);
    }

    #[test]
    fn test_negation_excludes_events_meeting_both_rules() {
        let definition = compiled(PatternDefinition::Negation {
            positive_rule: EventRule::of_type(EventType::Transaction),
            negative_rule: EventRule::new().with_condition(
                "verified",
                ConditionOperator::Equals,
                true,
            ),
        });
        let unverified = Arc::new(EventEnvelope::new(
            EventType::Transaction,
            "payments",
            json!({"verified": false, "n": 1}),
        ));
        let verified = Arc::new(EventEnvelope::new(
            EventType::Transaction,
            "payments",
            json!({"verified": true, "n": 2}),
        ));

        let matches = evaluate(&definition, &[verified.clone(), unverified.clone()]);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].len(), 1);
        assert_eq!(matches[0][0].id, unverified.id);

        assert!(evaluate(&definition, &[verified]).is_empty());
    }
}
