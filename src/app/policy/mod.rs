//! Traffic policy engine (spec §4.5, C5): first-match-wins rule evaluation
//! over proto/port/host/availability predicates, hot-reloadable from JSON.

mod rule;

pub(crate) use rule::{PolicyEngine, Rule, RuleWhen};
