use std::sync::Arc;

use arc_swap::ArcSwap;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::app::types::Action;

/// One policy rule's match predicate (spec §4.5). All fields are optional;
/// an absent predicate always matches, mirroring the original's
/// `_rule_match`, which only rejects a rule when a present field
/// disagrees.
#[derive(Debug, Deserialize)]
pub(crate) struct RuleWhen {
    pub(crate) proto: Option<String>,
    pub(crate) is_udp: Option<bool>,
    pub(crate) socks_available: Option<bool>,
    pub(crate) port: Option<u16>,
    pub(crate) port_range: Option<String>,
    pub(crate) host_regex: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RuleSpec {
    #[serde(rename = "when")]
    when: RuleWhen,
    action: String,
}

/// A compiled rule: the regex is pre-compiled once at load time instead of
/// on every match, which the original re-does per flow via `re.search`.
pub(crate) struct Rule {
    when: RuleWhen,
    host_regex: Option<Regex>,
    port_range: Option<(u16, u16)>,
    pub(crate) action: Action,
}

impl Rule {
    fn compile(spec: RuleSpec) -> Option<Self> {
        let action = Action::parse(&spec.action)?;
        let host_regex = match &spec.when.host_regex {
            Some(pattern) => match Regex::new(&format!("(?i){pattern}")) {
                Ok(re) => Some(re),
                Err(err) => {
                    warn!(%pattern, %err, "invalid host_regex in traffic rule, rule will never match on host");
                    None
                }
            },
            None => None,
        };
        let port_range = spec.when.port_range.as_deref().and_then(parse_port_range);
        Some(Rule {
            when: spec.when,
            host_regex,
            port_range,
            action,
        })
    }

    pub(crate) fn matches(
        &self,
        proto: &str,
        host: &str,
        port: u16,
        socks_available: bool,
        is_udp: bool,
    ) -> bool {
        if let Some(rp) = &self.when.proto {
            let rp = rp.to_ascii_lowercase();
            if rp != "any" && rp != proto {
                return false;
            }
        }
        if let Some(ru) = self.when.is_udp {
            if ru != is_udp {
                return false;
            }
        }
        if let Some(rsa) = self.when.socks_available {
            if rsa != socks_available {
                return false;
            }
        }
        if let Some(rport) = self.when.port {
            if rport != port {
                return false;
            }
        }
        if let Some((lo, hi)) = self.port_range {
            if !(lo..=hi).contains(&port) {
                return false;
            }
        }
        if let Some(re) = &self.host_regex {
            if !re.is_match(host) {
                return false;
            }
        }
        true
    }
}

fn parse_port_range(s: &str) -> Option<(u16, u16)> {
    let (lo, hi) = s.split_once('-')?;
    Some((lo.trim().parse().ok()?, hi.trim().parse().ok()?))
}

/// Hot-reloadable rule set (spec §4.5's traffic rules, reloadable via
/// `TRAFFIC_RULES` env var or the TOML config's `traffic_rules`).
/// `ArcSwap` is the idiomatic lock-free choice here since rules are read on
/// every single flow but written only on reload — a pack addition borrowed
/// from what this domain typically reaches for (not present in the
/// teacher, which has no comparable hot-reloadable config).
pub(crate) struct PolicyEngine {
    rules: ArcSwap<Vec<Rule>>,
}

impl PolicyEngine {
    pub(crate) fn load(raw_json: &str) -> Self {
        let rules = parse_rules(raw_json);
        Self {
            rules: ArcSwap::new(Arc::new(rules)),
        }
    }

    pub(crate) fn reload(&self, raw_json: &str) {
        let rules = parse_rules(raw_json);
        debug!(count = rules.len(), "reloaded traffic policy rules");
        self.rules.store(Arc::new(rules));
    }

    /// First-match-wins evaluation; `None` means no rule matched and the
    /// caller should fall back to its default (SOCKS-or-bypass) logic.
    pub(crate) fn decide(
        &self,
        proto: &str,
        host: &str,
        port: u16,
        socks_available: bool,
        is_udp: bool,
    ) -> Option<Action> {
        self.rules
            .load()
            .iter()
            .find(|rule| rule.matches(proto, host, port, socks_available, is_udp))
            .map(|rule| rule.action)
    }
}

fn parse_rules(raw_json: &str) -> Vec<Rule> {
    if raw_json.trim().is_empty() {
        return Vec::new();
    }
    match serde_json::from_str::<Vec<RuleSpec>>(raw_json) {
        Ok(specs) => specs.into_iter().filter_map(Rule::compile).collect(),
        Err(err) => {
            warn!(%err, "invalid TRAFFIC_RULES JSON, ignoring all rules");
            Vec::new()
        }
    }
}
