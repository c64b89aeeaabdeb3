//! Filter rules and the policy engine that resolves a bus name to a [`PolicyLevel`]
//! (§3 "Filter rule", §4.4).

use std::collections::HashMap;

use enumflags2::{bitflags, BitFlags};

use crate::error::ConfigError;

/// A totally ordered visibility/capability grade. Derived `Ord` gives us `NONE < SEE <
/// TALK < OWN` for free, matching the comparisons the dispatch table in §4.5 needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PolicyLevel {
    None,
    See,
    Talk,
    Own,
}

/// Which message shapes a call/broadcast rule applies to (§3).
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleType {
    Call = 0b01,
    Broadcast = 0b10,
}

/// One entry in a name's filter chain: a policy level plus, for call/broadcast rules,
/// the interface/member/path constraints parsed out of a rule string (§3, §4.4).
#[derive(Debug, Clone)]
pub struct FilterRule {
    pub policy: PolicyLevel,
    pub types: BitFlags<RuleType>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub path: Option<String>,
    pub path_is_subtree: bool,
    /// Only meaningful for name-policy rules: true when the configuring name ended in
    /// `.*`, meaning this rule widens across every dotted prefix of a candidate name
    /// (§3 "name_is_subtree", §4.4). Call/broadcast rules leave this false; their own
    /// subtree-ness lives in `path_is_subtree` instead.
    pub name_is_subtree: bool,
}

impl FilterRule {
    /// A bare name-policy rule: only `policy` (and `name_is_subtree`) is consulted.
    pub fn name_policy(policy: PolicyLevel) -> Self {
        Self::name_policy_with_subtree(policy, false)
    }

    pub fn name_policy_with_subtree(policy: PolicyLevel, name_is_subtree: bool) -> Self {
        FilterRule {
            policy,
            types: RuleType::Call | RuleType::Broadcast,
            interface: None,
            member: None,
            path: None,
            path_is_subtree: false,
            name_is_subtree,
        }
    }

    /// Parse a rule string of the form `[interface[.member]][@path]`, where `*` means
    /// "any" and a trailing `/*` on the path marks a subtree (§3).
    pub fn parse_call_rule(
        policy: PolicyLevel,
        types: BitFlags<RuleType>,
        rule: &str,
    ) -> Result<Self, ConfigError> {
        let (iface_member, path) = match rule.split_once('@') {
            Some((im, p)) => (im, Some(p)),
            None => (rule, None),
        };

        let (interface, member) = if iface_member.is_empty() || iface_member == "*" {
            (None, None)
        } else if let Some((iface, member)) = iface_member.rsplit_once('.') {
            let iface = if iface == "*" { None } else { Some(iface.to_owned()) };
            let member = if member == "*" { None } else { Some(member.to_owned()) };
            (iface, member)
        } else {
            (Some(iface_member.to_owned()), None)
        };

        let (path, path_is_subtree) = match path {
            None | Some("*") => (None, false),
            Some(p) if p.ends_with("/*") => (Some(p.trim_end_matches("/*").to_owned()), true),
            Some(p) => (Some(p.to_owned()), false),
        };

        Ok(FilterRule {
            policy,
            types,
            interface,
            member,
            path,
            path_is_subtree,
            name_is_subtree: false,
        })
    }

    /// Does this rule apply to a call/broadcast of `msg_type` at (`path`, `interface`,
    /// `member`)? Requires `policy >= TALK` per §4.4.
    pub fn matches_call(
        &self,
        msg_type: BitFlags<RuleType>,
        path: Option<&str>,
        interface: Option<&str>,
        member: Option<&str>,
    ) -> bool {
        if self.policy < PolicyLevel::Talk {
            return false;
        }
        if (self.types & msg_type).is_empty() {
            return false;
        }
        if let Some(want) = &self.interface {
            if interface != Some(want.as_str()) {
                return false;
            }
        }
        if let Some(want) = &self.member {
            if member != Some(want.as_str()) {
                return false;
            }
        }
        if let Some(want) = &self.path {
            match path {
                Some(p) if p == want => {}
                Some(p) if self.path_is_subtree && is_subtree_of(p, want) => {}
                _ => return false,
            }
        }
        true
    }
}

fn is_subtree_of(candidate: &str, prefix: &str) -> bool {
    candidate
        .strip_prefix(prefix)
        .map(|rest| rest.is_empty() || rest.starts_with('/'))
        .unwrap_or(false)
}

/// The three fixed sentinel rules used to make unique names visible to broadcast
/// matching even though they never appear in `filters` directly (§4.4, §10.7): built
/// once, at proxy construction, rather than allocated per lookup.
pub fn sentinel_rules() -> [FilterRule; 3] {
    [
        FilterRule::name_policy(PolicyLevel::See),
        FilterRule::name_policy(PolicyLevel::Talk),
        FilterRule::name_policy(PolicyLevel::Own),
    ]
}

fn sentinel_for(level: PolicyLevel) -> Option<FilterRule> {
    match level {
        PolicyLevel::None => None,
        other => Some(FilterRule::name_policy(other)),
    }
}

/// The bus daemon's own well-known name is always reachable at TALK, regardless of
/// configured filters — otherwise no client could even issue `Hello` (§4.4, grounded on
/// the original `FlatpakProxy` constructor's `add_policy("org.freedesktop.DBus", ...,
/// FLATPAK_POLICY_TALK)`).
pub const BUS_NAME: &str = "org.freedesktop.DBus";

/// The proxy's full set of configured filters, keyed by bus name (§3 `Proxy.filters`).
#[derive(Debug, Default, Clone)]
pub struct Filters {
    rules: HashMap<String, Vec<FilterRule>>,
}

impl Filters {
    pub fn new() -> Self {
        let mut filters = Filters { rules: HashMap::new() };
        filters.add(BUS_NAME, FilterRule::name_policy(PolicyLevel::Talk));
        filters
    }

    pub fn add(&mut self, name: impl Into<String>, rule: FilterRule) {
        self.rules.entry(name.into()).or_default().push(rule);
    }

    /// Highest policy level reachable for `source`, combining subtree matches along
    /// dotted prefixes per §4.4.
    pub fn max_policy(&self, source: &str) -> PolicyLevel {
        self.max_policy_and_matched(source).0
    }

    /// As [`Filters::max_policy`], but also returns every matching rule (used by
    /// broadcast filtering, §4.4 and §4.6 step 5).
    pub fn max_policy_and_matched(&self, source: &str) -> (PolicyLevel, Vec<FilterRule>) {
        if source.is_empty() {
            return (PolicyLevel::Talk, Vec::new());
        }

        let mut level = PolicyLevel::None;
        let mut matched = Vec::new();
        let mut first_iteration = true;
        let mut name = source;

        loop {
            if let Some(rules) = self.rules.get(name) {
                for rule in rules {
                    if first_iteration || rule_is_subtree(rule) {
                        if rule.policy > level {
                            level = rule.policy;
                        }
                        matched.push(rule.clone());
                    }
                }
            }

            match name.rfind('.') {
                Some(idx) if !first_iteration || idx > 0 => {
                    name = &name[..idx];
                    first_iteration = false;
                }
                _ => break,
            }
        }

        if let Some(sentinel) = sentinel_for(level) {
            matched.push(sentinel);
        }

        (level, matched)
    }

    /// Resolve policy for a unique name, combining the name's own recorded level with
    /// the maximum level of every well-known name it is known to own (§4.4).
    pub fn max_policy_for_unique(
        &self,
        own_level: PolicyLevel,
        owned_names: &[String],
    ) -> PolicyLevel {
        owned_names
            .iter()
            .map(|n| self.max_policy(n))
            .fold(own_level, PolicyLevel::max)
    }

    /// Every configured filter name that carries a name-policy rule, paired with
    /// whether any such rule is a subtree rule. Used to drive the initial synthetic
    /// `AddMatch`/`GetNameOwner`/`ListNames` burst (§4.7).
    pub fn configured_names(&self) -> Vec<(String, bool)> {
        self.rules
            .iter()
            .filter(|(name, _)| name.as_str() != BUS_NAME)
            .filter_map(|(name, rules)| {
                let name_rules: Vec<&FilterRule> = rules
                    .iter()
                    .filter(|r| r.interface.is_none() && r.member.is_none() && r.path.is_none())
                    .collect();
                if name_rules.is_empty() {
                    return None;
                }
                let is_subtree = name_rules.iter().any(|r| r.name_is_subtree);
                Some((name.clone(), is_subtree))
            })
            .collect()
    }
}

fn rule_is_subtree(rule: &FilterRule) -> bool {
    rule.name_is_subtree
}
