//LICENSE Portions Copyright 2019-2021 ZomboDB, LLC.
//LICENSE
//LICENSE Portions Copyright 2021-2023 Technology Concepts & Design, Inc.
//LICENSE
//LICENSE Portions Copyright 2023-2023 PgCentral Foundation, Inc. <contact@pgcentral.org>
//LICENSE
//LICENSE All rights reserved.
//LICENSE
//LICENSE Use of this source code is governed by the MIT license that can be found in the LICENSE file.
//! Symbol filter rules: allow, deny, rename and opaque.
use crate::ir::SymbolKind;
use regex::Regex;
use serde::Deserialize;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    Allow,
    Deny,
    /// Replacement text; may refer to pattern captures as `$1`, `${name}`
    Rename(String),
    Opaque,
}

#[derive(Clone, Debug)]
pub struct FilterRule {
    source: String,
    pattern: Regex,
    kinds: Vec<SymbolKind>,
    action: Action,
}

impl FilterRule {
    /// `pattern` must match the whole symbol name (without its `struct`/`union`/`enum` tag).
    pub fn new(pattern: &str, action: Action) -> Result<Self, regex::Error> {
        let anchored = Regex::new(&format!("^(?:{pattern})$"))?;
        Ok(FilterRule { source: pattern.to_string(), pattern: anchored, kinds: Vec::new(), action })
    }

    pub fn allow(pattern: &str) -> Result<Self, regex::Error> {
        Self::new(pattern, Action::Allow)
    }

    pub fn deny(pattern: &str) -> Result<Self, regex::Error> {
        Self::new(pattern, Action::Deny)
    }

    pub fn rename(pattern: &str, to: &str) -> Result<Self, regex::Error> {
        Self::new(pattern, Action::Rename(to.to_string()))
    }

    pub fn opaque(pattern: &str) -> Result<Self, regex::Error> {
        Self::new(pattern, Action::Opaque)
    }

    /// Restrict the rule to these kinds of symbol.  An empty list matches every kind.
    pub fn for_kinds(mut self, kinds: impl IntoIterator<Item = SymbolKind>) -> Self {
        self.kinds = kinds.into_iter().collect();
        self
    }

    pub fn pattern(&self) -> &str {
        &self.source
    }

    pub fn action(&self) -> &Action {
        &self.action
    }

    pub fn matches(&self, name: &str, kind: SymbolKind) -> bool {
        (self.kinds.is_empty() || self.kinds.contains(&kind)) && self.pattern.is_match(name)
    }
}

/// What the emitter does with one symbol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Emit under `name`.  `explicit` is set when an allow or rename rule matched, which
    /// overrides the default treatment of symbols Rust cannot link against.
    Emit { name: String, explicit: bool },
    Deny,
    Opaque,
}

/// An ordered rule list.  The first rule that matches a symbol decides it.
#[derive(Clone, Debug, Default)]
pub struct RuleSet {
    rules: Vec<FilterRule>,
}

impl RuleSet {
    pub fn new(rules: Vec<FilterRule>) -> Self {
        RuleSet { rules }
    }

    pub fn push(&mut self, rule: FilterRule) {
        self.rules.push(rule);
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn decide(&self, name: &str, kind: SymbolKind) -> Decision {
        let Some(rule) = self.rules.iter().find(|r| r.matches(name, kind)) else {
            return Decision::Emit { name: name.to_string(), explicit: false };
        };
        tracing::trace!(symbol = name, %kind, rule = rule.pattern(), "rule matched");
        match &rule.action {
            Action::Allow => Decision::Emit { name: name.to_string(), explicit: true },
            Action::Deny => Decision::Deny,
            Action::Opaque => Decision::Opaque,
            Action::Rename(to) => Decision::Emit {
                name: rule.pattern.replace(name, to.as_str()).into_owned(),
                explicit: true,
            },
        }
    }
}

impl FromIterator<FilterRule> for RuleSet {
    fn from_iter<T: IntoIterator<Item = FilterRule>>(iter: T) -> Self {
        RuleSet { rules: iter.into_iter().collect() }
    }
}

/// A rule as written in `pgffi.toml`:
///
/// ```toml
/// [[rule]]
/// pattern = "pg_(.*)_internal"
/// action = "rename"
/// to = "${1}_impl"
/// kinds = ["function"]
/// ```
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleSpec {
    pub pattern: String,
    pub action: ActionSpec,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub kinds: Vec<SymbolKind>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionSpec {
    Allow,
    Deny,
    Rename,
    Opaque,
}

#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("rule `{0}` has an invalid pattern")]
    Pattern(String, #[source] regex::Error),
    #[error("rule `{0}` renames but has no `to`")]
    MissingTarget(String),
    #[error("rule `{0}` has a `to` but does not rename")]
    UnexpectedTarget(String),
}

impl TryFrom<RuleSpec> for FilterRule {
    type Error = RuleError;

    fn try_from(spec: RuleSpec) -> Result<Self, Self::Error> {
        let action = match (spec.action, spec.to) {
            (ActionSpec::Rename, Some(to)) => Action::Rename(to),
            (ActionSpec::Rename, None) => return Err(RuleError::MissingTarget(spec.pattern)),
            (_, Some(_)) => return Err(RuleError::UnexpectedTarget(spec.pattern)),
            (ActionSpec::Allow, None) => Action::Allow,
            (ActionSpec::Deny, None) => Action::Deny,
            (ActionSpec::Opaque, None) => Action::Opaque,
        };
        let rule = FilterRule::new(&spec.pattern, action)
            .map_err(|e| RuleError::Pattern(spec.pattern.clone(), e))?;
        Ok(rule.for_kinds(spec.kinds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patterns_are_anchored() {
        let rule = FilterRule::deny("palloc").unwrap();
        assert!(rule.matches("palloc", SymbolKind::Function));
        assert!(!rule.matches("palloc0", SymbolKind::Function));
        assert!(!rule.matches("repalloc", SymbolKind::Function));
    }

    #[test]
    fn first_match_wins() {
        let rules = RuleSet::new(vec![
            FilterRule::allow("pg_detoast_datum").unwrap(),
            FilterRule::deny("pg_.*").unwrap(),
            FilterRule::opaque("pg_detoast_datum").unwrap(),
        ]);
        assert_eq!(
            rules.decide("pg_detoast_datum", SymbolKind::Function),
            Decision::Emit { name: "pg_detoast_datum".into(), explicit: true }
        );
        assert_eq!(rules.decide("pg_atoi", SymbolKind::Function), Decision::Deny);
        assert_eq!(
            rules.decide("palloc", SymbolKind::Function),
            Decision::Emit { name: "palloc".into(), explicit: false }
        );
    }

    #[test]
    fn rename_with_captures() {
        let rules = RuleSet::new(vec![FilterRule::rename("pg_(.*)_internal", "${1}_impl").unwrap()]);
        assert_eq!(
            rules.decide("pg_lock_internal", SymbolKind::Function),
            Decision::Emit { name: "lock_impl".into(), explicit: true }
        );
    }

    #[test]
    fn kinds_restrict_matches() {
        let rules = RuleSet::new(vec![
            FilterRule::opaque("Relation.*").unwrap().for_kinds([SymbolKind::Struct]),
        ]);
        assert_eq!(rules.decide("RelationData", SymbolKind::Struct), Decision::Opaque);
        assert_eq!(
            rules.decide("RelationData", SymbolKind::Typedef),
            Decision::Emit { name: "RelationData".into(), explicit: false }
        );
    }

    #[test]
    fn rule_specs_from_toml() {
        #[derive(Deserialize)]
        struct Doc {
            rule: Vec<RuleSpec>,
        }
        let doc: Doc = toml::from_str(
            r#"
            [[rule]]
            pattern = "Foo(.*)"
            action = "rename"
            to = "Bar$1"
            kinds = ["struct", "typedef"]

            [[rule]]
            pattern = "bad"
            action = "deny"
            "#,
        )
        .unwrap();
        let rules = doc
            .rule
            .into_iter()
            .map(FilterRule::try_from)
            .collect::<Result<RuleSet, _>>()
            .unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(
            rules.decide("FooData", SymbolKind::Typedef),
            Decision::Emit { name: "BarData".into(), explicit: true }
        );

        let missing = RuleSpec {
            pattern: "x".into(),
            action: ActionSpec::Rename,
            to: None,
            kinds: vec![],
        };
        assert!(matches!(FilterRule::try_from(missing), Err(RuleError::MissingTarget(_))));
        let bad = RuleSpec { pattern: "(".into(), action: ActionSpec::Deny, to: None, kinds: vec![] };
        assert!(matches!(FilterRule::try_from(bad), Err(RuleError::Pattern(..))));
    }
}
