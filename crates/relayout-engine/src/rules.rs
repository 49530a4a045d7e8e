//! Call-site rewrite rules
//!
//! A rule is owned by the type whose redefinition produced it and published
//! in the scope of the type it targets: rules on bootstrap types live in the
//! bootstrap scope, which every loader sees. A redefinition replaces the full
//! set owned by its type; rules owned by other types are left alone.

use crate::identity::{LoaderId, TypeIdentifier};
use crate::layout::SlotId;
use crate::vm::Loader;
use crate::weak::WeakKeyMap;
use dashmap::DashMap;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;

/// How matching sites are rewritten
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RewriteKind {
    /// Method entry of an ancestor's method gets the subclass-dispatch prologue
    SubclassDispatch,
    /// Field accesses go through the added-member store
    FieldRedirect {
        /// Storage slot
        slot: SlotId,
        /// Static field
        is_static: bool,
    },
    /// Calls go through the dispatch table
    MethodRedirect {
        /// Static method
        is_static: bool,
    },
}

/// One rewrite rule
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PatchRule {
    /// Type whose members are targeted
    pub owner: TypeIdentifier,
    /// Member name
    pub name: String,
    /// Member descriptor
    pub descriptor: String,
    /// Rewrite kind
    pub kind: RewriteKind,
}

impl PatchRule {
    /// Create a rule
    pub fn new(
        owner: TypeIdentifier,
        name: impl Into<String>,
        descriptor: impl Into<String>,
        kind: RewriteKind,
    ) -> Self {
        Self {
            owner,
            name: name.into(),
            descriptor: descriptor.into(),
            kind,
        }
    }
}

type RuleMap = Arc<DashMap<TypeIdentifier, FxHashSet<PatchRule>>>;

/// Rules by scope loader and owning type
#[derive(Debug)]
pub struct PatchRuleStore {
    bootstrap: Arc<Loader>,
    rules: WeakKeyMap<Loader, RuleMap>,
}

fn owner_id(owner_type: &str, loader: Option<&Arc<Loader>>) -> TypeIdentifier {
    TypeIdentifier::new(owner_type, loader.map_or(LoaderId::BOOTSTRAP, |l| l.id()))
}

impl PatchRuleStore {
    /// Create an empty store
    pub fn new(bootstrap: Arc<Loader>) -> Self {
        Self {
            bootstrap,
            rules: WeakKeyMap::new(),
        }
    }

    fn rules_for(&self, scope: &Arc<Loader>) -> RuleMap {
        self.rules
            .get_or_insert_with(scope, || Arc::new(DashMap::new()))
    }

    /// Scope a rule is published in when its owner was defined by `loader`
    fn scope_of(&self, rule: &PatchRule, loader: Option<&Arc<Loader>>) -> Arc<Loader> {
        match loader {
            Some(loader) if !rule.owner.loader().is_bootstrap() => loader.clone(),
            _ => self.bootstrap.clone(),
        }
    }

    /// Publish a rule owned by `owner_type` in `loader`
    pub fn add(&self, owner_type: &str, loader: Option<&Arc<Loader>>, rule: PatchRule) {
        tracing::debug!(owner = owner_type, target = %rule.owner, member = %rule.name, kind = ?rule.kind, "installed patch rule");
        let scope = self.scope_of(&rule, loader);
        self.rules_for(&scope)
            .entry(owner_id(owner_type, loader))
            .or_default()
            .insert(rule);
    }

    /// Swap the full set of rules owned by one type
    ///
    /// Each scope sees either the previous set or the new one, never a
    /// partially cleared set.
    pub fn replace(
        &self,
        owner_type: &str,
        loader: Option<&Arc<Loader>>,
        rules: impl IntoIterator<Item = PatchRule>,
    ) {
        let owner = owner_id(owner_type, loader);
        let mut scoped: Vec<(Arc<Loader>, FxHashSet<PatchRule>)> = Vec::new();
        for rule in rules {
            let scope = self.scope_of(&rule, loader);
            match scoped.iter_mut().find(|(s, _)| Arc::ptr_eq(s, &scope)) {
                Some((_, set)) => {
                    set.insert(rule);
                }
                None => scoped.push((scope, std::iter::once(rule).collect())),
            }
        }

        for (scope, set) in &scoped {
            tracing::debug!(%owner, rules = set.len(), scope = %scope.id(), "replaced patch rules");
            self.rules_for(scope).insert(owner.clone(), set.clone());
        }
        for (scope, map) in self.rules.entries() {
            if !scoped.iter().any(|(s, _)| Arc::ptr_eq(s, &scope)) {
                map.remove(&owner);
            }
        }
    }

    /// Snapshot of every rule published in `loader`, by owning type name
    ///
    /// Owners from different loaders that share a name are merged.
    pub fn get(&self, loader: Option<&Arc<Loader>>) -> FxHashMap<String, FxHashSet<PatchRule>> {
        let mut out: FxHashMap<String, FxHashSet<PatchRule>> = FxHashMap::default();
        for entry in self.rules_for(loader.unwrap_or(&self.bootstrap)).iter() {
            out.entry(entry.key().name().to_string())
                .or_default()
                .extend(entry.value().iter().cloned());
        }
        out
    }

    /// Rules owned by one type, wherever they are published
    pub fn owned_by(&self, loader: Option<&Arc<Loader>>, owner_type: &str) -> FxHashSet<PatchRule> {
        let owner = owner_id(owner_type, loader);
        self.rules
            .entries()
            .into_iter()
            .filter_map(|(_, map)| map.get(&owner).map(|set| set.clone()))
            .flatten()
            .collect()
    }

    /// Remove the rules owned by one type in one loader
    pub fn clear(&self, loader: Option<&Arc<Loader>>, owner_type: &str) {
        let owner = owner_id(owner_type, loader);
        for (_, map) in self.rules.entries() {
            map.remove(&owner);
        }
    }

    /// Drop the rules of collected loaders
    pub fn purge(&self) -> usize {
        self.rules.purge()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(owner: TypeIdentifier, name: &str) -> PatchRule {
        PatchRule::new(
            owner,
            name,
            "I",
            RewriteKind::FieldRedirect {
                slot: SlotId(1),
                is_static: false,
            },
        )
    }

    fn rule(owner: &str, name: &str) -> PatchRule {
        field(TypeIdentifier::bootstrap(owner), name)
    }

    #[test]
    fn test_rules_are_additive_across_types() {
        let store = PatchRuleStore::new(Loader::bootstrap());
        store.add("app/A", None, rule("app/A", "x"));
        store.add("app/B", None, rule("app/B", "y"));
        store.add("app/A", None, rule("app/A", "x"));

        let rules = store.get(None);
        assert_eq!(rules.len(), 2);
        assert_eq!(rules["app/A"].len(), 1);
    }

    #[test]
    fn test_clear_is_scoped() {
        let store = PatchRuleStore::new(Loader::bootstrap());
        let app = Loader::new("app");
        let local = |name: &str| TypeIdentifier::new(name, app.id());
        store.add("app/A", None, rule("app/A", "x"));
        store.add("app/A", Some(&app), field(local("app/A"), "x"));
        store.add("app/B", Some(&app), field(local("app/B"), "y"));

        store.clear(Some(&app), "app/A");
        assert!(store.get(Some(&app)).get("app/A").is_none());
        assert!(store.get(Some(&app)).get("app/B").is_some());
        assert!(store.get(None).get("app/A").is_some());
    }

    #[test]
    fn test_rule_on_bootstrap_type_is_published_there_but_owned_locally() {
        let store = PatchRuleStore::new(Loader::bootstrap());
        let app = Loader::new("app");
        let dispatch = PatchRule::new(
            TypeIdentifier::bootstrap("lib/Base"),
            "describe",
            "()I",
            RewriteKind::SubclassDispatch,
        );
        store.add("app/Derived", Some(&app), dispatch.clone());

        assert!(store.get(None)["app/Derived"].contains(&dispatch));
        assert!(store.get(Some(&app)).is_empty());
        assert_eq!(store.owned_by(Some(&app), "app/Derived").len(), 1);

        // Clearing the target type leaves the rule alone
        store.clear(None, "lib/Base");
        assert_eq!(store.owned_by(Some(&app), "app/Derived").len(), 1);

        store.clear(Some(&app), "app/Derived");
        assert!(store.get(None).is_empty());
    }

    #[test]
    fn test_replace_swaps_an_owners_set_in_every_scope() {
        let store = PatchRuleStore::new(Loader::bootstrap());
        let app = Loader::new("app");
        let local = TypeIdentifier::new("app/A", app.id());
        store.add("app/A", Some(&app), field(local.clone(), "x"));
        store.add("app/A", Some(&app), rule("lib/Base", "shared"));
        store.add("app/B", Some(&app), field(TypeIdentifier::new("app/B", app.id()), "y"));

        store.replace("app/A", Some(&app), [field(local, "z")]);

        let owned = store.owned_by(Some(&app), "app/A");
        assert_eq!(owned.len(), 1);
        assert!(owned.iter().all(|r| r.name == "z"));
        assert!(store.get(None).is_empty());
        assert_eq!(store.get(Some(&app)).len(), 2);

        store.replace("app/A", Some(&app), Vec::new());
        assert!(store.owned_by(Some(&app), "app/A").is_empty());
        assert_eq!(store.get(Some(&app)).len(), 1);
    }
}
