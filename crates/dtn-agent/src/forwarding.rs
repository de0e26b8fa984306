//! Bundles indexed by destination, plus the alias graph routers maintain.
//!
//! `link(dst, next)` records that bundles for `dst` should also be handed
//! to `next`. Lookups walk the edges backwards from the neighbor at hand:
//!
//! ```text
//!   link(d, n1), link(n1, n2)        aliases: n1 → {d}, n2 → {n1}
//!   search(n2) = bundles[n2] ∪ bundles[n1] ∪ bundles[d]
//! ```

use dtn_wire::eid::DTN_SCHEME;
use dtn_wire::{Bundle, Eid, EidRegistry};
use std::collections::{HashMap, HashSet};
use tracing::{trace, warn};

pub struct ForwardingStore {
    eids: EidRegistry,
    bundles: HashMap<Eid, HashSet<Bundle>>,
    aliases: HashMap<Eid, HashSet<Eid>>,
}

impl ForwardingStore {
    pub fn new(eids: EidRegistry) -> Self {
        Self {
            eids,
            bundles: HashMap::new(),
            aliases: HashMap::new(),
        }
    }

    /// Groups every scheme of one host under its `dtn` identity.
    fn key(&self, eid: &Eid) -> Eid {
        if eid.scheme() == DTN_SCHEME {
            return eid.clone();
        }
        eid.with_scheme(&self.eids, DTN_SCHEME)
            .unwrap_or_else(|_| eid.clone())
    }

    pub fn add(&mut self, bundle: Bundle) -> bool {
        let key = self.key(bundle.destination());
        self.bundles.entry(key).or_default().insert(bundle)
    }

    pub fn remove(&mut self, bundle: &Bundle) -> bool {
        let key = self.key(bundle.destination());
        let Some(set) = self.bundles.get_mut(&key) else {
            return false;
        };
        let removed = set.remove(bundle);
        if set.is_empty() {
            self.bundles.remove(&key);
        }
        removed
    }

    /// Bundles for `dst` may also be given to `next`. Self-loops are refused.
    pub fn link(&mut self, dst: &Eid, next: &Eid) -> bool {
        let (dst, next) = (self.key(dst), self.key(next));
        if dst == next {
            warn!(%dst, "refusing self-loop alias");
            return false;
        }
        trace!(%dst, %next, "alias linked");
        self.aliases.entry(next).or_default().insert(dst)
    }

    pub fn unlink(&mut self, dst: &Eid, next: &Eid) -> bool {
        let (dst, next) = (self.key(dst), self.key(next));
        let Some(set) = self.aliases.get_mut(&next) else {
            return false;
        };
        let removed = set.remove(&dst);
        if set.is_empty() {
            self.aliases.remove(&next);
        }
        removed
    }

    /// Everything that should be handed to `target`: bundles destined to
    /// it and to every destination that reaches it through alias edges.
    /// Each bundle appears once, in discovery order.
    pub fn search_bundles(&self, target: &Eid) -> Vec<Bundle> {
        let start = self.key(target);
        let mut visited = HashSet::new();
        let mut seen = HashSet::new();
        let mut result = Vec::new();
        let mut stack = vec![start];

        while let Some(node) = stack.pop() {
            if !visited.insert(node.clone()) {
                continue;
            }
            if let Some(bundles) = self.bundles.get(&node) {
                for bundle in bundles {
                    if seen.insert(bundle.id()) {
                        result.push(bundle.clone());
                    }
                }
            }
            if let Some(dsts) = self.aliases.get(&node) {
                stack.extend(dsts.iter().filter(|d| !visited.contains(*d)).cloned());
            }
        }
        result
    }

    pub fn contains_bundles(&self, dst: &Eid) -> bool {
        self.bundles
            .get(&self.key(dst))
            .is_some_and(|set| !set.is_empty())
    }

    pub fn aliases_of(&self, next: &Eid) -> Vec<Eid> {
        self.aliases
            .get(&self.key(next))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.bundles.values().map(HashSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }
}
