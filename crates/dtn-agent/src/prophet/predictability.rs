//! Delivery predictability table.
//!
//! All updates take the simulated time explicitly so the math can be
//! driven deterministically.

use dtn_wire::Eid;
use std::collections::HashMap;

/// Predictability assigned on the first encounter with a neighbor.
pub const P_FIRST: f32 = 0.5;
pub const P_ENCOUNTER_MAX: f32 = 0.7;
pub const BETA: f32 = 0.9;
pub const GAMMA: f32 = 0.999;
pub const DELTA: f32 = 0.01;
/// Typical interval between encounters.
pub const I_TYP_MS: u64 = 5 * 60 * 1000;
/// Aging time unit.
pub const K_MS: f64 = 24.0 * 3600.0 * 1000.0;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Entry {
    p: f32,
    last_ms: u64,
}

impl Entry {
    fn age(&mut self, now_ms: u64) {
        let elapsed = now_ms.saturating_sub(self.last_ms) as f64;
        self.p = (self.p as f64 * (GAMMA as f64).powf(elapsed / K_MS)) as f32;
        self.last_ms = now_ms;
    }
}

#[derive(Debug, Default, Clone)]
pub struct Predictability {
    entries: HashMap<Eid, Entry>,
}

impl Predictability {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value without aging. Endpoints never heard of are at 0.
    pub fn get(&self, eid: &Eid) -> f32 {
        self.entries.get(eid).map_or(0.0, |e| e.p)
    }

    pub fn contains(&self, eid: &Eid) -> bool {
        self.entries.contains_key(eid)
    }

    /// Direct encounter with `eid`. Returns the new value.
    ///
    /// A first encounter starts at [`P_FIRST`]. Later ones age the value,
    /// then move it towards `1 - DELTA` by
    /// `P_ENCOUNTER_MAX * min(1, Δt / I_TYP)`.
    pub fn encounter(&mut self, eid: &Eid, now_ms: u64) -> f32 {
        let entry = self.entries.entry(eid.clone()).or_insert(Entry {
            p: P_FIRST,
            last_ms: now_ms,
        });
        let interval = now_ms.saturating_sub(entry.last_ms);
        let p_encounter = if interval >= I_TYP_MS {
            P_ENCOUNTER_MAX
        } else {
            P_ENCOUNTER_MAX * (interval as f32 / I_TYP_MS as f32)
        };
        entry.age(now_ms);
        entry.p += (1.0 - DELTA - entry.p) * p_encounter;
        entry.p
    }

    /// `p_ac = max(p_ac, p_ab * p_bc * BETA)` after aging `p_ac`.
    pub fn transitive(&mut self, c: &Eid, p_ab: f32, p_bc: f32, now_ms: u64) -> f32 {
        let entry = self.entries.entry(c.clone()).or_insert(Entry {
            p: 0.0,
            last_ms: now_ms,
        });
        entry.age(now_ms);
        entry.p = entry.p.max(p_ab * p_bc * BETA);
        entry.p
    }

    /// Ages every entry to `now_ms`.
    pub fn age_all(&mut self, now_ms: u64) {
        for entry in self.entries.values_mut() {
            entry.age(now_ms);
        }
    }

    /// Snapshot of every known value, sorted by EID.
    pub fn predictions(&self) -> Vec<(Eid, f32)> {
        let mut all: Vec<_> = self.entries.iter().map(|(eid, e)| (eid.clone(), e.p)).collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dtn_wire::EidRegistry;

    #[test]
    fn first_encounter_starts_at_p_first() {
        let eids = EidRegistry::new();
        let b = eids.host("b").unwrap();
        let mut table = Predictability::new();
        assert_eq!(table.get(&b), 0.0);
        assert_eq!(table.encounter(&b, 1_000), P_FIRST);
    }

    #[test]
    fn encounter_after_typical_interval_increases() {
        let eids = EidRegistry::new();
        let b = eids.host("b").unwrap();
        let mut table = Predictability::new();
        table.encounter(&b, 0);
        let p = table.encounter(&b, I_TYP_MS);
        assert!(p > P_FIRST);
        // aging over 5 minutes is tiny, so the update dominates
        let expected = P_FIRST + (1.0 - DELTA - P_FIRST) * P_ENCOUNTER_MAX;
        assert!((p - expected).abs() < 1e-3);
    }

    #[test]
    fn quick_reencounter_barely_moves() {
        let eids = EidRegistry::new();
        let b = eids.host("b").unwrap();
        let mut table = Predictability::new();
        table.encounter(&b, 0);
        let p = table.encounter(&b, 0);
        assert_eq!(p, P_FIRST);
    }

    #[test]
    fn long_idle_ages_down() {
        let eids = EidRegistry::new();
        let b = eids.host("b").unwrap();
        let mut table = Predictability::new();
        table.encounter(&b, 0);
        table.age_all(1000 * K_MS as u64);
        let aged = table.get(&b);
        assert!(aged < P_FIRST);
        assert!((aged - P_FIRST * GAMMA.powi(1000)).abs() < 1e-4);
    }

    #[test]
    fn transitive_takes_maximum() {
        let eids = EidRegistry::new();
        let c = eids.host("c").unwrap();
        let mut table = Predictability::new();
        let p = table.transitive(&c, 0.8, 0.5, 0);
        assert!((p - 0.8 * 0.5 * BETA).abs() < 1e-6);
        // a weaker path does not lower it
        assert_eq!(table.transitive(&c, 0.1, 0.1, 0), p);
    }

    #[test]
    fn predictions_are_sorted() {
        let eids = EidRegistry::new();
        let mut table = Predictability::new();
        table.encounter(&eids.host("z").unwrap(), 0);
        table.encounter(&eids.host("a").unwrap(), 0);
        let names: Vec<_> = table.predictions().into_iter().map(|(e, _)| e.to_string()).collect();
        assert_eq!(names, vec!["dtn://a", "dtn://z"]);
    }
}
