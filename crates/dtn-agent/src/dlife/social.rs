//! Daily-life social weights.
//!
//! Time is cut into slices of `dsdur` seconds, `dslen` slices per cycle.
//! During a slice every neighbor accumulates total contact time (TCT). When
//! the slice ends:
//!
//! ```text
//!   j        = cycles elapsed, counting the current one
//!   ad[s]    = (tct + (j - 1) * ad[s]) / j
//!   tecd[s]  = Σ_{k=0}^{dslen-1} dslen / (dslen + k) * ad[(s + k) mod dslen]
//!   tecdi[s] = d * Σ_n tecd_n[s] * tecdi_n[s] / n + (1 - d)
//! ```
//!
//! `tecd` is the weight advertised for a neighbor; `tecdi` is this node's
//! own importance. Slice indices count from [`TIME_START_MS`].

use dtn_wire::Eid;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::error::AgentError;

/// 2000-01-01T00:00:00Z.
pub const TIME_START_MS: u64 = dtn_wire::bundle::DTN_EPOCH_MS;

pub const DEFAULT_DSLEN: usize = 24;
pub const DEFAULT_DSDUR_SECS: u64 = 3600;
pub const DEFAULT_DAMPING: f32 = 0.8;

/// Shortest wait before checking for a slice boundary.
pub const MIN_SLICE_WAIT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SocialParams {
    pub dslen: usize,
    pub dsdur_secs: u64,
    pub damping: f32,
}

impl Default for SocialParams {
    fn default() -> Self {
        Self {
            dslen: DEFAULT_DSLEN,
            dsdur_secs: DEFAULT_DSDUR_SECS,
            damping: DEFAULT_DAMPING,
        }
    }
}

impl SocialParams {
    pub fn validate(self) -> Result<Self, AgentError> {
        if self.dsdur_secs < 60 {
            return Err(AgentError::config(format!(
                "dlife dsdur must be at least 60 seconds, got {}",
                self.dsdur_secs
            )));
        }
        if self.dslen < 2 {
            return Err(AgentError::config(format!(
                "dlife dslen must be at least 2, got {}",
                self.dslen
            )));
        }
        if !(0.0..=1.0).contains(&self.damping) {
            return Err(AgentError::config(format!(
                "dlife damping_factor must lie in [0, 1], got {}",
                self.damping
            )));
        }
        Ok(self)
    }

    fn dsdur_ms(&self) -> u64 {
        self.dsdur_secs * 1000
    }
}

#[derive(Debug, Clone)]
struct Neighbor {
    tecdi: Vec<f32>,
    tecd: Vec<f32>,
    ad: Vec<f32>,
    tct: f32,
}

impl Neighbor {
    fn new(dslen: usize) -> Self {
        Self {
            tecdi: vec![0.0; dslen],
            tecd: vec![0.0; dslen],
            ad: vec![0.0; dslen],
            tct: 0.0,
        }
    }

    /// Closes slot `s` in cycle `j`.
    fn close_slot(&mut self, s: usize, j: u64) {
        let dslen = self.ad.len();
        let j = j as f32;
        self.ad[s] = (self.tct + (j - 1.0) * self.ad[s]) / j;
        self.tecd[s] = (0..dslen)
            .map(|k| dslen as f32 / (dslen + k) as f32 * self.ad[(s + k) % dslen])
            .sum();
        self.tct = 0.0;
    }
}

#[derive(Debug, Clone)]
struct Sample {
    neighbors: HashSet<Eid>,
    tecdi: f32,
}

#[derive(Debug, Clone)]
pub struct SocialInformation {
    params: SocialParams,
    neighbors: HashMap<Eid, Neighbor>,
    samples: Vec<Sample>,
    first_ds: u64,
    cds: u64,
}

impl SocialInformation {
    pub fn new(params: SocialParams, now_ms: u64) -> Result<Self, AgentError> {
        let params = params.validate()?;
        let first_ds = now_ms.saturating_sub(TIME_START_MS) / params.dsdur_ms();
        let samples = (0..params.dslen)
            .map(|_| Sample {
                neighbors: HashSet::new(),
                tecdi: 1.0 - params.damping,
            })
            .collect();
        Ok(Self {
            params,
            neighbors: HashMap::new(),
            samples,
            first_ds,
            cds: first_ds,
        })
    }

    pub fn params(&self) -> SocialParams {
        self.params
    }

    /// Slice index containing `when_ms`.
    pub fn ds_at(&self, when_ms: u64) -> u64 {
        when_ms.saturating_sub(TIME_START_MS) / self.params.dsdur_ms()
    }

    /// Slice the table currently accumulates into.
    pub fn current_ds(&self) -> u64 {
        self.cds
    }

    pub fn slot(&self) -> usize {
        (self.cds % self.params.dslen as u64) as usize
    }

    pub fn elapsed_cycles(&self) -> u64 {
        (self.cds - self.first_ds) / self.params.dslen as u64 + 1
    }

    /// Advertised weight of `eid` in the current slot. `None` for endpoints
    /// never met.
    pub fn weight(&self, eid: &Eid) -> Option<f32> {
        let slot = self.slot();
        self.neighbors.get(eid).map(|n| n.tecd[slot])
    }

    /// Own importance for the current slot.
    pub fn tecdi(&self) -> f32 {
        self.samples[self.slot()].tecdi
    }

    fn enroll(&mut self, eid: &Eid) -> usize {
        let slot = self.slot();
        let dslen = self.params.dslen;
        self.neighbors
            .entry(eid.clone())
            .or_insert_with(|| Neighbor::new(dslen));
        if self.samples[slot].neighbors.insert(eid.clone()) {
            trace!(%eid, slot, "neighbor joins slice");
        }
        slot
    }

    /// Records a neighbor's self-reported importance.
    pub fn set_neighbor_tecdi(&mut self, eid: &Eid, value: f32) {
        let slot = self.enroll(eid);
        if let Some(neighbor) = self.neighbors.get_mut(eid) {
            neighbor.tecdi[slot] = value;
        }
    }

    /// Adds `seconds` of contact with `eid` to the current slice.
    pub fn update_tct(&mut self, eid: &Eid, seconds: f32) {
        let slot = self.enroll(eid);
        if let Some(neighbor) = self.neighbors.get_mut(eid) {
            neighbor.tct += seconds;
            debug!(%eid, slot, tct = neighbor.tct, "contact time updated");
        }
    }

    /// Weights of the current slice's neighbors, sorted by EID.
    pub fn sample_weights(&self) -> Vec<(Eid, f32)> {
        let slot = self.slot();
        let mut weights: Vec<_> = self.samples[slot]
            .neighbors
            .iter()
            .filter_map(|eid| self.neighbors.get(eid).map(|n| (eid.clone(), n.tecd[slot])))
            .collect();
        weights.sort_by(|a, b| a.0.cmp(&b.0));
        weights
    }

    /// Closes every slice that ended before `now_ms`. Returns how many.
    pub fn advance(&mut self, now_ms: u64) -> u64 {
        let target = self.ds_at(now_ms);
        let mut closed = 0;
        while self.cds < target {
            self.leave();
            self.cds += 1;
            self.enter();
            closed += 1;
        }
        if closed > 0 {
            debug!(ds = self.cds, slot = self.slot(), closed, tecdi = self.tecdi(), "slice advanced");
        }
        closed
    }

    fn leave(&mut self) {
        let slot = self.slot();
        let j = self.elapsed_cycles();
        let members = &self.samples[slot].neighbors;
        let n = members.len() as f32;
        let mut sum = 0.0;
        for eid in members {
            if let Some(neighbor) = self.neighbors.get_mut(eid) {
                neighbor.close_slot(slot, j);
                sum += neighbor.tecd[slot] * neighbor.tecdi[slot] / n;
            }
        }
        let d = self.params.damping;
        self.samples[slot].tecdi = sum * d + (1.0 - d);
    }

    fn enter(&mut self) {
        let slot = self.slot();
        for eid in &self.samples[slot].neighbors {
            if let Some(neighbor) = self.neighbors.get_mut(eid) {
                if neighbor.tct != 0.0 {
                    warn!(%eid, slot, tct = neighbor.tct, "stale contact time at slice start");
                    neighbor.tct = 0.0;
                }
            }
        }
    }

    /// Simulated time until the next slice boundary, at least
    /// [`MIN_SLICE_WAIT`].
    pub fn next_boundary_wait(&self, now_ms: u64) -> Duration {
        let dur = self.params.dsdur_ms();
        let into = now_ms.saturating_sub(TIME_START_MS) % dur;
        Duration::from_millis(dur - into).max(MIN_SLICE_WAIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dtn_wire::EidRegistry;

    const SLICE_MS: u64 = 60_000;

    fn params(dslen: usize) -> SocialParams {
        SocialParams {
            dslen,
            dsdur_secs: 60,
            damping: 0.8,
        }
    }

    #[test]
    fn rejects_bad_params() {
        assert!(SocialParams { dsdur_secs: 59, ..params(4) }.validate().is_err());
        assert!(params(1).validate().is_err());
        assert!(SocialParams { damping: 1.5, ..params(4) }.validate().is_err());
        assert!(SocialParams::default().validate().is_ok());
    }

    #[test]
    fn regular_contact_outweighs_single_contact() {
        let eids = EidRegistry::new();
        let regular = eids.host("regular").unwrap();
        let once = eids.host("once").unwrap();
        let mut now = TIME_START_MS + 1_000;
        let mut social = SocialInformation::new(params(4), now).unwrap();

        for i in 0..8 {
            social.update_tct(&regular, 30.0);
            if i == 0 {
                social.update_tct(&once, 30.0);
            }
            now += SLICE_MS;
            assert_eq!(social.advance(now), 1);
        }

        assert_eq!(social.slot(), 0);
        let w_regular = social.weight(&regular).unwrap();
        let w_once = social.weight(&once).unwrap();
        assert!(w_regular > w_once);
        assert!(w_regular > 30.0);
        // second cycle averages the single contact down
        assert!((w_once - 15.0).abs() < 1e-4);
        assert_eq!(social.weight(&eids.host("stranger").unwrap()), None);
    }

    #[test]
    fn first_slot_tecd_matches_formula() {
        let eids = EidRegistry::new();
        let a = eids.host("a").unwrap();
        let mut now = TIME_START_MS;
        let mut social = SocialInformation::new(params(4), now).unwrap();
        for _ in 0..4 {
            social.update_tct(&a, 10.0);
            now += SLICE_MS;
            social.advance(now);
        }
        // last slot of the cycle sees every average at 10
        let expected: f32 = (0..4).map(|k| 4.0 / (4 + k) as f32 * 10.0).sum();
        let neighbor = &social.neighbors[&a];
        assert!((neighbor.tecd[3] - expected).abs() < 1e-4);
    }

    #[test]
    fn importance_is_damped_average() {
        let eids = EidRegistry::new();
        let a = eids.host("a").unwrap();
        let now = TIME_START_MS;
        let mut social = SocialInformation::new(params(2), now).unwrap();
        assert!((social.tecdi() - 0.2).abs() < 1e-6);

        social.update_tct(&a, 10.0);
        social.set_neighbor_tecdi(&a, 0.5);
        social.advance(now + SLICE_MS);
        // tecd[0] = 10 with only one slot filled, tecdi = 0.8 * 10 * 0.5 + 0.2
        let neighbor = &social.neighbors[&a];
        assert!((neighbor.tecd[0] - 10.0).abs() < 1e-4);
        assert!((social.samples[0].tecdi - 4.2).abs() < 1e-4);
        // the new slot has not been closed yet
        assert!((social.tecdi() - 0.2).abs() < 1e-6);
    }

    #[test]
    fn sample_weights_follow_slot_membership() {
        let eids = EidRegistry::new();
        let a = eids.host("a").unwrap();
        let b = eids.host("b").unwrap();
        let now = TIME_START_MS;
        let mut social = SocialInformation::new(params(2), now).unwrap();
        social.update_tct(&b, 1.0);
        social.update_tct(&a, 1.0);
        let names: Vec<_> = social.sample_weights().into_iter().map(|(e, _)| e).collect();
        assert_eq!(names, vec![a, b]);
        social.advance(now + SLICE_MS);
        assert!(social.sample_weights().is_empty());
    }

    #[test]
    fn boundary_wait_is_clamped() {
        let social = SocialInformation::new(params(2), TIME_START_MS).unwrap();
        assert_eq!(social.next_boundary_wait(TIME_START_MS + 1_000), Duration::from_millis(59_000));
        assert_eq!(social.next_boundary_wait(TIME_START_MS + 59_900), MIN_SLICE_WAIT);
        assert_eq!(social.next_boundary_wait(TIME_START_MS), Duration::from_millis(60_000));
    }
}
