#[cfg(feature = "rayon")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt::Display;

use crate::{
    utils::{enums::FinalState, vectors::Vec4},
    Float,
};

/// Parquet reading and writing for [`Dataset`]s.
pub mod io;

/// A single reconstructed charged lepton.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Lepton {
    /// The four-momentum of the lepton (GeV).
    pub p4: Vec4,
    /// The electric charge in units of the elementary charge.
    pub charge: i32,
    /// The absolute PDG id of the lepton (11 for electrons, 13 for muons).
    pub type_id: i32,
}

impl Lepton {
    /// Construct a lepton from detector coordinates `(pt, eta, phi, E)` in GeV.
    pub fn new(pt: Float, eta: Float, phi: Float, e: Float, charge: i32, type_id: i32) -> Self {
        Self {
            p4: Vec4::from_pt_eta_phi_e(pt, eta, phi, e),
            charge,
            type_id,
        }
    }
}

/// A collision event as delivered to the analysis: the lepton collection plus the per-event
/// weight inputs of simulated samples.
///
/// For collision data the weight columns are absent and every factor is `1`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// The reconstructed leptons.
    pub leptons: Vec<Lepton>,
    /// The generator weight.
    pub mc_weight: Float,
    /// The pile-up reweighting factor.
    pub scale_factor_pileup: Float,
    /// The electron efficiency scale factor.
    pub scale_factor_ele: Float,
    /// The muon efficiency scale factor.
    pub scale_factor_muon: Float,
    /// The lepton trigger scale factor.
    pub scale_factor_lep_trigger: Float,
}

impl Default for Event {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Event:")?;
        writeln!(f, "  leptons:")?;
        for lepton in &self.leptons {
            writeln!(
                f,
                "    {} (q = {:+}, id = {})",
                lepton.p4, lepton.charge, lepton.type_id
            )?;
        }
        writeln!(f, "  mcWeight: {}", self.mc_weight)?;
        writeln!(
            f,
            "  scale factors: pileup = {}, ele = {}, muon = {}, trigger = {}",
            self.scale_factor_pileup,
            self.scale_factor_ele,
            self.scale_factor_muon,
            self.scale_factor_lep_trigger
        )?;
        Ok(())
    }
}

impl Event {
    /// Create an event with unit weights.
    pub fn new(leptons: Vec<Lepton>) -> Self {
        Self {
            leptons,
            mc_weight: 1.0,
            scale_factor_pileup: 1.0,
            scale_factor_ele: 1.0,
            scale_factor_muon: 1.0,
            scale_factor_lep_trigger: 1.0,
        }
    }
    /// The number of reconstructed leptons.
    pub fn n_leptons(&self) -> usize {
        self.leptons.len()
    }
    /// The sum of the lepton charges.
    pub fn total_charge(&self) -> i32 {
        self.leptons.iter().map(|l| l.charge).sum()
    }
    /// The sum of the lepton type ids.
    pub fn type_id_sum(&self) -> i32 {
        self.leptons.iter().map(|l| l.type_id).sum()
    }
    /// The flavor composition of the event, if it is one of the four-lepton final states.
    pub fn final_state(&self) -> Option<FinalState> {
        if self.n_leptons() != 4 {
            return None;
        }
        FinalState::from_type_id_sum(self.type_id_sum())
    }
    /// The four-momentum sum of all leptons in the event.
    pub fn p4_sum(&self) -> Vec4 {
        self.leptons.iter().map(|l| l.p4).sum()
    }
}

/// An event that can be used to test selections and fills. This particular event contains a
/// $`2e2\mu`$ final state of massless leptons with a four-lepton mass of about 141 GeV and
/// simulated weights.
pub fn test_event() -> Event {
    Event {
        leptons: vec![
            Lepton::new(40.0, 0.2, 0.3, 40.0 * 0.2f64.cosh(), -1, 11),
            Lepton::new(35.0, -0.4, 2.8, 35.0 * 0.4f64.cosh(), 1, 11),
            Lepton::new(25.0, 1.1, -1.4, 25.0 * 1.1f64.cosh(), -1, 13),
            Lepton::new(15.0, -0.9, -2.5, 15.0 * 0.9f64.cosh(), 1, 13),
        ],
        mc_weight: 0.8,
        scale_factor_pileup: 1.1,
        scale_factor_ele: 0.95,
        scale_factor_muon: 0.98,
        scale_factor_lep_trigger: 1.0,
    }
}

/// A dataset containing a single event generated from [`test_event`].
pub fn test_dataset() -> Dataset {
    Dataset::new(vec![test_event()])
}

/// A collection of [`Event`]s delivered from one or more files.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    /// The events in the dataset.
    pub events: Vec<Event>,
}

impl Dataset {
    /// Create a [`Dataset`] from a list of [`Event`]s.
    pub fn new(events: Vec<Event>) -> Self {
        Self { events }
    }

    /// The number of [`Event`]s in the [`Dataset`].
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the [`Dataset`] holds no [`Event`]s.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Iterate over the [`Event`]s in the [`Dataset`].
    pub fn iter(&self) -> std::slice::Iter<'_, Event> {
        self.events.iter()
    }

    /// Iterate over the [`Event`]s in the [`Dataset`] in parallel.
    #[cfg(feature = "rayon")]
    pub fn par_iter(&self) -> rayon::slice::Iter<'_, Event> {
        self.events.par_iter()
    }

    /// Keep only the [`Event`]s for which `predicate` returns `true`.
    #[cfg(feature = "rayon")]
    pub fn filter<P>(&self, predicate: P) -> Dataset
    where
        P: Fn(&Event) -> bool + Sync + Send,
    {
        Dataset::new(
            self.events
                .par_iter()
                .filter(|event| predicate(event))
                .cloned()
                .collect(),
        )
    }

    /// Keep only the [`Event`]s for which `predicate` returns `true`.
    #[cfg(not(feature = "rayon"))]
    pub fn filter<P>(&self, predicate: P) -> Dataset
    where
        P: Fn(&Event) -> bool + Sync + Send,
    {
        Dataset::new(
            self.events
                .iter()
                .filter(|event| predicate(event))
                .cloned()
                .collect(),
        )
    }

    /// Append the events of another [`Dataset`].
    pub fn extend(&mut self, other: Dataset) {
        self.events.extend(other.events);
    }
}

impl FromIterator<Event> for Dataset {
    fn from_iter<T: IntoIterator<Item = Event>>(iter: T) -> Self {
        Dataset::new(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a Dataset {
    type Item = &'a Event;
    type IntoIter = std::slice::Iter<'a, Event>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_event_summaries() {
        let event = test_event();
        assert_eq!(event.n_leptons(), 4);
        assert_eq!(event.total_charge(), 0);
        assert_eq!(event.type_id_sum(), 48);
        assert_eq!(event.final_state(), Some(FinalState::TwoElectronTwoMuon));
        let sum = event.p4_sum();
        assert_relative_eq!(
            sum.e,
            event.leptons.iter().map(|l| l.p4.e).sum::<f64>(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_unit_weights_by_default() {
        let event = Event::new(vec![]);
        assert_eq!(event.mc_weight, 1.0);
        assert_eq!(event.scale_factor_lep_trigger, 1.0);
        assert_eq!(event.final_state(), None);
    }

    #[test]
    fn test_dataset_filter() {
        let mut dataset = test_dataset();
        dataset.extend(Dataset::new(vec![Event::new(vec![])]));
        assert_eq!(dataset.len(), 2);
        let filtered = dataset.filter(|e| e.n_leptons() == 4);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered.events[0], test_event());
    }
}
