use std::fmt::Display;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{data::Event, utils::enums::FinalState, Float};

/// The four-lepton selection: exactly four leptons, zero total charge, and a flavor
/// composition of `eeee`, `eeμμ` or `μμμμ` (type-id sum of 44, 48 or 52).
pub fn lepton_filter(event: &Event) -> bool {
    event.n_leptons() == 4
        && event.total_charge() == 0
        && FinalState::from_type_id_sum(event.type_id_sum()).is_some()
}

/// The invariant mass of the four-vector sum of all leptons in the event (GeV).
pub fn four_lepton_mass(event: &Event) -> Float {
    event.p4_sum().m()
}

/// Stages of the selection tracked by a [`Cutflow`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CutStage {
    /// Events delivered by the query.
    Delivered,
    /// Events passing [`lepton_filter`].
    LeptonFilter,
    /// Passing events whose nominal four-lepton mass falls inside the histogram range.
    InRange,
}

impl CutStage {
    /// Every stage, in the order they are applied.
    pub const ALL: [CutStage; 3] = [CutStage::Delivered, CutStage::LeptonFilter, CutStage::InRange];
}

impl Display for CutStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CutStage::Delivered => write!(f, "delivered"),
            CutStage::LeptonFilter => write!(f, "lepton filter"),
            CutStage::InRange => write!(f, "m4l in range"),
        }
    }
}

/// Raw and weighted counts at one selection stage.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CutCount {
    /// Number of events.
    pub events: usize,
    /// Sum of nominal event weights.
    pub sumw: Float,
}

impl CutCount {
    fn record(&mut self, weight: Float) {
        self.events += 1;
        self.sumw += weight;
    }
}

/// Per-sample counts at each selection stage.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SampleCutflow {
    /// Counts after delivery.
    pub delivered: CutCount,
    /// Counts after the lepton filter.
    pub lepton_filter: CutCount,
    /// Counts of selected events inside the histogram range.
    pub in_range: CutCount,
}

impl SampleCutflow {
    /// Record one event at `stage` with its nominal weight.
    pub fn record(&mut self, stage: CutStage, weight: Float) {
        self.count_mut(stage).record(weight);
    }

    /// The counts at `stage`.
    pub fn count(&self, stage: CutStage) -> &CutCount {
        match stage {
            CutStage::Delivered => &self.delivered,
            CutStage::LeptonFilter => &self.lepton_filter,
            CutStage::InRange => &self.in_range,
        }
    }

    fn count_mut(&mut self, stage: CutStage) -> &mut CutCount {
        match stage {
            CutStage::Delivered => &mut self.delivered,
            CutStage::LeptonFilter => &mut self.lepton_filter,
            CutStage::InRange => &mut self.in_range,
        }
    }

    fn merge(&mut self, other: &SampleCutflow) {
        for stage in CutStage::ALL {
            let other = other.count(stage);
            let count = self.count_mut(stage);
            count.events += other.events;
            count.sumw += other.sumw;
        }
    }
}

/// Selection counts keyed by sample, in the order samples were first seen.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Cutflow {
    samples: IndexMap<String, SampleCutflow>,
}

impl Cutflow {
    /// Create an empty [`Cutflow`].
    pub fn new() -> Self {
        Self::default()
    }

    /// The counts of one sample, created empty if needed.
    pub fn sample_mut(&mut self, sample: &str) -> &mut SampleCutflow {
        self.samples.entry(sample.to_string()).or_default()
    }

    /// The counts of one sample.
    pub fn get(&self, sample: &str) -> Option<&SampleCutflow> {
        self.samples.get(sample)
    }

    /// Iterate over `(sample, counts)` pairs.
    pub fn iter(&self) -> indexmap::map::Iter<'_, String, SampleCutflow> {
        self.samples.iter()
    }

    /// Add the counts of `other` into `self`.
    pub fn merge(&mut self, other: &Cutflow) {
        for (sample, counts) in &other.samples {
            self.sample_mut(sample).merge(counts);
        }
    }
}

impl Display for Cutflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "{:<24} {:>14} {:>14} {:>14}",
            "sample",
            CutStage::Delivered.to_string(),
            CutStage::LeptonFilter.to_string(),
            CutStage::InRange.to_string()
        )?;
        for (sample, counts) in &self.samples {
            write!(f, "{:<24}", sample)?;
            for stage in CutStage::ALL {
                write!(f, " {:>14}", counts.count(stage).events)?;
            }
            writeln!(f)?;
            write!(f, "{:<24}", "  (weighted)")?;
            for stage in CutStage::ALL {
                write!(f, " {:>14.4}", counts.count(stage).sumw)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{test_event, Lepton};
    use approx::assert_relative_eq;

    #[test]
    fn test_lepton_filter() {
        let event = test_event();
        assert!(lepton_filter(&event));

        let mut three = event.clone();
        three.leptons.pop();
        assert!(!lepton_filter(&three));

        let mut charged = event.clone();
        charged.leptons[0].charge = 1;
        assert!(!lepton_filter(&charged));

        let mut four_muon = event.clone();
        four_muon.leptons[0].type_id = 13;
        four_muon.leptons[1].type_id = 13;
        assert!(lepton_filter(&four_muon));

        // e e mu tau
        let mut odd_flavor = event;
        odd_flavor.leptons[3].type_id = 15;
        assert!(!lepton_filter(&odd_flavor));
    }

    #[test]
    fn test_four_lepton_mass_at_rest() {
        let p = 30.0;
        let event = Event::new(vec![
            Lepton::new(p, 0.0, 0.0, p, 1, 13),
            Lepton::new(p, 0.0, std::f64::consts::PI, p, -1, 13),
            Lepton::new(p, 0.0, std::f64::consts::FRAC_PI_2, p, 1, 11),
            Lepton::new(p, 0.0, -std::f64::consts::FRAC_PI_2, p, -1, 11),
        ]);
        assert_relative_eq!(four_lepton_mass(&event), 4.0 * p, epsilon = 1e-9);
        assert_relative_eq!(four_lepton_mass(&test_event()), 140.98685300137558, epsilon = 1e-6);
    }

    #[test]
    fn test_cutflow_merge() {
        let mut a = Cutflow::new();
        a.sample_mut("Signal").record(CutStage::Delivered, 0.5);
        a.sample_mut("Signal").record(CutStage::LeptonFilter, 0.5);
        let mut b = Cutflow::new();
        b.sample_mut("Data").record(CutStage::Delivered, 1.0);
        b.sample_mut("Signal").record(CutStage::Delivered, 0.25);
        a.merge(&b);
        let signal = a.get("Signal").unwrap();
        assert_eq!(signal.delivered.events, 2);
        assert_relative_eq!(signal.delivered.sumw, 0.75);
        assert_eq!(signal.lepton_filter.events, 1);
        assert_eq!(a.get("Data").unwrap().delivered.events, 1);
        assert_eq!(a.iter().map(|(s, _)| s.as_str()).collect::<Vec<_>>(), ["Signal", "Data"]);
        assert!(format!("{a}").contains("lepton filter"));
    }
}
