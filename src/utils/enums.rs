use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{Float, HzzError};

/// Charged-lepton flavors recorded in the `lep_typeid` column (absolute PDG codes).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LeptonFlavor {
    /// An electron or positron (PDG id 11).
    Electron,
    /// A muon or antimuon (PDG id 13).
    Muon,
}

impl LeptonFlavor {
    /// The absolute PDG id of the flavor.
    pub fn type_id(&self) -> i32 {
        match self {
            LeptonFlavor::Electron => 11,
            LeptonFlavor::Muon => 13,
        }
    }

    /// Look up a flavor from a (possibly signed) PDG id.
    pub fn from_type_id(type_id: i32) -> Option<Self> {
        match type_id.abs() {
            11 => Some(LeptonFlavor::Electron),
            13 => Some(LeptonFlavor::Muon),
            _ => None,
        }
    }
}

impl Display for LeptonFlavor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeptonFlavor::Electron => write!(f, "e"),
            LeptonFlavor::Muon => write!(f, "mu"),
        }
    }
}

/// The flavor composition of a four-lepton final state.
///
/// The composition is identified by the sum of the lepton type ids: `4 x 11 = 44`,
/// `2 x 11 + 2 x 13 = 48` and `4 x 13 = 52`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FinalState {
    /// Four electrons.
    FourElectron,
    /// Two electrons and two muons.
    TwoElectronTwoMuon,
    /// Four muons.
    FourMuon,
}

impl FinalState {
    /// All final states, in order of increasing type-id sum.
    pub const ALL: [FinalState; 3] = [
        FinalState::FourElectron,
        FinalState::TwoElectronTwoMuon,
        FinalState::FourMuon,
    ];

    /// The sum of the lepton type ids which identifies this final state.
    pub fn type_id_sum(&self) -> i32 {
        match self {
            FinalState::FourElectron => 44,
            FinalState::TwoElectronTwoMuon => 48,
            FinalState::FourMuon => 52,
        }
    }

    /// Identify the final state from the sum of the lepton type ids.
    pub fn from_type_id_sum(sum: i32) -> Option<Self> {
        match sum {
            44 => Some(FinalState::FourElectron),
            48 => Some(FinalState::TwoElectronTwoMuon),
            52 => Some(FinalState::FourMuon),
            _ => None,
        }
    }
}

impl Display for FinalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FinalState::FourElectron => write!(f, "4e"),
            FinalState::TwoElectronTwoMuon => write!(f, "2e2mu"),
            FinalState::FourMuon => write!(f, "4mu"),
        }
    }
}

/// The histogram variations filled for every simulated sample.
///
/// Collision data only ever fills [`Variation::Nominal`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Variation {
    /// Nominal weights and masses.
    Nominal,
    /// Event weights scaled up by 10% to model the lepton scale-factor uncertainty.
    ScaleFactorUp,
    /// Event weights scaled down by 10% to model the lepton scale-factor uncertainty.
    ScaleFactorDown,
    /// The four-lepton mass shifted up by 1%.
    M4lUp,
    /// The four-lepton mass shifted down by 1%.
    M4lDown,
}

impl Variation {
    /// Every variation, in fill order.
    pub const ALL: [Variation; 5] = [
        Variation::Nominal,
        Variation::ScaleFactorUp,
        Variation::ScaleFactorDown,
        Variation::M4lUp,
        Variation::M4lDown,
    ];

    /// The canonical name of the variation, used as a histogram key.
    pub fn name(&self) -> &'static str {
        match self {
            Variation::Nominal => "nominal",
            Variation::ScaleFactorUp => "scaleFactorUP",
            Variation::ScaleFactorDown => "scaleFactorDOWN",
            Variation::M4lUp => "m4lUP",
            Variation::M4lDown => "m4lDOWN",
        }
    }

    /// The multiplicative factor applied to the nominal event weight.
    pub fn weight_factor(&self) -> Float {
        match self {
            Variation::ScaleFactorUp => 1.1,
            Variation::ScaleFactorDown => 0.9,
            _ => 1.0,
        }
    }

    /// The multiplicative factor applied to the four-lepton mass.
    pub fn mass_factor(&self) -> Float {
        match self {
            Variation::M4lUp => 1.01,
            Variation::M4lDown => 0.99,
            _ => 1.0,
        }
    }
}

impl Display for Variation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Variation {
    type Err = HzzError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "nominal" | "nom" => Ok(Self::Nominal),
            "scalefactorup" | "scalefactor_up" | "sf_up" => Ok(Self::ScaleFactorUp),
            "scalefactordown" | "scalefactor_down" | "sf_down" => Ok(Self::ScaleFactorDown),
            "m4lup" | "m4l_up" => Ok(Self::M4lUp),
            "m4ldown" | "m4l_down" => Ok(Self::M4lDown),
            _ => Err(HzzError::ParseError {
                name: s.to_string(),
                object: "Variation".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_displays() {
        assert_eq!(format!("{}", LeptonFlavor::Electron), "e");
        assert_eq!(format!("{}", LeptonFlavor::Muon), "mu");
        assert_eq!(format!("{}", FinalState::TwoElectronTwoMuon), "2e2mu");
        assert_eq!(format!("{}", Variation::Nominal), "nominal");
        assert_eq!(format!("{}", Variation::ScaleFactorUp), "scaleFactorUP");
        assert_eq!(format!("{}", Variation::M4lDown), "m4lDOWN");
    }

    #[test]
    fn variation_names_parse_back() {
        for variation in Variation::ALL {
            assert_eq!(variation.name().parse::<Variation>().unwrap(), variation);
        }
        assert!("sideways".parse::<Variation>().is_err());
    }

    #[test]
    fn flavor_and_final_state_ids() {
        assert_eq!(LeptonFlavor::from_type_id(-13), Some(LeptonFlavor::Muon));
        assert_eq!(LeptonFlavor::from_type_id(15), None);
        for state in FinalState::ALL {
            assert_eq!(FinalState::from_type_id_sum(state.type_id_sum()), Some(state));
        }
        assert_eq!(FinalState::from_type_id_sum(46), None);
    }
}
