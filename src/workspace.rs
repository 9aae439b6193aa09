//! HistFactory workspaces in the pyhf JSON layout, built from filled histograms.

use std::{
    fs::File,
    io::{BufReader, BufWriter},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    config::{admits, AnalysisConfig, SystematicConfig, SystematicType},
    histograms::{Histogram, HistogramSet},
    Float, HzzError, HzzResult, Variation,
};

/// The pyhf workspace schema version written by [`build_workspace`].
pub const WORKSPACE_VERSION: &str = "1.0.0";

/// A pyhf workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    /// Channels (regions).
    pub channels: Vec<Channel>,
    /// Observed counts, one entry per channel.
    pub observations: Vec<Observation>,
    /// Measurements.
    pub measurements: Vec<Measurement>,
    /// Schema version.
    #[serde(default)]
    pub version: Option<String>,
}

/// A channel and the samples contributing to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    /// Channel name.
    pub name: String,
    /// Samples in this channel.
    pub samples: Vec<Sample>,
}

/// A sample's nominal yields and modifiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Sample name.
    pub name: String,
    /// Nominal yield in each bin.
    pub data: Vec<Float>,
    /// Modifiers applied to the yields.
    pub modifiers: Vec<Modifier>,
}

/// A modifier of sample yields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Modifier {
    /// A free-floating normalization.
    #[serde(rename = "normfactor")]
    NormFactor {
        /// Parameter name.
        name: String,
        /// Unused payload, `null` in pyhf workspaces.
        #[serde(default)]
        data: Option<serde_json::Value>,
    },
    /// A constrained normalization uncertainty.
    #[serde(rename = "normsys")]
    NormSys {
        /// Parameter name.
        name: String,
        /// Normalization factors at ±1σ.
        data: NormSysData,
    },
    /// A constrained shape uncertainty.
    #[serde(rename = "histosys")]
    HistoSys {
        /// Parameter name.
        name: String,
        /// Templates at ±1σ.
        data: HistoSysData,
    },
    /// Per-bin statistical uncertainty of the simulation.
    #[serde(rename = "staterror")]
    StatError {
        /// Parameter name; the per-bin parameters are `name[i]`.
        name: String,
        /// Absolute uncertainty in each bin.
        data: Vec<Float>,
    },
}

impl Modifier {
    /// The parameter name of the modifier.
    pub fn name(&self) -> &str {
        match self {
            Modifier::NormFactor { name, .. }
            | Modifier::NormSys { name, .. }
            | Modifier::HistoSys { name, .. }
            | Modifier::StatError { name, .. } => name,
        }
    }
}

/// `normsys` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormSysData {
    /// Factor at +1σ.
    pub hi: Float,
    /// Factor at -1σ.
    pub lo: Float,
}

/// `histosys` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoSysData {
    /// Template at +1σ.
    pub hi_data: Vec<Float>,
    /// Template at -1σ.
    pub lo_data: Vec<Float>,
}

/// Observed counts of one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Channel name.
    pub name: String,
    /// Observed count in each bin.
    pub data: Vec<Float>,
}

/// A named measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// Measurement name.
    pub name: String,
    /// Parameter of interest and parameter settings.
    pub config: MeasurementConfig,
}

/// Settings of a [`Measurement`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementConfig {
    /// Parameter of interest.
    pub poi: String,
    /// Per-parameter overrides.
    #[serde(default)]
    pub parameters: Vec<ParameterConfig>,
}

/// Overrides for one parameter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterConfig {
    /// Parameter name.
    pub name: String,
    /// Initial values.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inits: Vec<Float>,
    /// Bounds, `[[low, high]]`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bounds: Vec<[Float; 2]>,
    /// Whether the parameter is held constant in fits.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fixed: bool,
}

impl Workspace {
    /// Look up a measurement by name, or the first one when `name` is `None`.
    pub fn measurement(&self, name: Option<&str>) -> HzzResult<&Measurement> {
        match name {
            Some(name) => self
                .measurements
                .iter()
                .find(|m| m.name == name)
                .ok_or_else(|| HzzError::Custom(format!("no measurement named \"{name}\""))),
            None => self
                .measurements
                .first()
                .ok_or_else(|| HzzError::Custom("workspace has no measurements".to_string())),
        }
    }

    /// Write the workspace as pretty-printed JSON.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> HzzResult<()> {
        let path = PathBuf::from(&*shellexpand::full(&path.as_ref().to_string_lossy())?);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        serde_json::to_writer_pretty(BufWriter::new(File::create(&path)?), self)?;
        info!(path = %path.display(), "saved workspace");
        Ok(())
    }

    /// Read a workspace from JSON.
    pub fn load<P: AsRef<Path>>(path: P) -> HzzResult<Self> {
        let path = PathBuf::from(&*shellexpand::full(&path.as_ref().to_string_lossy())?);
        Ok(serde_json::from_reader(BufReader::new(File::open(&path)?))?)
    }
}

/// Build the workspace of the single configured region.
///
/// Every simulated sample contributes its nominal histogram together with the norm factors and
/// systematics that apply to it and, unless disabled, a `staterror` modifier from the per-bin
/// $`\sqrt{\sum w^2}`$. `NormPlusShape` systematics become `histosys` modifiers built from the
/// variation histograms, and `Normalization` systematics become `normsys` modifiers. A
/// symmetrized down template is the up template mirrored around the nominal.
///
/// Observations come from the nominal histogram of the data sample. Without a data sample the
/// nominal prediction (Asimov data) is used instead.
pub fn build_workspace(config: &AnalysisConfig, histograms: &HistogramSet) -> HzzResult<Workspace> {
    let region = &config.region().name;
    let nominal_name = Variation::Nominal.name();
    let n_bins = config.general.binning.bins;
    let mut samples = Vec::new();
    for sample in config.simulated_samples() {
        let nominal = histograms.require(&sample.name, nominal_name)?;
        check_bins(nominal, &sample.name, nominal_name, n_bins)?;
        let mut modifiers = Vec::new();
        for norm_factor in &config.norm_factors {
            if admits(&norm_factor.samples, &sample.name) {
                modifiers.push(Modifier::NormFactor {
                    name: norm_factor.name.clone(),
                    data: None,
                });
            }
        }
        for systematic in &config.systematics {
            if admits(&systematic.samples, &sample.name) {
                modifiers.push(systematic_modifier(
                    systematic,
                    &sample.name,
                    &nominal.sumw,
                    histograms,
                )?);
            }
        }
        if !sample.disable_staterror {
            modifiers.push(Modifier::StatError {
                name: format!("staterror_{region}"),
                data: nominal.stdev(),
            });
        }
        samples.push(Sample {
            name: sample.name.clone(),
            data: nominal.sumw.clone(),
            modifiers,
        });
    }
    let observed = match config.data_sample() {
        Some(data) => {
            let observed = histograms.require(&data.name, nominal_name)?;
            check_bins(observed, &data.name, nominal_name, n_bins)?;
            observed.sumw.clone()
        }
        None => {
            warn!(region = %region, "no data sample configured, observing the nominal prediction");
            samples.iter().fold(vec![0.0; n_bins], |mut acc, s| {
                for (a, b) in acc.iter_mut().zip(&s.data) {
                    *a += b;
                }
                acc
            })
        }
    };
    let workspace = Workspace {
        channels: vec![Channel {
            name: region.clone(),
            samples,
        }],
        observations: vec![Observation {
            name: region.clone(),
            data: observed,
        }],
        measurements: vec![Measurement {
            name: config.general.measurement.clone(),
            config: MeasurementConfig {
                poi: config.poi().unwrap_or_default(),
                parameters: parameter_configs(config),
            },
        }],
        version: Some(WORKSPACE_VERSION.to_string()),
    };
    info!(
        region = %region,
        n_samples = workspace.channels[0].samples.len(),
        observed = workspace.observations[0].data.iter().sum::<Float>(),
        "built workspace"
    );
    Ok(workspace)
}

fn systematic_modifier(
    systematic: &SystematicConfig,
    sample: &str,
    nominal: &[Float],
    histograms: &HistogramSet,
) -> HzzResult<Modifier> {
    let name = systematic.name.clone();
    match systematic.syst_type {
        SystematicType::NormPlusShape => {
            let template = |variation: &Option<String>| -> HzzResult<Vec<Float>> {
                let variation = variation.as_deref().ok_or_else(|| {
                    HzzError::InvalidConfig(format!("systematic \"{name}\" is missing a variation"))
                })?;
                let variation: Variation = variation.parse()?;
                let histogram = histograms.require(sample, variation.name())?;
                check_bins(histogram, sample, variation.name(), nominal.len())?;
                Ok(histogram.sumw.clone())
            };
            let hi_data = template(&systematic.up.variation)?;
            let lo_data = if systematic.down.symmetrize || systematic.down.variation.is_none() {
                mirror(nominal, &hi_data)
            } else {
                template(&systematic.down.variation)?
            };
            Ok(Modifier::HistoSys {
                name,
                data: HistoSysData { hi_data, lo_data },
            })
        }
        SystematicType::Normalization => {
            let up = systematic.up.normalization.unwrap_or(0.0);
            let down = match systematic.down.normalization {
                Some(down) if !systematic.down.symmetrize => down,
                _ => -up,
            };
            Ok(Modifier::NormSys {
                name,
                data: NormSysData {
                    hi: 1.0 + up,
                    lo: 1.0 + down,
                },
            })
        }
    }
}

fn check_bins(histogram: &Histogram, sample: &str, variation: &str, n_bins: usize) -> HzzResult<()> {
    if histogram.sumw.len() != n_bins {
        return Err(HzzError::LengthMismatch {
            context: format!("histogram {sample}/{variation}"),
            expected: n_bins,
            actual: histogram.sumw.len(),
        });
    }
    Ok(())
}

/// The template mirrored around the nominal, `2 * nominal - template`.
fn mirror(nominal: &[Float], template: &[Float]) -> Vec<Float> {
    nominal
        .iter()
        .zip(template)
        .map(|(n, t)| 2.0 * n - t)
        .collect()
}

fn parameter_configs(config: &AnalysisConfig) -> Vec<ParameterConfig> {
    let mut parameters: Vec<ParameterConfig> = config
        .norm_factors
        .iter()
        .map(|nf| ParameterConfig {
            name: nf.name.clone(),
            inits: nf.nominal.into_iter().collect(),
            bounds: nf.bounds.into_iter().collect(),
            fixed: false,
        })
        .collect();
    for fixed in &config.general.fixed {
        match parameters.iter_mut().find(|p| p.name == fixed.name) {
            Some(existing) => {
                existing.inits = vec![fixed.value];
                existing.fixed = true;
            }
            None => parameters.push(ParameterConfig {
                name: fixed.name.clone(),
                inits: vec![fixed.value],
                bounds: Vec::new(),
                fixed: true,
            }),
        }
    }
    parameters
}
