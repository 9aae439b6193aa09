//! The analysis configuration.
//!
//! The layout follows cabinetry's YAML configuration (PascalCase keys with `General`, `Regions`,
//! `Samples`, `NormFactors` and `Systematics` blocks). Samples additionally carry the fileset
//! which is delivered and processed into histograms:
//!
//! ```yaml
//! General:
//!   Measurement: HZZ
//!   POI: Signal_norm
//!   HistogramPath: histograms.bin
//!   Luminosity: 10.0
//!   Binning: { Bins: 34, Low: 80.0, High: 250.0 }
//! Regions:
//!   - Name: Signal_region
//! Samples:
//!   - Name: Data
//!     Data: true
//!     Files:
//!       - Path: data/data_A.4lep.parquet
//!   - Name: Signal
//!     Files:
//!       - Path: data/mc_345060.ggH125_ZZ4lep.4lep.parquet
//!         CrossSection: 0.0060239
//!         SumOfWeights: 27881776.6536
//! NormFactors:
//!   - Name: Signal_norm
//!     Samples: Signal
//!     Nominal: 1.0
//!     Bounds: [0.0, 10.0]
//! Systematics:
//!   - Name: ParticleID
//!     Type: NormPlusShape
//!     Up: { Variation: scaleFactorUP }
//!     Down: { Variation: scaleFactorDOWN }
//! ```

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    data::io::DatasetIoOptions,
    delivery::{FileMetadata, Query},
    histograms::Binning,
    Float, HzzError, HzzResult, Variation,
};

/// Top-level analysis configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AnalysisConfig {
    /// General measurement settings.
    pub general: GeneralConfig,
    /// Phase-space regions (channels of the workspace).
    pub regions: Vec<RegionConfig>,
    /// Data and simulated samples together with their input files.
    pub samples: Vec<SampleConfig>,
    /// Free-floating normalization factors.
    #[serde(default)]
    pub norm_factors: Vec<NormFactorConfig>,
    /// Systematic uncertainties.
    #[serde(default)]
    pub systematics: Vec<SystematicConfig>,
    /// Directory against which relative paths are resolved (the directory of the
    /// configuration file when read with [`AnalysisConfig::from_file`]).
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

/// General measurement settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GeneralConfig {
    /// Name of the measurement.
    pub measurement: String,
    /// Parameter of interest. Defaults to the first normalization factor.
    #[serde(default, alias = "Poi")]
    #[serde(rename = "POI")]
    pub poi: Option<String>,
    /// Where the filled histograms are stored.
    pub histogram_path: String,
    /// Where the workspace is written, if at all.
    #[serde(default)]
    pub workspace_path: Option<String>,
    /// Integrated luminosity in inverse femtobarns.
    pub luminosity: Float,
    /// Binning of the four-lepton mass histograms (GeV).
    pub binning: Binning,
    /// Number of leptons required by the delivery query.
    #[serde(default = "default_n_leptons")]
    pub n_leptons: usize,
    /// Factor converting stored momenta to GeV.
    #[serde(default = "default_momentum_scale")]
    pub momentum_scale: Float,
    /// Parameters held constant in fits.
    #[serde(default)]
    pub fixed: Vec<FixedParameterConfig>,
}

fn default_n_leptons() -> usize {
    4
}

fn default_momentum_scale() -> Float {
    1e-3
}

/// A parameter held constant in fits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FixedParameterConfig {
    /// Parameter name.
    pub name: String,
    /// Value the parameter is fixed to.
    pub value: Float,
}

/// A phase-space region.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RegionConfig {
    /// Region name, used as the workspace channel name.
    pub name: String,
}

/// A data or simulated sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SampleConfig {
    /// Sample name.
    pub name: String,
    /// Whether the sample is collision data.
    #[serde(default)]
    pub data: bool,
    /// Disable the per-bin statistical uncertainty of this sample.
    #[serde(default)]
    pub disable_staterror: bool,
    /// Input files.
    pub files: Vec<FileConfig>,
}

/// One input file and its normalization metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FileConfig {
    /// Path to a Parquet file.
    pub path: String,
    /// Production cross section in picobarns (simulation only).
    #[serde(default)]
    pub cross_section: Option<Float>,
    /// Sum of generator weights before any selection (simulation only).
    #[serde(default)]
    pub sum_of_weights: Option<Float>,
    /// Generator filter efficiency.
    #[serde(default = "default_filter_efficiency")]
    pub filter_efficiency: Float,
}

fn default_filter_efficiency() -> Float {
    1.0
}

/// A free-floating normalization factor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NormFactorConfig {
    /// Parameter name.
    pub name: String,
    /// Samples the factor applies to (all simulated samples when omitted).
    #[serde(default)]
    pub samples: Option<StringOrArray>,
    /// Initial value.
    #[serde(default)]
    pub nominal: Option<Float>,
    /// Lower and upper bound.
    #[serde(default)]
    pub bounds: Option<[Float; 2]>,
}

/// The kind of a systematic uncertainty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystematicType {
    /// A pure normalization uncertainty.
    Normalization,
    /// A shape and normalization uncertainty built from varied histograms.
    NormPlusShape,
}

/// A systematic uncertainty.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SystematicConfig {
    /// Name of the systematic (and of its nuisance parameter).
    pub name: String,
    /// The kind of systematic.
    #[serde(rename = "Type")]
    pub syst_type: SystematicType,
    /// The upward template.
    pub up: TemplateConfig,
    /// The downward template.
    #[serde(default)]
    pub down: TemplateConfig,
    /// Samples the systematic applies to (all simulated samples when omitted).
    #[serde(default)]
    pub samples: Option<StringOrArray>,
}

/// One side of a systematic variation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TemplateConfig {
    /// The histogram variation holding the template (`NormPlusShape`).
    #[serde(default)]
    pub variation: Option<String>,
    /// The relative normalization shift (`Normalization`).
    #[serde(default)]
    pub normalization: Option<Float>,
    /// Mirror the opposite template around the nominal instead.
    #[serde(default)]
    pub symmetrize: bool,
}

/// A field that can be a single string or an array of strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StringOrArray {
    /// A single name.
    Single(String),
    /// A list of names.
    Array(Vec<String>),
}

impl StringOrArray {
    /// Convert to a list of strings.
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            StringOrArray::Single(s) => vec![s.clone()],
            StringOrArray::Array(v) => v.clone(),
        }
    }

    /// Check if a name matches this filter.
    pub fn contains(&self, name: &str) -> bool {
        match self {
            StringOrArray::Single(s) => s == name,
            StringOrArray::Array(v) => v.iter().any(|s| s == name),
        }
    }
}

/// Whether an optional sample filter admits `name`.
pub(crate) fn admits(filter: &Option<StringOrArray>, name: &str) -> bool {
    filter.as_ref().map_or(true, |f| f.contains(name))
}

impl AnalysisConfig {
    /// Parse and validate a configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> HzzResult<Self> {
        let config: AnalysisConfig = serde_yaml_ng::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a configuration file. Relative paths inside the configuration
    /// are resolved against the directory containing the file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> HzzResult<Self> {
        let path = path.as_ref();
        let expanded = PathBuf::from(&*shellexpand::full(&path.to_string_lossy())?);
        let yaml = std::fs::read_to_string(&expanded)?;
        let mut config = Self::from_yaml(&yaml)?;
        config.base_dir = expanded.parent().map(Path::to_path_buf);
        debug!(path = %expanded.display(), samples = config.samples.len(), "loaded configuration");
        Ok(config)
    }

    /// Check the internal consistency of the configuration.
    pub fn validate(&self) -> HzzResult<()> {
        let binning = &self.general.binning;
        if binning.bins == 0 || !(binning.low < binning.high) {
            return Err(HzzError::InvalidConfig(format!(
                "binning needs at least one bin and Low < High, got {} bins over [{}, {})",
                binning.bins, binning.low, binning.high
            )));
        }
        if !(self.general.luminosity > 0.0) {
            return Err(HzzError::InvalidConfig(
                "luminosity must be positive".to_string(),
            ));
        }
        if self.regions.len() != 1 {
            return Err(HzzError::InvalidConfig(format!(
                "exactly one region over the four-lepton mass is supported, found {}",
                self.regions.len()
            )));
        }
        let mut names = HashSet::new();
        for sample in &self.samples {
            if !names.insert(sample.name.as_str()) {
                return Err(HzzError::InvalidConfig(format!(
                    "sample \"{}\" is defined more than once",
                    sample.name
                )));
            }
            if sample.files.is_empty() {
                return Err(HzzError::InvalidConfig(format!(
                    "sample \"{}\" has no Files",
                    sample.name
                )));
            }
            if !sample.data {
                for file in &sample.files {
                    match (file.cross_section, file.sum_of_weights) {
                        (Some(_), Some(sumw)) if sumw > 0.0 && file.filter_efficiency > 0.0 => {}
                        _ => {
                            return Err(HzzError::InvalidConfig(format!(
                                "file \"{}\" of simulated sample \"{}\" needs a CrossSection, a positive SumOfWeights and a positive FilterEfficiency",
                                file.path, sample.name
                            )))
                        }
                    }
                }
            }
        }
        if self.samples.iter().filter(|s| s.data).count() > 1 {
            return Err(HzzError::InvalidConfig(
                "at most one data sample is supported".to_string(),
            ));
        }
        if self.samples.iter().all(|s| s.data) {
            return Err(HzzError::InvalidConfig(
                "at least one simulated sample is required".to_string(),
            ));
        }
        let check_filter = |owner: &str, filter: &Option<StringOrArray>| -> HzzResult<()> {
            if let Some(filter) = filter {
                for name in filter.to_vec() {
                    if !names.contains(name.as_str()) {
                        return Err(HzzError::InvalidConfig(format!(
                            "\"{owner}\" refers to unknown sample \"{name}\""
                        )));
                    }
                }
            }
            Ok(())
        };
        for norm_factor in &self.norm_factors {
            check_filter(&norm_factor.name, &norm_factor.samples)?;
            if let Some([low, high]) = norm_factor.bounds {
                if !(low < high) {
                    return Err(HzzError::InvalidConfig(format!(
                        "norm factor \"{}\" has empty bounds [{low}, {high}]",
                        norm_factor.name
                    )));
                }
            }
        }
        for systematic in &self.systematics {
            check_filter(&systematic.name, &systematic.samples)?;
            match systematic.syst_type {
                SystematicType::NormPlusShape => {
                    let up = systematic.up.variation.as_deref().ok_or_else(|| {
                        HzzError::InvalidConfig(format!(
                            "systematic \"{}\" needs an Up variation",
                            systematic.name
                        ))
                    })?;
                    up.parse::<Variation>()?;
                    match systematic.down.variation.as_deref() {
                        Some(down) => {
                            down.parse::<Variation>()?;
                        }
                        None if systematic.down.symmetrize => {}
                        None => {
                            return Err(HzzError::InvalidConfig(format!(
                                "systematic \"{}\" needs a Down variation or Symmetrize",
                                systematic.name
                            )))
                        }
                    }
                }
                SystematicType::Normalization => {
                    if systematic.up.normalization.is_none() {
                        return Err(HzzError::InvalidConfig(format!(
                            "systematic \"{}\" needs an Up normalization",
                            systematic.name
                        )));
                    }
                    if systematic.down.normalization.is_none() && !systematic.down.symmetrize {
                        return Err(HzzError::InvalidConfig(format!(
                            "systematic \"{}\" needs a Down normalization or Symmetrize",
                            systematic.name
                        )));
                    }
                }
            }
        }
        let poi = self.poi();
        if !self.norm_factors.iter().any(|nf| Some(&nf.name) == poi.as_ref()) {
            return Err(HzzError::InvalidConfig(format!(
                "the parameter of interest {:?} is not one of the norm factors",
                poi
            )));
        }
        Ok(())
    }

    /// The parameter of interest: the configured one, or else the first normalization factor.
    pub fn poi(&self) -> Option<String> {
        self.general
            .poi
            .clone()
            .or_else(|| self.norm_factors.first().map(|nf| nf.name.clone()))
    }

    /// The single region of the analysis.
    pub fn region(&self) -> &RegionConfig {
        &self.regions[0]
    }

    /// The data sample, if any.
    pub fn data_sample(&self) -> Option<&SampleConfig> {
        self.samples.iter().find(|s| s.data)
    }

    /// Simulated samples, in configuration order.
    pub fn simulated_samples(&self) -> impl Iterator<Item = &SampleConfig> {
        self.samples.iter().filter(|s| !s.data)
    }

    /// Resolve a configured path: expand `~` and environment variables and interpret relative
    /// paths against [`AnalysisConfig::base_dir`].
    pub fn resolve_path(&self, path: &str) -> HzzResult<String> {
        let expanded = PathBuf::from(&*shellexpand::full(path)?);
        let resolved = match (&self.base_dir, expanded.is_relative()) {
            (Some(base), true) => base.join(expanded),
            _ => expanded,
        };
        Ok(resolved.to_string_lossy().into_owned())
    }

    /// The flattened fileset: one entry per input file, in configuration order.
    pub fn fileset(&self) -> HzzResult<Vec<FileMetadata>> {
        let mut files = Vec::new();
        for sample in &self.samples {
            for file in &sample.files {
                files.push(FileMetadata {
                    sample: sample.name.clone(),
                    path: self.resolve_path(&file.path)?,
                    is_data: sample.data,
                    cross_section: file.cross_section.unwrap_or(0.0),
                    sum_of_weights: file.sum_of_weights.unwrap_or(0.0),
                    filter_efficiency: file.filter_efficiency,
                });
            }
        }
        Ok(files)
    }

    /// The delivery query described by the configuration.
    pub fn query(&self) -> Query {
        Query::new(self.general.n_leptons)
    }

    /// Column interpretation options for reading the fileset.
    pub fn io_options(&self) -> DatasetIoOptions {
        DatasetIoOptions::default().with_momentum_scale(self.general.momentum_scale)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const EXAMPLE: &str = r#"
General:
  Measurement: HZZ
  POI: Signal_norm
  HistogramPath: histograms.bin
  Luminosity: 10.0
  Binning: { Bins: 34, Low: 80.0, High: 250.0 }
Regions:
  - Name: Signal_region
Samples:
  - Name: Data
    Data: true
    Files:
      - Path: data_A.parquet
      - Path: data_B.parquet
  - Name: Signal
    Files:
      - Path: ggH.parquet
        CrossSection: 0.0060239
        SumOfWeights: 27881776.6536
  - Name: Background ZZ
    Files:
      - Path: zz.parquet
        CrossSection: 1.2578
        SumOfWeights: 7538705.8077
        FilterEfficiency: 1.0
NormFactors:
  - Name: Signal_norm
    Samples: Signal
    Nominal: 1.0
    Bounds: [0.0, 10.0]
Systematics:
  - Name: ParticleID
    Type: NormPlusShape
    Up: { Variation: scaleFactorUP }
    Down: { Variation: scaleFactorDOWN }
  - Name: m4l_scale
    Type: NormPlusShape
    Samples: [Signal]
    Up: { Variation: m4lUP }
    Down: { Variation: m4lDOWN }
  - Name: Luminosity
    Type: Normalization
    Up: { Normalization: 0.017 }
    Down: { Symmetrize: true }
"#;

    #[test]
    fn test_parse_example() {
        let config = AnalysisConfig::from_yaml(EXAMPLE).unwrap();
        assert_eq!(config.general.measurement, "HZZ");
        assert_eq!(config.general.n_leptons, 4);
        assert_eq!(config.general.binning.bins, 34);
        assert_eq!(config.poi().as_deref(), Some("Signal_norm"));
        assert_eq!(config.data_sample().unwrap().name, "Data");
        assert_eq!(config.simulated_samples().count(), 2);
        assert_eq!(config.systematics[2].syst_type, SystematicType::Normalization);
        assert!(config.systematics[2].down.symmetrize);
        let fileset = config.fileset().unwrap();
        assert_eq!(fileset.len(), 4);
        assert!(fileset[0].is_data);
        assert_eq!(fileset[2].sample, "Signal");
        assert_eq!(fileset[3].filter_efficiency, 1.0);
    }

    #[test]
    fn test_relative_paths_resolve_against_base_dir() {
        let mut config = AnalysisConfig::from_yaml(EXAMPLE).unwrap();
        config.base_dir = Some(PathBuf::from("/analysis"));
        assert_eq!(
            config.resolve_path("ggH.parquet").unwrap(),
            "/analysis/ggH.parquet"
        );
        assert_eq!(config.resolve_path("/abs/x.parquet").unwrap(), "/abs/x.parquet");
    }

    #[test]
    fn test_validation_failures() {
        let missing_xsec = EXAMPLE.replace("        CrossSection: 0.0060239\n", "");
        assert!(matches!(
            AnalysisConfig::from_yaml(&missing_xsec),
            Err(HzzError::InvalidConfig(_))
        ));
        let bad_poi = EXAMPLE.replace("POI: Signal_norm", "POI: mu");
        assert!(matches!(
            AnalysisConfig::from_yaml(&bad_poi),
            Err(HzzError::InvalidConfig(_))
        ));
        let bad_variation = EXAMPLE.replace("Variation: m4lUP", "Variation: sideways");
        assert!(matches!(
            AnalysisConfig::from_yaml(&bad_variation),
            Err(HzzError::ParseError { .. })
        ));
        let unknown_sample = EXAMPLE.replace("Samples: [Signal]", "Samples: [Higgs]");
        assert!(matches!(
            AnalysisConfig::from_yaml(&unknown_sample),
            Err(HzzError::InvalidConfig(_))
        ));
        let no_files = EXAMPLE.replace(
            "    Files:\n      - Path: data_A.parquet\n      - Path: data_B.parquet\n",
            "    Files: []\n",
        );
        assert_ne!(no_files, EXAMPLE);
        assert!(matches!(
            AnalysisConfig::from_yaml(&no_files),
            Err(HzzError::InvalidConfig(message)) if message.contains("Data")
        ));
        let empty_binning = EXAMPLE.replace("Low: 80.0", "Low: 300.0");
        assert!(matches!(
            AnalysisConfig::from_yaml(&empty_binning),
            Err(HzzError::InvalidConfig(_))
        ));
    }
}
