//! # hzz4l
//!
//! An end-to-end four-lepton analysis: column-selected event delivery from Parquet files,
//! lepton selection and cross-section weighting, histograms of the four-lepton invariant mass
//! with systematic variations, a HistFactory-style workspace built from those histograms, and a
//! maximum-likelihood fit of the signal strength.
//!
//! A typical analysis is driven by an [`AnalysisConfig`](crate::config::AnalysisConfig):
//!
//! ```ignore
//! use hzz4l::{config::AnalysisConfig, pipeline};
//!
//! let config = AnalysisConfig::from_file("analysis.yml")?;
//! let (histograms, cutflow) = pipeline::histograms(&config)?;
//! let workspace = pipeline::workspace(&config, &histograms)?;
//! let results = pipeline::fit(&workspace, None)?;
//! println!("mu = {} +/- {}", results.poi().0, results.poi().1);
//! ```
#![warn(clippy::perf, clippy::style)]
#![allow(clippy::excessive_precision)]

use thiserror::Error;

/// Typed analysis configuration read from YAML.
pub mod config;
/// Methods for loading and manipulating lepton [`Event`](crate::data::Event)s.
pub mod data;
/// Local, column-selected delivery of events from a fileset.
pub mod delivery;
/// Maximum-likelihood fits, uncertainties and discovery significance.
pub mod fit;
/// Weighted histograms and keyed collections of them.
pub mod histograms;
/// Negative log-likelihoods, minimization, and fit results.
pub mod likelihoods;
/// The binned statistical model evaluated from a [`Workspace`](crate::workspace::Workspace).
pub mod model;
/// Stages which chain delivery, processing, workspace construction and fitting.
pub mod pipeline;
/// Histogram-filling processors.
pub mod processor;
/// Event selection and the four-lepton invariant mass.
pub mod selection;
/// Utility functions, enums, and vectors.
pub mod utils;
/// Cross-section and per-event weights.
pub mod weights;
/// pyhf-compatible workspace types and their construction from histograms.
pub mod workspace;

pub use crate::data::{Dataset, Event, Lepton};
pub use crate::histograms::{Histogram, HistogramSet};
pub use crate::utils::enums::{FinalState, LeptonFlavor, Variation};
pub use crate::utils::vectors::Vec4;

/// The floating-point type used throughout the crate.
pub type Float = f64;

/// Shorthand for results produced by this crate.
pub type HzzResult<T> = Result<T, HzzError>;

/// The error type used by all `hzz4l` methods
#[derive(Error, Debug)]
pub enum HzzError {
    /// An alias for [`std::io::Error`].
    #[error("IO Error: {0}")]
    IOError(#[from] std::io::Error),
    /// An alias for [`parquet::errors::ParquetError`].
    #[error("Parquet Error: {0}")]
    ParquetError(#[from] parquet::errors::ParquetError),
    /// An alias for [`arrow::error::ArrowError`].
    #[error("Arrow Error: {0}")]
    ArrowError(#[from] arrow::error::ArrowError),
    /// An alias for [`shellexpand::LookupError`].
    #[error("Failed to expand path: {0}")]
    LookupError(#[from] shellexpand::LookupError<std::env::VarError>),
    /// An error returned by [`bincode`] while saving or loading histograms.
    #[error("Bincode error: {0}")]
    BincodeError(#[from] bincode::Error),
    /// An error returned by the Python pickle (de)serializer
    #[error("Pickle conversion error: {0}")]
    PickleError(#[from] serde_pickle::Error),
    /// An error returned while reading or writing JSON workspaces and results.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    /// An error returned while parsing a YAML configuration.
    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml_ng::Error),
    /// An error type for [`rayon`] thread pools
    #[cfg(feature = "rayon")]
    #[error("Error building thread pool: {0}")]
    ThreadPoolError(#[from] rayon::ThreadPoolBuildError),
    /// A file of the fileset could not be delivered.
    #[error("Failed to deliver \"{path}\": {source}")]
    DeliveryError {
        /// The file which failed
        path: String,
        /// The underlying error
        #[source]
        source: Box<HzzError>,
    },
    /// A required column was not present in an input file.
    #[error("Column \"{column}\" not found in \"{path}\"")]
    MissingColumn {
        /// Name of the missing column
        column: String,
        /// File which was being read
        path: String,
    },
    /// Two sequences which should have the same length did not.
    #[error("Length mismatch in {context}: expected {expected}, got {actual}")]
    LengthMismatch {
        /// Where the mismatch was found
        context: String,
        /// The expected length
        expected: usize,
        /// The actual length
        actual: usize,
    },
    /// Two histograms with different binnings were combined.
    #[error("Binning mismatch: {0}")]
    BinningMismatch(String),
    /// A histogram required to build a workspace was not filled.
    #[error("No histogram for sample \"{sample}\" and variation \"{variation}\"")]
    MissingHistogram {
        /// Sample name
        sample: String,
        /// Variation name
        variation: String,
    },
    /// A sample name was referenced but never defined.
    #[error("Unknown sample \"{0}\"")]
    UnknownSample(String),
    /// A parameter name was referenced but is not part of the model.
    #[error("Unknown parameter \"{0}\"")]
    UnknownParameter(String),
    /// The analysis configuration is inconsistent.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    /// A workspace cannot be turned into a model.
    #[error("Invalid workspace: {0}")]
    InvalidWorkspace(String),
    /// An error which occurs when the user tries to parse an invalid string of text, typically
    /// into an enum variant.
    #[error("Failed to parse string: \"{name}\" does not correspond to a valid \"{object}\"!")]
    ParseError {
        /// The string which was parsed
        name: String,
        /// The name of the object it failed to parse into
        object: String,
    },
    /// A custom fallback error for errors too complex or too infrequent to warrant their own error
    /// category.
    #[error("{0}")]
    Custom(String),
}
