//! The analysis stages chained end to end.

use tracing::info;

use crate::{
    config::AnalysisConfig,
    delivery::deliver,
    fit::{fit as fit_model, significance, FitResults, SignificanceResults},
    histograms::HistogramSet,
    likelihoods::MinimizerOptions,
    model::Model,
    processor::{run, HzzProcessor},
    selection::Cutflow,
    workspace::{build_workspace, Workspace},
    HzzResult,
};

/// Deliver the fileset, fill the four-lepton mass histograms and save them to the configured
/// histogram path.
pub fn histograms(config: &AnalysisConfig) -> HzzResult<(HistogramSet, Cutflow)> {
    let files = config.fileset()?;
    let delivered = deliver(&files, &config.query(), &config.io_options())?;
    let processor = HzzProcessor::new(config.general.binning, config.general.luminosity);
    let output = run(&processor, &delivered)?;
    let path = config.resolve_path(&config.general.histogram_path)?;
    output.histograms.save(&path)?;
    info!(path = %path, "histograms written");
    Ok((output.histograms, output.cutflow))
}

/// Load the histograms saved by [`histograms`].
pub fn load_histograms(config: &AnalysisConfig) -> HzzResult<HistogramSet> {
    HistogramSet::load(config.resolve_path(&config.general.histogram_path)?)
}

/// Build the workspace and save it when a workspace path is configured.
pub fn workspace(config: &AnalysisConfig, histograms: &HistogramSet) -> HzzResult<Workspace> {
    let workspace = build_workspace(config, histograms)?;
    if let Some(path) = &config.general.workspace_path {
        workspace.save(config.resolve_path(path)?)?;
    }
    Ok(workspace)
}

/// Fit the signal strength of a workspace's measurement (the first one when `None`), with at most
/// `max_steps` minimizer steps when given.
pub fn fit(
    workspace: &Workspace,
    measurement: Option<&str>,
    max_steps: Option<usize>,
) -> HzzResult<FitResults> {
    let model = Model::from_workspace(workspace, measurement)?;
    info!(
        n_parameters = model.parameters().len(),
        n_bins = model.n_bins(),
        "fitting"
    );
    let mut options = MinimizerOptions::default().traced();
    if let Some(max_steps) = max_steps {
        options = options.with_max_steps(max_steps);
    }
    fit_model(&model, Some(options))
}

/// The observed and expected discovery significance of a workspace's measurement.
pub fn discovery(workspace: &Workspace, measurement: Option<&str>) -> HzzResult<SignificanceResults> {
    significance(&Model::from_workspace(workspace, measurement)?)
}

/// Size the global thread pool used for delivery and processing (`0` uses every core).
#[cfg(feature = "rayon")]
pub fn configure_threads(threads: usize) -> HzzResult<()> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global()?;
    Ok(())
}

/// Delivery and processing run on the calling thread without the `rayon` feature.
#[cfg(not(feature = "rayon"))]
pub fn configure_threads(_threads: usize) -> HzzResult<()> {
    Ok(())
}
