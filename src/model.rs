//! The binned HistFactory model of a [`Workspace`].

use std::{
    collections::{BTreeMap, HashMap},
    fmt::Display,
};

use serde::{Deserialize, Serialize};

use crate::{
    workspace::{Measurement, Modifier, Workspace},
    Float, HzzError, HzzResult,
};

const NORMFACTOR_BOUNDS: (Float, Float) = (0.0, 10.0);
const NUISANCE_BOUNDS: (Float, Float) = (-5.0, 5.0);
const GAMMA_BOUNDS: (Float, Float) = (1e-10, 10.0);

/// A Gaussian constraint on a parameter.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    /// The auxiliary measurement (center of the Gaussian).
    pub center: Float,
    /// The width of the Gaussian.
    pub width: Float,
}

/// A model parameter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    /// The parameter name.
    pub name: String,
    /// The initial value.
    pub init: Float,
    /// Lower and upper bound.
    pub bounds: (Float, Float),
    /// The Gaussian constraint, if the parameter is constrained.
    pub constraint: Option<Constraint>,
    /// Whether the parameter is held constant in fits.
    pub fixed: bool,
}

#[derive(Clone, Debug)]
enum ModelModifier {
    NormFactor {
        param: usize,
    },
    NormSys {
        param: usize,
        hi: Float,
        lo: Float,
    },
    HistoSys {
        param: usize,
        hi: Vec<Float>,
        lo: Vec<Float>,
    },
    StatError {
        params: Vec<usize>,
    },
}

#[derive(Clone, Debug)]
struct ModelSample {
    name: String,
    nominal: Vec<Float>,
    modifiers: Vec<ModelModifier>,
}

#[derive(Clone, Debug)]
struct ModelChannel {
    name: String,
    samples: Vec<ModelSample>,
    observed: Vec<Float>,
}

/// The statistical model of a workspace: parameters and the expected yields as a function of
/// them.
///
/// Parameters are ordered with the parameter of interest first, followed by every other
/// modifier name in lexicographic order. Per-bin `staterror` parameters are named `name[i]`
/// and stay in bin order.
#[derive(Clone, Debug)]
pub struct Model {
    channels: Vec<ModelChannel>,
    parameters: Vec<Parameter>,
    index: HashMap<String, usize>,
    poi_index: usize,
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum Kind {
    NormFactor,
    Constrained,
    StatError { n_bins: usize },
}

impl Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Kind::NormFactor => write!(f, "a normfactor"),
            Kind::Constrained => write!(f, "a constrained nuisance parameter"),
            Kind::StatError { n_bins } => write!(f, "a staterror over {n_bins} bins"),
        }
    }
}

fn observation<'a>(workspace: &'a Workspace, channel: &str) -> HzzResult<&'a [Float]> {
    workspace
        .observations
        .iter()
        .find(|o| o.name == channel)
        .map(|o| o.data.as_slice())
        .ok_or_else(|| {
            HzzError::InvalidWorkspace(format!("no observation for channel \"{channel}\""))
        })
}

impl Model {
    /// Build the model of `measurement` (the first one when `None`).
    pub fn from_workspace(workspace: &Workspace, measurement: Option<&str>) -> HzzResult<Self> {
        let measurement = workspace.measurement(measurement)?;
        let poi = measurement.config.poi.clone();

        let mut kinds: BTreeMap<String, Kind> = BTreeMap::new();
        for channel in &workspace.channels {
            let n_bins = observation(workspace, &channel.name)?.len();
            for sample in &channel.samples {
                let check = |context: &str, actual: usize| -> HzzResult<()> {
                    if actual != n_bins {
                        return Err(HzzError::LengthMismatch {
                            context: format!("{context} of {}/{}", channel.name, sample.name),
                            expected: n_bins,
                            actual,
                        });
                    }
                    Ok(())
                };
                check("nominal yields", sample.data.len())?;
                for modifier in &sample.modifiers {
                    let kind = match modifier {
                        Modifier::NormFactor { .. } => Kind::NormFactor,
                        Modifier::NormSys { .. } => Kind::Constrained,
                        Modifier::HistoSys { name, data } => {
                            check(name, data.hi_data.len())?;
                            check(name, data.lo_data.len())?;
                            Kind::Constrained
                        }
                        Modifier::StatError { name, data } => {
                            check(name, data.len())?;
                            Kind::StatError { n_bins: data.len() }
                        }
                    };
                    let name = modifier.name();
                    match kinds.get(name) {
                        Some(existing) if *existing != kind => {
                            return Err(HzzError::InvalidWorkspace(format!(
                                "modifier \"{name}\" of {}/{} is declared as {kind}, but earlier as {existing}",
                                channel.name, sample.name
                            )));
                        }
                        Some(_) => {}
                        None => {
                            kinds.insert(name.to_string(), kind);
                        }
                    }
                }
            }
        }
        if !kinds.contains_key(&poi) {
            return Err(HzzError::UnknownParameter(poi));
        }

        let widths = staterror_widths(workspace);
        let mut parameters = Vec::new();
        let mut push = |name: &str, kind: &Kind| match kind {
            Kind::NormFactor => parameters.push(Parameter {
                name: name.to_string(),
                init: 1.0,
                bounds: NORMFACTOR_BOUNDS,
                constraint: None,
                fixed: false,
            }),
            Kind::Constrained => parameters.push(Parameter {
                name: name.to_string(),
                init: 0.0,
                bounds: NUISANCE_BOUNDS,
                constraint: Some(Constraint {
                    center: 0.0,
                    width: 1.0,
                }),
                fixed: false,
            }),
            Kind::StatError { n_bins } => {
                let widths = widths.get(name);
                for bin in 0..*n_bins {
                    let width = widths.and_then(|w| w.get(bin).copied()).unwrap_or(0.0);
                    let usable = width > 0.0 && width.is_finite();
                    parameters.push(Parameter {
                        name: format!("{name}[{bin}]"),
                        init: 1.0,
                        bounds: GAMMA_BOUNDS,
                        constraint: usable.then_some(Constraint { center: 1.0, width }),
                        fixed: !usable,
                    });
                }
            }
        };
        push(&poi, &kinds[&poi]);
        for (name, kind) in kinds.iter().filter(|(name, _)| **name != poi) {
            push(name.as_str(), kind);
        }
        apply_overrides(&mut parameters, measurement)?;
        let index: HashMap<String, usize> = parameters
            .iter()
            .enumerate()
            .map(|(i, p)| (p.name.clone(), i))
            .collect();
        let lookup = |name: &str| {
            index
                .get(name)
                .copied()
                .ok_or_else(|| HzzError::UnknownParameter(name.to_string()))
        };

        let mut channels = Vec::new();
        for channel in &workspace.channels {
            let observed = observation(workspace, &channel.name)?.to_vec();
            let mut samples = Vec::new();
            for sample in &channel.samples {
                let modifiers = sample
                    .modifiers
                    .iter()
                    .map(|modifier| {
                        Ok(match modifier {
                            Modifier::NormFactor { name, .. } => ModelModifier::NormFactor {
                                param: lookup(name)?,
                            },
                            Modifier::NormSys { name, data } => ModelModifier::NormSys {
                                param: lookup(name)?,
                                hi: data.hi,
                                lo: data.lo,
                            },
                            Modifier::HistoSys { name, data } => ModelModifier::HistoSys {
                                param: lookup(name)?,
                                hi: data.hi_data.clone(),
                                lo: data.lo_data.clone(),
                            },
                            Modifier::StatError { name, data } => ModelModifier::StatError {
                                params: (0..data.len())
                                    .map(|bin| lookup(&format!("{name}[{bin}]")))
                                    .collect::<HzzResult<_>>()?,
                            },
                        })
                    })
                    .collect::<HzzResult<Vec<_>>>()?;
                samples.push(ModelSample {
                    name: sample.name.clone(),
                    nominal: sample.data.clone(),
                    modifiers,
                });
            }
            channels.push(ModelChannel {
                name: channel.name.clone(),
                samples,
                observed,
            });
        }
        Ok(Self {
            channels,
            parameters,
            index,
            poi_index: 0,
        })
    }

    /// The model parameters in evaluation order.
    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    /// The parameter names in evaluation order.
    pub fn parameter_names(&self) -> Vec<String> {
        self.parameters.iter().map(|p| p.name.clone()).collect()
    }

    /// The index of a parameter by name.
    pub fn parameter_index(&self, name: &str) -> HzzResult<usize> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| HzzError::UnknownParameter(name.to_string()))
    }

    /// The index of the parameter of interest.
    pub fn poi_index(&self) -> usize {
        self.poi_index
    }

    /// The initial parameter values.
    pub fn init(&self) -> Vec<Float> {
        self.parameters.iter().map(|p| p.init).collect()
    }

    /// The parameter bounds.
    pub fn bounds(&self) -> Vec<(Float, Float)> {
        self.parameters.iter().map(|p| p.bounds).collect()
    }

    /// The total number of bins over all channels.
    pub fn n_bins(&self) -> usize {
        self.channels.iter().map(|c| c.observed.len()).sum()
    }

    /// A copy of the model with a parameter held constant at `value`.
    pub fn with_fixed(&self, name: &str, value: Float) -> HzzResult<Self> {
        let index = self.parameter_index(name)?;
        let mut model = self.clone();
        model.parameters[index].init = value;
        model.parameters[index].fixed = true;
        Ok(model)
    }

    /// The observed counts of every channel, concatenated.
    pub fn observed_data(&self) -> Vec<Float> {
        self.channels
            .iter()
            .flat_map(|c| c.observed.iter().copied())
            .collect()
    }

    /// The expected counts of every channel, concatenated.
    pub fn expected_data(&self, parameters: &[Float]) -> HzzResult<Vec<Float>> {
        self.check_parameters(parameters)?;
        Ok(self.expected(parameters))
    }

    /// [`Model::expected_data`] for a parameter vector already known to have the right length.
    pub(crate) fn expected(&self, parameters: &[Float]) -> Vec<Float> {
        self.channels
            .iter()
            .flat_map(|channel| {
                let mut total = vec![0.0; channel.observed.len()];
                for sample in &channel.samples {
                    for (t, y) in total.iter_mut().zip(sample_yields(sample, parameters)) {
                        *t += y;
                    }
                }
                total
            })
            .collect()
    }

    /// A copy of the model whose observations are the expected counts at `parameters`, with the
    /// constraint centers of the nuisance parameters moved to their values in `parameters`.
    pub fn asimov(&self, parameters: &[Float]) -> HzzResult<Self> {
        let expected = self.expected_data(parameters)?;
        let mut model = self.clone();
        let mut offset = 0;
        for channel in &mut model.channels {
            let n = channel.observed.len();
            channel.observed = expected[offset..offset + n].to_vec();
            offset += n;
        }
        for (parameter, value) in model.parameters.iter_mut().zip(parameters) {
            if let Some(constraint) = parameter.constraint.as_mut() {
                constraint.center = *value;
            }
        }
        Ok(model)
    }

    /// The Asimov counts at `parameters`, identical to [`Model::expected_data`].
    pub fn asimov_data(&self, parameters: &[Float]) -> HzzResult<Vec<Float>> {
        self.expected_data(parameters)
    }

    /// Per-sample and total yields of every channel at `parameters`.
    pub fn yields(&self, parameters: &[Float]) -> HzzResult<Yields> {
        self.check_parameters(parameters)?;
        Ok(Yields {
            channels: self
                .channels
                .iter()
                .map(|channel| {
                    let samples: Vec<(String, Vec<Float>)> = channel
                        .samples
                        .iter()
                        .map(|s| (s.name.clone(), sample_yields(s, parameters)))
                        .collect();
                    let mut total = vec![0.0; channel.observed.len()];
                    for (_, yields) in &samples {
                        for (t, y) in total.iter_mut().zip(yields) {
                            *t += y;
                        }
                    }
                    ChannelYields {
                        channel: channel.name.clone(),
                        samples,
                        total,
                        observed: channel.observed.clone(),
                    }
                })
                .collect(),
        })
    }

    fn check_parameters(&self, parameters: &[Float]) -> HzzResult<()> {
        if parameters.len() != self.parameters.len() {
            return Err(HzzError::LengthMismatch {
                context: "model parameters".to_string(),
                expected: self.parameters.len(),
                actual: parameters.len(),
            });
        }
        Ok(())
    }
}

fn sample_yields(sample: &ModelSample, parameters: &[Float]) -> Vec<Float> {
    let mut yields = sample.nominal.clone();
    for modifier in &sample.modifiers {
        if let ModelModifier::HistoSys { param, hi, lo } = modifier {
            let alpha = parameters[*param];
            for (bin, y) in yields.iter_mut().enumerate() {
                *y += histosys_code4p(alpha, lo[bin], sample.nominal[bin], hi[bin]);
            }
        }
    }
    for modifier in &sample.modifiers {
        match modifier {
            ModelModifier::NormFactor { param } => {
                let factor = parameters[*param];
                yields.iter_mut().for_each(|y| *y *= factor);
            }
            ModelModifier::NormSys { param, hi, lo } => {
                let factor = normsys_code4(parameters[*param], *hi, *lo);
                yields.iter_mut().for_each(|y| *y *= factor);
            }
            ModelModifier::StatError { params } => {
                for (y, p) in yields.iter_mut().zip(params) {
                    *y *= parameters[*p];
                }
            }
            ModelModifier::HistoSys { .. } => {}
        }
    }
    yields
}

/// Relative staterror widths per modifier name: $`\sqrt{\sum \sigma^2} / \sum \nu`$ over the
/// samples sharing the modifier.
fn staterror_widths(workspace: &Workspace) -> HashMap<String, Vec<Float>> {
    let mut sums: HashMap<String, (Vec<Float>, Vec<Float>)> = HashMap::new();
    for channel in &workspace.channels {
        for sample in &channel.samples {
            for modifier in &sample.modifiers {
                if let Modifier::StatError { name, data } = modifier {
                    let (nominal, variance) = sums
                        .entry(name.clone())
                        .or_insert_with(|| (vec![0.0; data.len()], vec![0.0; data.len()]));
                    for (bin, sigma) in data.iter().enumerate() {
                        nominal[bin] += sample.data[bin];
                        variance[bin] += sigma * sigma;
                    }
                }
            }
        }
    }
    sums.into_iter()
        .map(|(name, (nominal, variance))| {
            let widths = nominal
                .iter()
                .zip(&variance)
                .map(|(n, v)| if *n > 0.0 { v.sqrt() / n } else { 0.0 })
                .collect();
            (name, widths)
        })
        .collect()
}

fn apply_overrides(parameters: &mut [Parameter], measurement: &Measurement) -> HzzResult<()> {
    for config in &measurement.config.parameters {
        let matching: Vec<&mut Parameter> = parameters
            .iter_mut()
            .filter(|p| {
                p.name == config.name
                    || p.name
                        .strip_prefix(config.name.as_str())
                        .is_some_and(|rest| rest.starts_with('['))
            })
            .collect();
        if matching.is_empty() {
            return Err(HzzError::UnknownParameter(config.name.clone()));
        }
        let n = matching.len();
        for (i, parameter) in matching.into_iter().enumerate() {
            if let Some(init) = pick(&config.inits, i, n) {
                parameter.init = init;
            }
            if let Some([low, high]) = pick(&config.bounds, i, n) {
                parameter.bounds = (low, high);
            }
            parameter.fixed |= config.fixed;
        }
    }
    Ok(())
}

/// A per-parameter override value: one value applies to every bin, otherwise one per bin.
fn pick<T: Copy>(values: &[T], i: usize, n: usize) -> Option<T> {
    match values.len() {
        0 => None,
        1 => Some(values[0]),
        len if len == n => Some(values[i]),
        _ => None,
    }
}

/// Exponential interpolation with a polynomial core for `|alpha| < 1` (pyhf `code4`).
pub fn normsys_code4(alpha: Float, hi: Float, lo: Float) -> Float {
    if hi <= 0.0 || lo <= 0.0 {
        return if alpha >= 0.0 {
            1.0 + alpha * (hi - 1.0)
        } else {
            1.0 - alpha * (1.0 - lo)
        };
    }
    if alpha.abs() >= 1.0 {
        let base = if alpha >= 0.0 { hi } else { lo };
        return base.powf(alpha.abs());
    }
    const A_INV: [[Float; 6]; 6] = [
        [15.0 / 16.0, -15.0 / 16.0, -7.0 / 16.0, -7.0 / 16.0, 1.0 / 16.0, -1.0 / 16.0],
        [3.0 / 2.0, 3.0 / 2.0, -9.0 / 16.0, 9.0 / 16.0, 1.0 / 16.0, 1.0 / 16.0],
        [-5.0 / 8.0, 5.0 / 8.0, 5.0 / 8.0, 5.0 / 8.0, -1.0 / 8.0, 1.0 / 8.0],
        [-3.0 / 2.0, -3.0 / 2.0, 7.0 / 8.0, -7.0 / 8.0, -1.0 / 8.0, -1.0 / 8.0],
        [3.0 / 16.0, -3.0 / 16.0, -3.0 / 16.0, -3.0 / 16.0, 1.0 / 16.0, -1.0 / 16.0],
        [1.0 / 2.0, 1.0 / 2.0, -5.0 / 16.0, 5.0 / 16.0, 1.0 / 16.0, 1.0 / 16.0],
    ];
    let (ln_hi, ln_lo) = (hi.ln(), lo.ln());
    let b = [
        hi - 1.0,
        lo - 1.0,
        hi * ln_hi,
        -lo * ln_lo,
        hi * ln_hi * ln_hi,
        lo * ln_lo * ln_lo,
    ];
    let mut value = 1.0;
    let mut power = 1.0;
    for row in A_INV {
        power *= alpha;
        value += power * row.iter().zip(&b).map(|(a, b)| a * b).sum::<Float>();
    }
    value
}

/// Linear extrapolation with a polynomial core for `|alpha| <= 1` (pyhf `code4p`). Returns the
/// shift added to the nominal yield.
pub fn histosys_code4p(alpha: Float, down: Float, nominal: Float, up: Float) -> Float {
    let delta_up = up - nominal;
    let delta_down = nominal - down;
    if alpha > 1.0 {
        return delta_up * alpha;
    }
    if alpha < -1.0 {
        return delta_down * alpha;
    }
    let s = 0.5 * (delta_up + delta_down);
    let a = 0.0625 * (delta_up - delta_down);
    let asq = alpha * alpha;
    alpha * s + asq * (asq * (3.0 * asq - 10.0) + 15.0) * a
}

/// Yields of one channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelYields {
    /// Channel name.
    pub channel: String,
    /// Per-sample yields in each bin.
    pub samples: Vec<(String, Vec<Float>)>,
    /// Total expected yield in each bin.
    pub total: Vec<Float>,
    /// Observed counts in each bin.
    pub observed: Vec<Float>,
}

/// Yield tables of every channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Yields {
    /// The channels, in workspace order.
    pub channels: Vec<ChannelYields>,
}

impl Display for Yields {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for channel in &self.channels {
            writeln!(f, "{}", channel.channel)?;
            for (sample, yields) in &channel.samples {
                writeln!(f, "  {:<24} {:>12.3}", sample, yields.iter().sum::<Float>())?;
            }
            writeln!(f, "  {:<24} {:>12.3}", "total", channel.total.iter().sum::<Float>())?;
            writeln!(
                f,
                "  {:<24} {:>12.3}",
                "observed",
                channel.observed.iter().sum::<Float>()
            )?;
        }
        Ok(())
    }
}
