use std::{
    convert::Infallible,
    fmt::Display,
    fs::File,
    io::BufWriter,
    path::{Path, PathBuf},
    sync::Arc,
};

use ganesh::Function;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use statrs::function::erf::erfc;
use tracing::{info, warn};

use crate::{
    likelihoods::{model_nll, LikelihoodEvaluator, MinimizerOptions},
    model::Model,
    Float, HzzResult,
};

/// The result of a maximum-likelihood fit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FitResults {
    /// Parameter names in model order.
    pub labels: Vec<String>,
    /// Best-fit parameter values.
    pub bestfit: Vec<Float>,
    /// Parameter uncertainties from the inverse Hessian (zero for fixed parameters).
    pub uncertainty: Vec<Float>,
    /// The correlation matrix (zero rows for fixed parameters, unit diagonal).
    pub correlation: Vec<Vec<Float>>,
    /// $`-2\ln\mathcal{L}`$ at the best fit.
    pub twice_nll: Float,
    /// Whether the minimizer converged.
    pub converged: bool,
    /// Index of the parameter of interest.
    pub poi_index: usize,
}

impl FitResults {
    /// The best-fit value and uncertainty of the parameter of interest.
    pub fn poi(&self) -> (Float, Float) {
        (
            self.bestfit[self.poi_index],
            self.uncertainty[self.poi_index],
        )
    }

    /// Write the results as pretty-printed JSON.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> HzzResult<()> {
        let path = PathBuf::from(&*shellexpand::full(&path.as_ref().to_string_lossy())?);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        serde_json::to_writer_pretty(BufWriter::new(File::create(&path)?), self)?;
        Ok(())
    }
}

impl Display for FitResults {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{:<32} {:>12} {:>12}", "parameter", "value", "uncertainty")?;
        for ((label, value), error) in self.labels.iter().zip(&self.bestfit).zip(&self.uncertainty) {
            writeln!(f, "{:<32} {:>12.6} {:>12.6}", label, value, error)?;
        }
        writeln!(f, "-2 ln L = {:.6} (converged: {})", self.twice_nll, self.converged)
    }
}

/// The likelihood restricted to the free parameters, with fixed parameters filled in from a
/// template vector.
struct FreeParameters<'a> {
    nll: &'a LikelihoodEvaluator,
    template: Vec<Float>,
    free: Vec<usize>,
}

impl FreeParameters<'_> {
    fn expand(&self, x: &[Float]) -> Vec<Float> {
        let mut full = self.template.clone();
        for (&index, &value) in self.free.iter().zip(x) {
            full[index] = value;
        }
        full
    }

    fn value(&self, x: &[Float]) -> Float {
        self.nll.evaluate(&self.expand(x))
    }
}

impl Function<Float, (), Infallible> for FreeParameters<'_> {
    fn evaluate(&self, x: &[Float], _user_data: &mut ()) -> Result<Float, Infallible> {
        Ok(self.value(x))
    }
}

/// Fit all free parameters of `model` to its observed counts with the L-BFGS-B minimizer.
///
/// Uncertainties and correlations come from the inverse of a central finite-difference Hessian
/// of $`-\ln\mathcal{L}`$ at the minimum.
pub fn fit(model: &Model, options: Option<MinimizerOptions>) -> HzzResult<FitResults> {
    let model = Arc::new(model.clone());
    let nll = model_nll(&model);
    let free: Vec<usize> = model
        .parameters()
        .iter()
        .enumerate()
        .filter(|(_, p)| !p.fixed)
        .map(|(i, _)| i)
        .collect();
    let problem = FreeParameters {
        nll: &nll,
        template: model.init(),
        free,
    };
    let p0: Vec<Float> = problem.free.iter().map(|&i| problem.template[i]).collect();
    let bounds: Vec<(Float, Float)> = problem
        .free
        .iter()
        .map(|&i| model.parameters()[i].bounds)
        .collect();

    let (x, fx, converged) = if p0.is_empty() {
        (Vec::new(), problem.value(&[]), true)
    } else {
        let status = options.unwrap_or_default().minimize(&problem, &p0, bounds);
        if !status.converged {
            warn!(message = %status.message, "minimization did not converge");
        }
        (status.x.iter().copied().collect::<Vec<_>>(), status.fx, status.converged)
    };

    let n = model.parameters().len();
    let mut uncertainty = vec![0.0; n];
    let mut correlation = vec![vec![0.0; n]; n];
    for i in 0..n {
        correlation[i][i] = 1.0;
    }
    if !x.is_empty() {
        match hessian(&problem, &x).try_inverse() {
            Some(covariance) => {
                for (a, &i) in problem.free.iter().enumerate() {
                    uncertainty[i] = covariance[(a, a)].max(0.0).sqrt();
                }
                for (a, &i) in problem.free.iter().enumerate() {
                    for (b, &j) in problem.free.iter().enumerate() {
                        let denominator = uncertainty[i] * uncertainty[j];
                        if a != b && denominator > 0.0 {
                            correlation[i][j] = covariance[(a, b)] / denominator;
                        }
                    }
                }
            }
            None => warn!("Hessian is singular, uncertainties are not available"),
        }
    }
    let results = FitResults {
        labels: model.parameter_names(),
        bestfit: problem.expand(&x),
        uncertainty,
        correlation,
        twice_nll: 2.0 * fx,
        converged,
        poi_index: model.poi_index(),
    };
    let (poi, poi_error) = results.poi();
    info!(
        poi = %results.labels[results.poi_index],
        value = poi,
        uncertainty = poi_error,
        twice_nll = results.twice_nll,
        "fit complete"
    );
    Ok(results)
}

/// Fit with some parameters held constant at the given values (a conditional fit).
pub fn fit_with_fixed(
    model: &Model,
    fixed: &[(&str, Float)],
    options: Option<MinimizerOptions>,
) -> HzzResult<FitResults> {
    let mut conditional = model.clone();
    for (name, value) in fixed {
        conditional = conditional.with_fixed(name, *value)?;
    }
    fit(&conditional, options)
}

fn hessian(problem: &FreeParameters<'_>, x: &[Float]) -> DMatrix<Float> {
    let n = x.len();
    let steps: Vec<Float> = x.iter().map(|v| 1e-4 * v.abs().max(1.0)).collect();
    let at = |shifts: &[(usize, Float)]| -> Float {
        let mut point = DVector::from_column_slice(x);
        for &(i, sign) in shifts {
            point[i] += sign * steps[i];
        }
        problem.value(point.as_slice())
    };
    let f0 = problem.value(x);
    let mut h = DMatrix::zeros(n, n);
    for i in 0..n {
        h[(i, i)] = (at(&[(i, 1.0)]) - 2.0 * f0 + at(&[(i, -1.0)])) / (steps[i] * steps[i]);
        for j in 0..i {
            let value = (at(&[(i, 1.0), (j, 1.0)]) - at(&[(i, 1.0), (j, -1.0)])
                - at(&[(i, -1.0), (j, 1.0)])
                + at(&[(i, -1.0), (j, -1.0)]))
                / (4.0 * steps[i] * steps[j]);
            h[(i, j)] = value;
            h[(j, i)] = value;
        }
    }
    h
}

/// A discovery test result.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Significance {
    /// The discovery test statistic $`q_0`$.
    pub q0: Float,
    /// The significance $`Z = \sqrt{q_0}`$.
    pub z: Float,
    /// The one-sided p-value of the background-only hypothesis.
    pub p_value: Float,
}

impl Significance {
    fn from_q0(q0: Float) -> Self {
        let z = q0.max(0.0).sqrt();
        Self {
            q0,
            z,
            p_value: 0.5 * erfc(z / std::f64::consts::SQRT_2),
        }
    }
}

/// Observed and expected discovery significance.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignificanceResults {
    /// The significance of the observed counts.
    pub observed: Significance,
    /// The median significance expected for a nominal signal (Asimov data at POI = 1).
    pub expected: Significance,
}

impl Display for SignificanceResults {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "observed significance: {:.3} (p = {:.3e})",
            self.observed.z, self.observed.p_value
        )?;
        writeln!(
            f,
            "expected significance: {:.3} (p = {:.3e})",
            self.expected.z, self.expected.p_value
        )
    }
}

/// The discovery test statistic of the observed counts: $`q_0 = -2\ln\lambda(0)`$ when the
/// best-fit POI is positive, zero otherwise.
pub fn discovery_q0(model: &Model) -> HzzResult<Float> {
    let free = fit(model, None)?;
    if free.bestfit[free.poi_index] <= 0.0 {
        return Ok(0.0);
    }
    let poi = free.labels[free.poi_index].as_str();
    let background_only = fit_with_fixed(model, &[(poi, 0.0)], None)?;
    Ok((background_only.twice_nll - free.twice_nll).max(0.0))
}

/// Observed and expected discovery significance of the signal.
///
/// The expected value is evaluated on Asimov data generated at the initial parameter values with
/// the POI set to 1.
pub fn significance(model: &Model) -> HzzResult<SignificanceResults> {
    let observed = Significance::from_q0(discovery_q0(model)?);
    let mut parameters = model.init();
    parameters[model.poi_index()] = 1.0;
    let expected = Significance::from_q0(discovery_q0(&model.asimov(&parameters)?)?);
    info!(
        observed = observed.z,
        expected = expected.z,
        "discovery significance"
    );
    Ok(SignificanceResults { observed, expected })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{model::tests::simple_workspace, workspace::Workspace};
    use approx::assert_relative_eq;

    /// A single-bin counting experiment with signal `s`, background `b` and no nuisances.
    fn counting(s: Float, b: Float, n: Float) -> Model {
        let json = serde_json::json!({
            "channels": [{"name": "SR", "samples": [
                {"name": "signal", "data": [s], "modifiers": [{"name": "mu", "type": "normfactor", "data": null}]},
                {"name": "background", "data": [b], "modifiers": []}
            ]}],
            "observations": [{"name": "SR", "data": [n]}],
            "measurements": [{"name": "meas", "config": {"poi": "mu", "parameters": []}}],
            "version": "1.0.0"
        });
        let workspace: Workspace = serde_json::from_value(json).unwrap();
        Model::from_workspace(&workspace, None).unwrap()
    }

    #[test]
    fn test_counting_fit() {
        let model = counting(10.0, 50.0, 70.0);
        let results = fit(&model, None).unwrap();
        let (mu, sigma) = results.poi();
        assert_relative_eq!(mu, 2.0, epsilon = 1e-3);
        // sigma_mu = sqrt(n) / s at the minimum
        assert_relative_eq!(sigma, 70.0f64.sqrt() / 10.0, epsilon = 1e-2);
        assert_eq!(results.labels, ["mu"]);
        assert_eq!(results.correlation, vec![vec![1.0]]);
    }

    #[test]
    fn test_counting_significance() {
        let model = counting(10.0, 50.0, 70.0);
        let n: Float = 70.0;
        let b: Float = 50.0;
        let q0 = 2.0 * (n * (n / b).ln() - (n - b));
        let result = significance(&model).unwrap();
        assert_relative_eq!(result.observed.q0, q0, epsilon = 1e-3);
        assert_relative_eq!(result.observed.z, q0.sqrt(), epsilon = 1e-3);
        let n: Float = 60.0;
        let q0_expected = 2.0 * (n * (n / b).ln() - (n - b));
        assert_relative_eq!(result.expected.q0, q0_expected, epsilon = 1e-3);
        assert!(result.expected.p_value > result.observed.p_value);

        let deficit = counting(10.0, 50.0, 40.0);
        assert!(discovery_q0(&deficit).unwrap() < 1e-6);
    }

    #[test]
    fn test_fit_with_nuisances() {
        let model = Model::from_workspace(&simple_workspace(), None).unwrap();
        let results = fit(&model, None).unwrap();
        assert_eq!(results.labels.len(), 5);
        assert!(results.converged);
        assert!(results.uncertainty[0] > 0.0);
        let conditional = fit_with_fixed(&model, &[("mu", 0.0)], None).unwrap();
        assert_eq!(conditional.bestfit[0], 0.0);
        assert_eq!(conditional.uncertainty[0], 0.0);
        assert!(conditional.twice_nll >= results.twice_nll - 1e-6);
        assert!(fit_with_fixed(&model, &[("nope", 0.0)], None).is_err());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fit.json");
        results.save(&path).unwrap();
        let loaded: FitResults =
            serde_json::from_reader(std::fs::File::open(&path).unwrap()).unwrap();
        assert_eq!(loaded.labels, results.labels);
        assert!(format!("{results}").contains("staterror_SR[0]"));
    }

    #[test]
    fn test_fit_is_deterministic() {
        let model = Model::from_workspace(&simple_workspace(), None).unwrap();
        let first = fit(&model, None).unwrap();
        let second = fit(&model, None).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_step_limit_stops_the_minimizer() {
        let model = Model::from_workspace(&simple_workspace(), None).unwrap();
        let full = fit(&model, None).unwrap();
        let limited = fit(&model, Some(MinimizerOptions::default().with_max_steps(1))).unwrap();
        assert!(!limited.converged);
        assert!(full.twice_nll <= limited.twice_nll + 1e-9);
    }
}
