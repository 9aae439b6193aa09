use std::{collections::HashMap, convert::Infallible, sync::Arc};

use auto_ops::*;
use dyn_clone::DynClone;
use ganesh::{algorithms::LBFGSB, Algorithm, Function, Minimizer, Observer, Status};
use statrs::function::gamma::ln_gamma;
use tracing::debug;

use crate::{model::Model, Float, HzzError, HzzResult};

/// Expected counts are clamped to this value before taking logarithms.
const MIN_EXPECTED: Float = 1e-10;

/// A term of a negative log-likelihood.
pub trait LikelihoodTerm: DynClone + Send + Sync {
    /// Evaluate the term at `parameters`, ordered as in [`LikelihoodTerm::parameters`].
    fn evaluate(&self, parameters: &[Float]) -> Float;
    /// The names of the parameters the term depends on.
    fn parameters(&self) -> Vec<String>;
}

dyn_clone::clone_trait_object!(LikelihoodTerm);

/// The Poisson negative log-likelihood of the observed counts of a [`Model`]:
///
/// ```math
/// -\ln\mathcal{L}(\vec{p}) = \sum_{i} \left(\nu_i(\vec{p}) - n_i \ln \nu_i(\vec{p}) + \ln\Gamma(n_i + 1)\right)
/// ```
///
/// Non-integer observations (Asimov data) are handled through $`\ln\Gamma`$.
#[derive(Clone)]
pub struct BinnedNLL {
    model: Arc<Model>,
    observed: Vec<Float>,
    ln_factorials: Vec<Float>,
}

impl BinnedNLL {
    /// Construct a [`BinnedNLL`] of the model's own observations.
    pub fn new(model: &Arc<Model>) -> Box<Self> {
        let observed = model.observed_data();
        Self::build(model, observed)
    }

    /// Construct a [`BinnedNLL`] of other observed counts.
    pub fn with_observed(model: &Arc<Model>, observed: Vec<Float>) -> HzzResult<Box<Self>> {
        if observed.len() != model.n_bins() {
            return Err(HzzError::LengthMismatch {
                context: "observed counts".to_string(),
                expected: model.n_bins(),
                actual: observed.len(),
            });
        }
        Ok(Self::build(model, observed))
    }

    fn build(model: &Arc<Model>, observed: Vec<Float>) -> Box<Self> {
        let ln_factorials = observed.iter().map(|n| ln_gamma(n + 1.0)).collect();
        Self {
            model: Arc::clone(model),
            observed,
            ln_factorials,
        }
        .into()
    }
}

impl LikelihoodTerm for BinnedNLL {
    fn evaluate(&self, parameters: &[Float]) -> Float {
        self.model
            .expected(parameters)
            .into_iter()
            .zip(&self.observed)
            .zip(&self.ln_factorials)
            .map(|((nu, n), ln_factorial)| {
                let nu = nu.max(MIN_EXPECTED);
                if *n > 0.0 {
                    nu - n * nu.ln() + ln_factorial
                } else {
                    nu
                }
            })
            .sum()
    }

    fn parameters(&self) -> Vec<String> {
        self.model.parameter_names()
    }
}

/// A Gaussian constraint term on a single parameter:
///
/// ```math
/// -\ln\mathcal{L}(p) = \frac{1}{2}\left(\frac{p - c}{\sigma}\right)^2 + \ln\sigma + \frac{1}{2}\ln 2\pi
/// ```
#[derive(Clone)]
pub struct GaussianConstraint {
    name: String,
    center: Float,
    width: Float,
}

impl GaussianConstraint {
    /// Constrain the parameter `name` around `center` with standard deviation `width`.
    pub fn new(name: &str, center: Float, width: Float) -> Box<Self> {
        Self {
            name: name.to_string(),
            center,
            width,
        }
        .into()
    }
}

impl LikelihoodTerm for GaussianConstraint {
    fn evaluate(&self, parameters: &[Float]) -> Float {
        let pull = (parameters[0] - self.center) / self.width;
        0.5 * pull * pull + self.width.ln() + 0.5 * (2.0 * std::f64::consts::PI).ln()
    }

    fn parameters(&self) -> Vec<String> {
        vec![self.name.clone()]
    }
}

/// A set of options that are used when minimizations are performed.
pub struct MinimizerOptions {
    algorithm: Box<dyn Algorithm<Float, (), Infallible>>,
    observers: Vec<Box<dyn Observer<Float, ()>>>,
    max_steps: usize,
}

impl Default for MinimizerOptions {
    fn default() -> Self {
        Self {
            algorithm: Box::new(LBFGSB::default()),
            observers: Default::default(),
            max_steps: 4000,
        }
    }
}

struct TracingObserver;

impl Observer<Float, ()> for TracingObserver {
    fn callback(&mut self, step: usize, status: &mut Status<Float>, _user_data: &mut ()) -> bool {
        debug!(step, fx = status.fx, x = %status.x.transpose(), "minimizer step");
        false
    }
}

impl MinimizerOptions {
    /// Log every step of the minimization at the `DEBUG` level.
    pub fn traced(self) -> Self {
        self.with_observer(TracingObserver)
    }
    /// Add an [`Observer`] to the list of [`Observer`]s used in the minimization.
    pub fn with_observer<O: Observer<Float, ()> + 'static>(self, observer: O) -> Self {
        let mut observers = self.observers;
        observers.push(Box::new(observer));
        Self {
            algorithm: self.algorithm,
            observers,
            max_steps: self.max_steps,
        }
    }
    /// Set the maximum number of minimizer steps (default: 4000).
    pub fn with_max_steps(self, max_steps: usize) -> Self {
        Self {
            algorithm: self.algorithm,
            observers: self.observers,
            max_steps,
        }
    }

    /// Minimize any function of `p0.len()` parameters within `bounds`.
    pub fn minimize<F>(self, function: &F, p0: &[Float], bounds: Vec<(Float, Float)>) -> Status<Float>
    where
        F: Function<Float, (), Infallible>,
    {
        let mut m = Minimizer::new_from_box(self.algorithm, p0.len())
            .with_bounds(Some(bounds))
            .with_observers(self.observers)
            .with_max_steps(self.max_steps);
        m.minimize(function, p0, &mut ())
            .unwrap_or_else(|never| match never {});
        m.status
    }
}

/// A handle to a [`LikelihoodTerm`] registered with a [`LikelihoodManager`].
#[derive(Clone)]
pub struct LikelihoodID(usize);

/// Registers [`LikelihoodTerm`]s and maps their parameters onto one shared parameter vector.
///
/// Parameters are shared by name and ordered by first registration.
#[derive(Default, Clone)]
pub struct LikelihoodManager {
    terms: Vec<Box<dyn LikelihoodTerm>>,
    param_name_to_index: HashMap<String, usize>,
    param_names: Vec<String>,
    param_layouts: Vec<Vec<usize>>,
    param_counts: Vec<usize>,
}

impl LikelihoodManager {
    /// Register a term, returning its [`LikelihoodID`].
    pub fn register(&mut self, term: Box<dyn LikelihoodTerm>) -> LikelihoodID {
        let term_idx = self.terms.len();
        let term_parameters = term.parameters();
        for param_name in &term_parameters {
            if !self.param_name_to_index.contains_key(param_name) {
                self.param_name_to_index
                    .insert(param_name.clone(), self.param_names.len());
                self.param_names.push(param_name.clone());
            }
        }
        let param_layout: Vec<usize> = term_parameters
            .iter()
            .map(|name| self.param_name_to_index[name])
            .collect();
        self.param_counts.push(term_parameters.len());
        self.param_layouts.push(param_layout);
        self.terms.push(term);
        LikelihoodID(term_idx)
    }

    /// The shared parameter names.
    pub fn parameters(&self) -> Vec<String> {
        self.param_names.clone()
    }

    /// Bind an expression over the registered terms into an evaluator.
    pub fn load(&self, likelihood_expression: LikelihoodExpression) -> LikelihoodEvaluator {
        LikelihoodEvaluator {
            likelihood_manager: self.clone(),
            likelihood_expression,
        }
    }
}

#[derive(Debug)]
struct LikelihoodValues(Vec<Float>);

/// A sum of registered [`LikelihoodTerm`]s.
#[derive(Clone)]
pub enum LikelihoodExpression {
    /// A registered [`LikelihoodTerm`] referenced by an [`LikelihoodID`].
    Term(LikelihoodID),
    /// The sum of two [`LikelihoodExpression`]s.
    Add(Box<LikelihoodExpression>, Box<LikelihoodExpression>),
}

impl LikelihoodExpression {
    fn evaluate(&self, likelihood_values: &LikelihoodValues) -> Float {
        match self {
            LikelihoodExpression::Term(lid) => likelihood_values.0[lid.0],
            LikelihoodExpression::Add(a, b) => {
                a.evaluate(likelihood_values) + b.evaluate(likelihood_values)
            }
        }
    }
}

impl From<LikelihoodID> for LikelihoodExpression {
    fn from(id: LikelihoodID) -> Self {
        LikelihoodExpression::Term(id)
    }
}

impl_op_ex!(+ |a: &LikelihoodExpression, b: &LikelihoodExpression| -> LikelihoodExpression { LikelihoodExpression::Add(Box::new(a.clone()), Box::new(b.clone()))});
impl_op_ex_commutative!(+ |a: &LikelihoodID, b: &LikelihoodExpression| -> LikelihoodExpression { LikelihoodExpression::Add(Box::new(LikelihoodExpression::Term(a.clone())), Box::new(b.clone()))});
impl_op_ex!(+ |a: &LikelihoodID, b: &LikelihoodID| -> LikelihoodExpression { LikelihoodExpression::Add(Box::new(LikelihoodExpression::Term(a.clone())), Box::new(LikelihoodExpression::Term(b.clone())))});

/// Evaluates a [`LikelihoodExpression`] on the shared parameter vector of its
/// [`LikelihoodManager`].
#[derive(Clone)]
pub struct LikelihoodEvaluator {
    likelihood_manager: LikelihoodManager,
    likelihood_expression: LikelihoodExpression,
}

impl Function<Float, (), Infallible> for LikelihoodEvaluator {
    fn evaluate(&self, parameters: &[Float], _user_data: &mut ()) -> Result<Float, Infallible> {
        Ok(LikelihoodEvaluator::evaluate(self, parameters))
    }
}

impl LikelihoodEvaluator {
    /// The shared parameter names.
    pub fn parameters(&self) -> Vec<String> {
        self.likelihood_manager.parameters()
    }

    /// Evaluate the expression at `parameters`.
    pub fn evaluate(&self, parameters: &[Float]) -> Float {
        let manager = &self.likelihood_manager;
        let likelihood_values = LikelihoodValues(
            manager
                .terms
                .iter()
                .zip(&manager.param_layouts)
                .zip(&manager.param_counts)
                .map(|((term, layout), &count)| {
                    let mut buffer = Vec::with_capacity(count);
                    buffer.extend(layout.iter().map(|&param_idx| parameters[param_idx]));
                    term.evaluate(&buffer)
                })
                .collect(),
        );
        self.likelihood_expression.evaluate(&likelihood_values)
    }

    /// Minimize the expression from `p0` within `bounds`.
    pub fn minimize(
        &self,
        p0: &[Float],
        bounds: Vec<(Float, Float)>,
        options: Option<MinimizerOptions>,
    ) -> Status<Float> {
        options.unwrap_or_default().minimize(self, p0, bounds)
    }
}

/// The full negative log-likelihood of a model: the Poisson term of the observed counts plus a
/// [`GaussianConstraint`] for every constrained parameter. The evaluator's parameters are in
/// the model's order.
pub fn model_nll(model: &Arc<Model>) -> LikelihoodEvaluator {
    let mut manager = LikelihoodManager::default();
    let mut expression: LikelihoodExpression = manager.register(BinnedNLL::new(model)).into();
    for parameter in model.parameters() {
        if let Some(constraint) = parameter.constraint {
            let id = manager.register(GaussianConstraint::new(
                &parameter.name,
                constraint.center,
                constraint.width,
            ));
            expression = &expression + &id;
        }
    }
    manager.load(expression)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::simple_workspace;
    use approx::assert_relative_eq;

    #[test]
    fn test_binned_nll_value() {
        let model = Arc::new(Model::from_workspace(&simple_workspace(), None).unwrap());
        let nll = BinnedNLL::new(&model);
        let init = model.init();
        let expected = 55.0 - 56.0 * 55.0f64.ln() + ln_gamma(57.0) + 30.0
            - 31.0 * 30.0f64.ln()
            + ln_gamma(32.0);
        assert_relative_eq!(nll.evaluate(&init), expected, epsilon = 1e-9);
        assert_eq!(nll.parameters(), model.parameter_names());

        let empty = BinnedNLL::with_observed(&model, vec![0.0, 0.0]).unwrap();
        assert_relative_eq!(empty.evaluate(&init), 85.0, epsilon = 1e-12);
        assert!(BinnedNLL::with_observed(&model, vec![1.0]).is_err());
    }

    #[test]
    fn test_negative_expectation_is_clamped() {
        let model = Arc::new(Model::from_workspace(&simple_workspace(), None).unwrap());
        let nll = BinnedNLL::new(&model);
        let mut pars = model.init();
        pars[0] = 0.0;
        pars[2] = -20.0;
        assert!(model.expected_data(&pars).unwrap().iter().all(|nu| *nu < 0.0));
        let floor = MIN_EXPECTED - 56.0 * MIN_EXPECTED.ln() + ln_gamma(57.0) + MIN_EXPECTED
            - 31.0 * MIN_EXPECTED.ln()
            + ln_gamma(32.0);
        let value = nll.evaluate(&pars);
        assert!(value.is_finite());
        assert_relative_eq!(value, floor, epsilon = 1e-9);

        let empty = BinnedNLL::with_observed(&model, vec![0.0, 0.0]).unwrap();
        assert_relative_eq!(empty.evaluate(&pars), 2.0 * MIN_EXPECTED);
    }

    #[test]
    fn test_model_nll_adds_constraints() {
        let model = Arc::new(Model::from_workspace(&simple_workspace(), None).unwrap());
        let evaluator = model_nll(&model);
        assert_eq!(evaluator.parameters(), model.parameter_names());
        let mut pars = model.init();
        let base = evaluator.evaluate(&pars);
        pars[1] = 1.0;
        let poisson_shift = BinnedNLL::new(&model).evaluate(&pars)
            - BinnedNLL::new(&model).evaluate(&model.init());
        assert_relative_eq!(
            evaluator.evaluate(&pars) - base,
            poisson_shift + 0.5,
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_manager_shares_parameters() {
        let mut manager = LikelihoodManager::default();
        let a = manager.register(GaussianConstraint::new("x", 0.0, 1.0));
        let b = manager.register(GaussianConstraint::new("y", 1.0, 2.0));
        let c = manager.register(GaussianConstraint::new("x", 1.0, 1.0));
        assert_eq!(manager.parameters(), ["x", "y"]);
        let evaluator = manager.load(&a + &b + &c);
        let norm = 0.5 * (2.0 * std::f64::consts::PI).ln();
        assert_relative_eq!(
            evaluator.evaluate(&[1.0, 1.0]),
            0.5 + norm + (2.0f64.ln() + norm) + norm,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_minimize_gaussian() {
        let mut manager = LikelihoodManager::default();
        let a = manager.register(GaussianConstraint::new("x", 2.0, 1.0));
        let b = manager.register(GaussianConstraint::new("y", -1.0, 0.5));
        let evaluator = manager.load(&a + &b);
        let status = evaluator.minimize(&[0.0, 0.0], vec![(-10.0, 10.0), (-10.0, 10.0)], None);
        assert_relative_eq!(status.x[0], 2.0, epsilon = 1e-4);
        assert_relative_eq!(status.x[1], -1.0, epsilon = 1e-4);
    }
}
