use candle_core::{Error, Result, Tensor, Var};
use log::debug;

use super::inference_data::{Data, LatentVars};
use super::objective::Objective;
use super::random_variable::RandomVariable;
use super::reparam::{ReparamEntropyLoss, ReparamKlLoss, ReparamLoss};
use super::score::{ScoreEntropyLoss, ScoreKlLoss, ScoreLoss, ScoreRbLoss};
use super::selector::{dispatch_for, is_analytic_kl, use_score, Strategy};
use super::traits::{KLqpInference, LossBuilder, ModelWrapper, ObjectiveBuilder};

/// Configuration for [`KLqp::initialize_with`].
#[derive(Debug, Clone)]
pub struct KLqpConfig {
    /// Number of Monte Carlo samples S per loss evaluation
    pub n_samples: usize,
    /// Use score-function gradients even when reparameterisation works
    pub force_score: bool,
}

impl Default for KLqpConfig {
    fn default() -> Self {
        Self {
            n_samples: 1,
            force_score: false,
        }
    }
}

impl KLqpConfig {
    pub fn new(n_samples: usize, force_score: bool) -> Self {
        Self {
            n_samples,
            force_score,
        }
    }
}

/// Model, approximations and data of one inference problem, plus the
/// number of samples per batch once initialised.
pub struct VariationalInference {
    latent_vars: LatentVars,
    data: Data,
    model_wrapper: Option<Box<dyn ModelWrapper>>,
    n_samples: Option<usize>,
}

impl VariationalInference {
    /// Inference over a model graph.
    ///
    /// Every approximation must be a root node (mean-field), every
    /// parent of a model node must be either latent or observed, and
    /// every latent variable must be an ancestor of some observation.
    pub fn new(latent_vars: LatentVars, data: Data) -> Result<Self> {
        check_latent_vars(&latent_vars, &data)?;
        check_graph(&latent_vars, &data)?;
        Ok(Self {
            latent_vars,
            data,
            model_wrapper: None,
            n_samples: None,
        })
    }

    /// Inference over a black-box joint density. The graph behind the
    /// latent keys is never evaluated.
    pub fn with_model_wrapper<M>(
        latent_vars: LatentVars,
        data: Data,
        model_wrapper: M,
    ) -> Result<Self>
    where
        M: ModelWrapper + 'static,
    {
        check_latent_vars(&latent_vars, &data)?;
        Ok(Self {
            latent_vars,
            data,
            model_wrapper: Some(Box::new(model_wrapper)),
            n_samples: None,
        })
    }

    pub fn latent_vars(&self) -> &LatentVars {
        &self.latent_vars
    }

    pub fn data(&self) -> &Data {
        &self.data
    }

    pub fn model_wrapper(&self) -> Option<&dyn ModelWrapper> {
        self.model_wrapper.as_deref()
    }

    /// Samples per batch; an error before initialisation
    pub fn n_samples(&self) -> Result<usize> {
        self.n_samples
            .ok_or_else(|| Error::Msg("inference is not initialized: call initialize first".into()))
    }

    pub fn set_n_samples(&mut self, n_samples: usize) -> Result<()> {
        if n_samples == 0 {
            return Err(Error::Msg("n_samples must be positive".into()));
        }
        self.n_samples = Some(n_samples);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.n_samples.is_some()
    }
}

fn check_latent_vars(latent_vars: &LatentVars, data: &Data) -> Result<()> {
    if latent_vars.is_empty() {
        return Err(Error::Msg("latent_vars is empty".into()));
    }
    for (z, qz) in latent_vars.iter() {
        if !qz.is_root() {
            return Err(Error::Msg(format!(
                "approximation {} of {} has parents; only mean-field approximations are supported",
                qz, z
            )));
        }
        if data.observed_value(z).is_some() {
            return Err(Error::Msg(format!("{} is both latent and observed", z)));
        }
    }
    Ok(())
}

fn check_graph(latent_vars: &LatentVars, data: &Data) -> Result<()> {
    let bound =
        |rv: &RandomVariable| latent_vars.contains(rv) || data.observed_value(rv).is_some();

    let nodes = latent_vars.keys().chain(data.observed().map(|(x, _)| x));
    for node in nodes {
        if let Some(pa) = node.parents().iter().find(|pa| !bound(*pa)) {
            return Err(Error::Msg(format!(
                "parent {} of {} is neither latent nor observed",
                pa, node
            )));
        }
    }

    match latent_vars
        .keys()
        .find(|z| !data.observed().any(|(x, _)| z.is_ancestor_of(x)))
    {
        Some(z) => Err(Error::Msg(format!(
            "latent variable {} does not influence any observation",
            z
        ))),
        None => Ok(()),
    }
}

/// KL(q || p) minimisation with the estimator picked from the shape of
/// the model and the approximation.
///
/// Score-function gradients are used when some approximation cannot be
/// reparameterised; a closed-form KL replaces its sampled estimate when
/// the priors allow it.
pub struct KLqp {
    inference: VariationalInference,
    strategy: Option<Strategy>,
}

impl KLqp {
    pub fn new(latent_vars: LatentVars, data: Data) -> Result<Self> {
        Ok(Self::from_inference(VariationalInference::new(latent_vars, data)?))
    }

    pub fn with_model_wrapper<M>(
        latent_vars: LatentVars,
        data: Data,
        model_wrapper: M,
    ) -> Result<Self>
    where
        M: ModelWrapper + 'static,
    {
        Ok(Self::from_inference(VariationalInference::with_model_wrapper(
            latent_vars,
            data,
            model_wrapper,
        )?))
    }

    pub fn from_inference(inference: VariationalInference) -> Self {
        Self {
            inference,
            strategy: None,
        }
    }

    /// Resolve the estimator and store the number of samples per batch.
    ///
    /// # Arguments
    /// * `n_samples` - Monte Carlo samples per loss evaluation
    /// * `force_score` - use score-function gradients even for
    ///   reparameterisable approximations
    pub fn initialize(&mut self, n_samples: usize, force_score: bool) -> Result<()> {
        self.inference.set_n_samples(n_samples)?;

        let score = use_score(self.inference.latent_vars(), force_score);
        let analytic = is_analytic_kl(self.inference.latent_vars(), self.inference.model_wrapper());
        let strategy = dispatch_for(score, analytic, self.inference.model_wrapper().is_some());

        debug!(
            "KLqp: use_score = {}, is_analytic_kl = {}, strategy = {}, n_samples = {}",
            score, analytic, strategy, n_samples
        );
        self.strategy = Some(strategy);
        Ok(())
    }

    pub fn initialize_with(&mut self, config: &KLqpConfig) -> Result<()> {
        self.initialize(config.n_samples, config.force_score)
    }
}

impl KLqpInference for KLqp {
    fn inference(&self) -> &VariationalInference {
        &self.inference
    }

    fn strategy(&self) -> Result<Strategy> {
        self.strategy
            .ok_or_else(|| Error::Msg("KLqp is not initialized: call initialize first".into()))
    }

    fn build_loss_and_gradients(&self, var_list: &[Var]) -> Result<Objective> {
        self.strategy()?
            .builder()
            .build_loss_and_gradients(&self.inference, var_list)
    }
}

/// KLqp session that always uses the builder `B`, whatever the model.
pub struct FixedKLqp<B> {
    inference: VariationalInference,
    builder: B,
}

impl<B: ObjectiveBuilder + Default> FixedKLqp<B> {
    pub fn new(latent_vars: LatentVars, data: Data) -> Result<Self> {
        Ok(Self::from_inference(VariationalInference::new(latent_vars, data)?))
    }

    pub fn with_model_wrapper<M>(
        latent_vars: LatentVars,
        data: Data,
        model_wrapper: M,
    ) -> Result<Self>
    where
        M: ModelWrapper + 'static,
    {
        Ok(Self::from_inference(VariationalInference::with_model_wrapper(
            latent_vars,
            data,
            model_wrapper,
        )?))
    }

    pub fn from_inference(inference: VariationalInference) -> Self {
        Self {
            inference,
            builder: B::default(),
        }
    }

    pub fn initialize(&mut self, n_samples: usize) -> Result<()> {
        self.inference.set_n_samples(n_samples)?;
        debug!(
            "KLqp: fixed strategy = {}, n_samples = {}",
            self.builder.strategy(),
            n_samples
        );
        Ok(())
    }
}

impl<B: LossBuilder> FixedKLqp<B> {
    /// Loss alone, differentiable with respect to q's parameters
    pub fn build_loss(&self) -> Result<Tensor> {
        self.builder.build_loss(&self.inference)
    }
}

impl<B: ObjectiveBuilder> KLqpInference for FixedKLqp<B> {
    fn inference(&self) -> &VariationalInference {
        &self.inference
    }

    fn strategy(&self) -> Result<Strategy> {
        Ok(self.builder.strategy())
    }

    fn build_loss_and_gradients(&self, var_list: &[Var]) -> Result<Objective> {
        self.builder.build_loss_and_gradients(&self.inference, var_list)
    }
}

pub type ReparameterizationKLqp = FixedKLqp<ReparamLoss>;
pub type ReparameterizationKLKLqp = FixedKLqp<ReparamKlLoss>;
pub type ReparameterizationEntropyKLqp = FixedKLqp<ReparamEntropyLoss>;
pub type ScoreKLqp = FixedKLqp<ScoreLoss>;
pub type ScoreRBKLqp = FixedKLqp<ScoreRbLoss>;
pub type ScoreKLKLqp = FixedKLqp<ScoreKlLoss>;
pub type ScoreEntropyKLqp = FixedKLqp<ScoreEntropyLoss>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::klqp::distribution::{Distribution, Family};
    use candle_core::Device;

    fn scalar(v: f32) -> Result<Tensor> {
        Tensor::new(&[v], &Device::Cpu)
    }

    fn child_of(name: &str, parent: &RandomVariable) -> RandomVariable {
        RandomVariable::new(name, Family::Normal, vec![parent.clone()], vec![], |pa| {
            Ok(Distribution::Normal {
                loc: pa[0].clone(),
                scale: pa[0].ones_like()?,
            })
        })
    }

    fn normal_normal() -> Result<(LatentVars, Data)> {
        let z = RandomVariable::normal("z", scalar(0.0)?, scalar(1.0)?);
        let x = child_of("x", &z);
        let qz = RandomVariable::normal("qz", scalar(0.0)?, scalar(1.0)?);
        Ok((
            LatentVars::from_pairs([(z, qz)])?,
            Data::new().with_observed(x, scalar(1.0)?)?,
        ))
    }

    #[test]
    fn test_empty_latent_vars_rejected() -> Result<()> {
        assert!(VariationalInference::new(LatentVars::new(), Data::new()).is_err());
        Ok(())
    }

    #[test]
    fn test_non_mean_field_rejected() -> Result<()> {
        let z = RandomVariable::normal("z", scalar(0.0)?, scalar(1.0)?);
        let w = child_of("w", &z);
        let qz = RandomVariable::normal("qz", scalar(0.0)?, scalar(1.0)?);
        let qw = child_of("qw", &qz);

        let latent_vars = LatentVars::from_pairs([(z, qz), (w, qw)])?;
        assert!(VariationalInference::new(latent_vars, Data::new()).is_err());
        Ok(())
    }

    #[test]
    fn test_latent_and_observed_rejected() -> Result<()> {
        let z = RandomVariable::normal("z", scalar(0.0)?, scalar(1.0)?);
        let qz = RandomVariable::normal("qz", scalar(0.0)?, scalar(1.0)?);
        let latent_vars = LatentVars::from_pairs([(z.clone(), qz)])?;
        let data = Data::new().with_observed(z, scalar(0.0)?)?;
        assert!(VariationalInference::new(latent_vars, data).is_err());
        Ok(())
    }

    #[test]
    fn test_unbound_parent_rejected() -> Result<()> {
        let tau = RandomVariable::normal("tau", scalar(0.0)?, scalar(1.0)?);
        let z = child_of("z", &tau);
        let x = child_of("x", &z);
        let qz = RandomVariable::normal("qz", scalar(0.0)?, scalar(1.0)?);

        let latent_vars = LatentVars::from_pairs([(z, qz)])?;
        let data = Data::new().with_observed(x, scalar(1.0)?)?;
        assert!(VariationalInference::new(latent_vars, data).is_err());
        Ok(())
    }

    #[test]
    fn test_disconnected_latent_rejected() -> Result<()> {
        let z = RandomVariable::normal("z", scalar(0.0)?, scalar(1.0)?);
        let x = child_of("x", &z);
        let stray = RandomVariable::normal("stray", scalar(0.0)?, scalar(1.0)?);
        let qz = RandomVariable::normal("qz", scalar(0.0)?, scalar(1.0)?);
        let q_stray = RandomVariable::normal("q_stray", scalar(0.0)?, scalar(1.0)?);

        let latent_vars = LatentVars::from_pairs([(z.clone(), qz.clone()), (stray, q_stray)])?;
        let data = Data::new().with_observed(x.clone(), scalar(2.0)?)?;
        assert!(VariationalInference::new(latent_vars, data).is_err());

        // a latent reaching the data only through another latent is fine
        let w = child_of("w", &z);
        let y = child_of("y", &w);
        let qw = RandomVariable::normal("qw", scalar(0.0)?, scalar(1.0)?);
        let latent_vars = LatentVars::from_pairs([(z, qz), (w, qw)])?;
        let data = Data::new().with_observed(y, scalar(2.0)?)?;
        assert!(VariationalInference::new(latent_vars, data).is_ok());
        Ok(())
    }

    #[test]
    fn test_build_before_initialize() -> Result<()> {
        let (latent_vars, data) = normal_normal()?;
        let klqp = KLqp::new(latent_vars, data)?;
        assert!(klqp.strategy().is_err());
        assert!(klqp.build_loss_and_gradients(&[]).is_err());
        Ok(())
    }

    #[test]
    fn test_zero_samples_rejected() -> Result<()> {
        let (latent_vars, data) = normal_normal()?;
        let mut klqp = KLqp::new(latent_vars, data)?;
        assert!(klqp.initialize(0, false).is_err());
        assert!(!klqp.inference().is_initialized());

        let (latent_vars, data) = normal_normal()?;
        let mut session = ScoreKLqp::new(latent_vars, data)?;
        assert!(session.initialize(0).is_err());
        Ok(())
    }

    #[test]
    fn test_initialize_resolves_strategy() -> Result<()> {
        let (latent_vars, data) = normal_normal()?;
        let mut klqp = KLqp::new(latent_vars, data)?;

        klqp.initialize(4, false)?;
        assert_eq!(klqp.strategy()?, Strategy::ReparamKl);
        assert_eq!(klqp.inference().n_samples()?, 4);

        klqp.initialize_with(&KLqpConfig::new(2, true))?;
        assert_eq!(klqp.strategy()?, Strategy::ScoreKl);
        assert_eq!(klqp.inference().n_samples()?, 2);
        Ok(())
    }

    #[test]
    fn test_discrete_approximation_uses_rao_blackwell() -> Result<()> {
        let c = RandomVariable::bernoulli("c", scalar(0.0)?);
        let x = child_of("x", &c);
        let qc = RandomVariable::bernoulli("qc", scalar(0.0)?);

        let mut klqp = KLqp::new(
            LatentVars::from_pairs([(c, qc)])?,
            Data::new().with_observed(x, scalar(1.0)?)?,
        )?;
        klqp.initialize(3, false)?;
        assert_eq!(klqp.strategy()?, Strategy::ScoreRb);

        let objective = klqp.build_loss_and_gradients(&[])?;
        assert_eq!(objective.loss.dims(), &[] as &[usize]);
        Ok(())
    }

    #[test]
    fn test_fixed_sessions_ignore_model_shape() -> Result<()> {
        let (latent_vars, data) = normal_normal()?;
        let mut session = ScoreEntropyKLqp::new(latent_vars, data)?;
        session.initialize(2)?;
        assert_eq!(session.strategy()?, Strategy::ScoreEntropy);

        let (latent_vars, data) = normal_normal()?;
        let mut session = ReparameterizationKLqp::new(latent_vars, data)?;
        session.initialize(2)?;
        assert_eq!(session.strategy()?, Strategy::Reparam);
        assert_eq!(session.build_loss()?.dims(), &[] as &[usize]);
        Ok(())
    }
}
