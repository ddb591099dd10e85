use candle_core::{Error, Result, Tensor, Var};

use super::inference::VariationalInference;
use super::inference_data::Data;
use super::objective::Objective;
use super::random_variable::Substitution;
use super::selector::Strategy;

/// Model given as a black-box joint density instead of a graph.
///
/// When a wrapper is present no substitution into the graph takes
/// place; the wrapper sees the full data and the latent draws.
pub trait ModelWrapper {
    /// Evaluate log p(x, z)
    ///
    /// # Arguments
    /// * `data` - observed data
    /// * `latent_sample` - latent draws, each of shape (S, ...)
    ///
    /// # Returns
    /// Log joint density, shape (S,) or a scalar shared by all samples
    fn log_prob(&self, data: &Data, latent_sample: &Substitution) -> Result<Tensor>;

    /// Evaluate log p(x | z). Only called when [`ModelWrapper::has_log_lik`]
    /// returns true.
    fn log_lik(&self, _data: &Data, _latent_sample: &Substitution) -> Result<Tensor> {
        Err(Error::Msg("this model wrapper has no log_lik".into()))
    }

    /// Whether the likelihood can be evaluated apart from the prior
    fn has_log_lik(&self) -> bool {
        false
    }
}

/// One way of turning a Monte Carlo batch into loss and gradients.
pub trait ObjectiveBuilder {
    fn strategy(&self) -> Strategy;

    /// # Arguments
    /// * `inference` - model, approximations, data and `n_samples`
    /// * `var_list` - parameters to differentiate
    fn build_loss_and_gradients(
        &self,
        inference: &VariationalInference,
        var_list: &[Var],
    ) -> Result<Objective>;
}

/// Builders whose loss is itself differentiable (reparameterisation
/// gradients), so gradients follow from back-propagating the loss.
pub trait LossBuilder: ObjectiveBuilder {
    fn build_loss(&self, inference: &VariationalInference) -> Result<Tensor>;
}

/// A KLqp session an optimisation driver can step through.
pub trait KLqpInference {
    fn inference(&self) -> &VariationalInference;

    /// The strategy the next call will use
    fn strategy(&self) -> Result<Strategy>;

    /// Draw a fresh batch and build loss and gradients over `var_list`
    fn build_loss_and_gradients(&self, var_list: &[Var]) -> Result<Objective>;
}
