//! Reparameterisation-gradient objectives (Kingma and Welling, 2014).
//!
//! The loss is a differentiable function of q's parameters through the
//! sampling path, so gradients are obtained by back-propagating the loss
//! itself.

use candle_core::{Result, Tensor, Var};

use super::analytic::{entropy_term, kl_term};
use super::inference::VariationalInference;
use super::objective::{gradients, Objective};
use super::sample_batch::{GradientPath, SampleBatch};
use super::selector::Strategy;
use super::traits::{LossBuilder, ObjectiveBuilder};

/// -ELBO = -E_q[log p(x, z) - log q(z)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ReparamLoss;

/// -ELBO = -(E_q[log p(x | z)] - KL(q(z) || p(z))) with the KL in
/// closed form
#[derive(Debug, Clone, Copy, Default)]
pub struct ReparamKlLoss;

/// -ELBO = -(E_q[log p(x, z)] + H(q(z))) with the entropy in closed form
#[derive(Debug, Clone, Copy, Default)]
pub struct ReparamEntropyLoss;

/// -mean(p_log_prob - q_log_prob) over one batch
pub(crate) fn reparam_loss_from_batch(
    inference: &VariationalInference,
    batch: &SampleBatch,
) -> Result<Tensor> {
    let p_log_prob = batch.p_log_prob(inference)?;
    let q_log_prob = batch.q_log_prob()?;
    p_log_prob.sub(&q_log_prob)?.mean(0)?.neg()
}

/// -(mean(p_log_lik) - KL) over one batch
pub(crate) fn reparam_kl_loss_from_batch(
    inference: &VariationalInference,
    batch: &SampleBatch,
) -> Result<Tensor> {
    let p_log_lik = batch.p_log_lik(inference)?;
    let kl = kl_term(inference, batch)?;
    p_log_lik.mean(0)?.sub(&kl)?.neg()
}

/// -(mean(p_log_prob) + H) over one batch
pub(crate) fn reparam_entropy_loss_from_batch(
    inference: &VariationalInference,
    batch: &SampleBatch,
) -> Result<Tensor> {
    let p_log_prob = batch.p_log_prob(inference)?;
    let entropy = entropy_term(inference)?;
    p_log_prob.mean(0)?.add(&entropy)?.neg()
}

fn draw(inference: &VariationalInference) -> Result<SampleBatch> {
    SampleBatch::draw(
        inference.latent_vars(),
        inference.n_samples()?,
        GradientPath::Reparameterized,
    )
}

fn loss_and_gradients(loss: Tensor, var_list: &[Var]) -> Result<Objective> {
    let grads_and_vars = gradients(&loss, var_list)?;
    Ok(Objective::new(loss, grads_and_vars))
}

impl LossBuilder for ReparamLoss {
    fn build_loss(&self, inference: &VariationalInference) -> Result<Tensor> {
        reparam_loss_from_batch(inference, &draw(inference)?)
    }
}

impl ObjectiveBuilder for ReparamLoss {
    fn strategy(&self) -> Strategy {
        Strategy::Reparam
    }

    fn build_loss_and_gradients(
        &self,
        inference: &VariationalInference,
        var_list: &[Var],
    ) -> Result<Objective> {
        loss_and_gradients(self.build_loss(inference)?, var_list)
    }
}

impl LossBuilder for ReparamKlLoss {
    fn build_loss(&self, inference: &VariationalInference) -> Result<Tensor> {
        reparam_kl_loss_from_batch(inference, &draw(inference)?)
    }
}

impl ObjectiveBuilder for ReparamKlLoss {
    fn strategy(&self) -> Strategy {
        Strategy::ReparamKl
    }

    fn build_loss_and_gradients(
        &self,
        inference: &VariationalInference,
        var_list: &[Var],
    ) -> Result<Objective> {
        loss_and_gradients(self.build_loss(inference)?, var_list)
    }
}

impl LossBuilder for ReparamEntropyLoss {
    fn build_loss(&self, inference: &VariationalInference) -> Result<Tensor> {
        reparam_entropy_loss_from_batch(inference, &draw(inference)?)
    }
}

impl ObjectiveBuilder for ReparamEntropyLoss {
    fn strategy(&self) -> Strategy {
        Strategy::ReparamEntropy
    }

    fn build_loss_and_gradients(
        &self,
        inference: &VariationalInference,
        var_list: &[Var],
    ) -> Result<Objective> {
        loss_and_gradients(self.build_loss(inference)?, var_list)
    }
}
