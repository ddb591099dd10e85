//! Score-function objectives (Paisley et al., 2012).
//!
//! Draws are held fixed and gradients come from a surrogate
//! `-mean(log q * detach(reward))`, which needs no gradient through the
//! sampler and so works for discrete approximations too.

use candle_core::{Error, Result, Tensor, Var};

use super::analytic::{entropy_term, kl_term};
use super::inference::VariationalInference;
use super::objective::{gradients, Objective};
use super::random_variable::RandomVariable;
use super::sample_batch::{GradientPath, SampleBatch};
use super::selector::Strategy;
use super::traits::ObjectiveBuilder;

/// Plain score-function estimator of -ELBO
#[derive(Debug, Clone, Copy, Default)]
pub struct ScoreLoss;

/// Score-function estimator with Rao-Blackwellisation (Ranganath et
/// al., 2014); mean-field approximations only
#[derive(Debug, Clone, Copy, Default)]
pub struct ScoreRbLoss;

/// Score-function estimator with a closed-form KL term
#[derive(Debug, Clone, Copy, Default)]
pub struct ScoreKlLoss;

/// Score-function estimator with a closed-form entropy term
#[derive(Debug, Clone, Copy, Default)]
pub struct ScoreEntropyLoss;

fn draw(inference: &VariationalInference) -> Result<SampleBatch> {
    SampleBatch::draw(
        inference.latent_vars(),
        inference.n_samples()?,
        GradientPath::Score,
    )
}

/// mean(q_log_prob * detach(reward)); its gradient is the score-function
/// estimate of ∇E_q[reward]
fn surrogate(q_log_prob: &Tensor, reward: &Tensor) -> Result<Tensor> {
    q_log_prob.mul(&reward.detach())?.mean(0)
}

pub(crate) fn score_from_batch(
    inference: &VariationalInference,
    batch: &SampleBatch,
    var_list: &[Var],
) -> Result<Objective> {
    let p_log_prob = batch.p_log_prob(inference)?;
    let q_log_prob = batch.q_log_prob()?;

    let losses = p_log_prob.sub(&q_log_prob)?;
    let loss = losses.mean(0)?.neg()?;

    let objective = surrogate(&q_log_prob, &losses)?.neg()?;
    Ok(Objective::new(loss, gradients(&objective, var_list)?))
}

pub(crate) fn score_rb_from_batch(
    inference: &VariationalInference,
    batch: &SampleBatch,
    var_list: &[Var],
) -> Result<Objective> {
    let terms = batch.model_terms(inference)?;
    let latent_vars = inference.latent_vars();
    let model_rvs = terms.variables();

    let mut grads_and_vars = vec![];

    // one surrogate per variational factor, restricted to the factor's
    // Markov blanket in the direction of its descendants
    for (z, qz) in latent_vars.iter() {
        let mut model_rvs_i: Vec<RandomVariable> = z.get_descendants(&model_rvs);
        model_rvs_i.push(z.clone());

        let qi_terms = model_rvs_i
            .iter()
            .filter_map(|rv| batch.q_term(rv).cloned())
            .collect::<Vec<_>>();
        let pi_terms = model_rvs_i
            .iter()
            .filter_map(|rv| terms.term(rv).cloned())
            .collect::<Vec<_>>();

        let qi_log_prob = batch.sum_terms(qi_terms)?;
        let pi_log_prob = terms.sum(pi_terms)?;

        let qz_vars = qz.get_variables(var_list);
        if qz_vars.is_empty() {
            continue;
        }

        let objective = surrogate(&qi_log_prob, &pi_log_prob.sub(&qi_log_prob)?)?.neg()?;
        grads_and_vars.extend(gradients(&objective, &qz_vars)?);
    }

    // diagnostic loss at the first sample only
    let p_first = terms.log_prob()?.get(0)?;
    let q_first = batch.q_log_prob()?.get(0)?;
    let loss = p_first.sub(&q_first)?.neg()?;

    Ok(Objective::new(loss, grads_and_vars))
}

pub(crate) fn score_kl_from_batch(
    inference: &VariationalInference,
    batch: &SampleBatch,
    var_list: &[Var],
) -> Result<Objective> {
    let p_log_lik = batch.p_log_lik(inference)?;
    let q_log_prob = batch.q_log_prob()?;
    let kl = kl_term(inference, batch)?;

    let loss = p_log_lik.mean(0)?.sub(&kl)?.neg()?;
    let objective = surrogate(&q_log_prob, &p_log_lik)?.sub(&kl)?.neg()?;
    Ok(Objective::new(loss, gradients(&objective, var_list)?))
}

pub(crate) fn score_entropy_from_batch(
    inference: &VariationalInference,
    batch: &SampleBatch,
    var_list: &[Var],
) -> Result<Objective> {
    let p_log_prob = batch.p_log_prob(inference)?;
    let q_log_prob = batch.q_log_prob()?;
    let entropy = entropy_term(inference)?;

    let loss = p_log_prob.mean(0)?.add(&entropy)?.neg()?;
    let objective = surrogate(&q_log_prob, &p_log_prob)?.add(&entropy)?.neg()?;
    Ok(Objective::new(loss, gradients(&objective, var_list)?))
}

impl ObjectiveBuilder for ScoreLoss {
    fn strategy(&self) -> Strategy {
        Strategy::Score
    }

    fn build_loss_and_gradients(
        &self,
        inference: &VariationalInference,
        var_list: &[Var],
    ) -> Result<Objective> {
        score_from_batch(inference, &draw(inference)?, var_list)
    }
}

impl ObjectiveBuilder for ScoreRbLoss {
    fn strategy(&self) -> Strategy {
        Strategy::ScoreRb
    }

    fn build_loss_and_gradients(
        &self,
        inference: &VariationalInference,
        var_list: &[Var],
    ) -> Result<Objective> {
        if inference.model_wrapper().is_some() {
            return Err(Error::Msg(
                "Rao-Blackwellisation needs a model graph, not a model wrapper".into(),
            ));
        }
        score_rb_from_batch(inference, &draw(inference)?, var_list)
    }
}

impl ObjectiveBuilder for ScoreKlLoss {
    fn strategy(&self) -> Strategy {
        Strategy::ScoreKl
    }

    fn build_loss_and_gradients(
        &self,
        inference: &VariationalInference,
        var_list: &[Var],
    ) -> Result<Objective> {
        score_kl_from_batch(inference, &draw(inference)?, var_list)
    }
}

impl ObjectiveBuilder for ScoreEntropyLoss {
    fn strategy(&self) -> Strategy {
        Strategy::ScoreEntropy
    }

    fn build_loss_and_gradients(
        &self,
        inference: &VariationalInference,
        var_list: &[Var],
    ) -> Result<Objective> {
        score_entropy_from_batch(inference, &draw(inference)?, var_list)
    }
}
