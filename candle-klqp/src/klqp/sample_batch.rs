use candle_core::{DType, Device, Error, Result, Tensor};

use super::detached::Detached;
use super::inference::VariationalInference;
use super::inference_data::{Data, LatentVars};
use super::random_variable::{RandomVariable, Substitution};

/// How gradients may flow through the latent draws
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradientPath {
    /// draws are differentiable functions of q's parameters
    Reparameterized,
    /// draws are constants; gradients reach q only through log q
    Score,
}

/// One batch of S draws from every approximating factor.
///
/// Draws from all factors are taken together as (S, ...) tensors, so
/// sample s of one factor is independent of sample s' of any other and
/// of any previous batch.
pub struct SampleBatch {
    num_samples: usize,
    dtype: DType,
    device: Device,
    /// z -> draw from q(z), shape (S, ...)
    latent: Substitution,
    /// z -> log q(draw), shape (S,)
    q_terms: Vec<(RandomVariable, Tensor)>,
}

impl SampleBatch {
    /// Draw `num_samples` samples from each q in `latent_vars` and
    /// evaluate their log densities.
    pub fn draw(latent_vars: &LatentVars, num_samples: usize, path: GradientPath) -> Result<Self> {
        if num_samples == 0 {
            return Err(Error::Msg("n_samples must be positive".into()));
        }
        if latent_vars.is_empty() {
            return Err(Error::Msg("no latent variables to sample".into()));
        }

        let empty = Substitution::new();
        let mut latent = Substitution::new();
        let mut q_terms = Vec::with_capacity(latent_vars.len());

        for (z, qz) in latent_vars.iter() {
            let draw = qz.sample(num_samples)?;
            let (value, log_q) = match path {
                GradientPath::Reparameterized => {
                    let log_q = qz.log_prob(&draw, &empty)?;
                    (draw, log_q)
                }
                GradientPath::Score => {
                    let fixed = Detached::new(&draw);
                    let log_q = qz.log_prob_detached(&fixed, &empty)?;
                    (fixed.into_inner(), log_q)
                }
            };
            q_terms.push((z.clone(), sum_per_sample(&log_q, num_samples)?));
            latent.insert(z, value);
        }

        let (dtype, device) = match q_terms.first() {
            Some((_, t)) => (t.dtype(), t.device().clone()),
            None => return Err(Error::Msg("no latent variables to sample".into())),
        };

        Ok(Self {
            num_samples,
            dtype,
            device,
            latent,
            q_terms,
        })
    }

    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    /// Latent draws keyed by the model variable z
    pub fn latent_sample(&self) -> &Substitution {
        &self.latent
    }

    /// Per-factor log q terms keyed by the model variable z
    pub fn q_terms(&self) -> &[(RandomVariable, Tensor)] {
        &self.q_terms
    }

    pub fn q_term(&self, z: &RandomVariable) -> Option<&Tensor> {
        self.q_terms.iter().find(|(k, _)| k == z).map(|(_, t)| t)
    }

    /// Σ_z log q(z_s), shape (S,)
    pub fn q_log_prob(&self) -> Result<Tensor> {
        self.sum_terms(self.q_terms.iter().map(|(_, t)| t.clone()).collect())
    }

    /// Latent draws plus observed values, ready to condition the model
    /// graph on.
    pub fn substitution(&self, data: &Data) -> Result<Substitution> {
        let mut subst = self.latent.clone();
        for (x, obs) in data.observed() {
            subst.insert(x, obs.unsqueeze(0)?);
        }
        Ok(subst)
    }

    /// log p(x, z_s), shape (S,)
    pub fn p_log_prob(&self, inference: &VariationalInference) -> Result<Tensor> {
        match inference.model_wrapper() {
            Some(model) => {
                let log_p = model.log_prob(inference.data(), &self.latent)?;
                sum_per_sample(&log_p, self.num_samples)
            }
            None => ModelTerms::evaluate(inference, self, true)?.log_prob(),
        }
    }

    /// log p(x | z_s), shape (S,)
    pub fn p_log_lik(&self, inference: &VariationalInference) -> Result<Tensor> {
        match inference.model_wrapper() {
            Some(model) => {
                if !model.has_log_lik() {
                    return Err(Error::Msg(
                        "the model wrapper does not separate the likelihood from the prior".into(),
                    ));
                }
                let log_lik = model.log_lik(inference.data(), &self.latent)?;
                sum_per_sample(&log_lik, self.num_samples)
            }
            None => ModelTerms::evaluate(inference, self, false)?.log_lik(),
        }
    }

    /// Per-variable model log densities; graph models only
    pub fn model_terms(&self, inference: &VariationalInference) -> Result<ModelTerms> {
        if inference.model_wrapper().is_some() {
            return Err(Error::Msg(
                "per-variable log densities need a model graph, not a model wrapper".into(),
            ));
        }
        ModelTerms::evaluate(inference, self, true)
    }

    pub(crate) fn sum_terms(&self, terms: Vec<Tensor>) -> Result<Tensor> {
        if terms.is_empty() {
            Tensor::zeros(self.num_samples, self.dtype, &self.device)
        } else {
            Tensor::stack(&terms, 0)?.sum(0)
        }
    }
}

/// Model log densities of one batch, one (S,) term per variable.
pub struct ModelTerms {
    /// latent z -> log p(z_s | pa(z)_s)
    prior: Vec<(RandomVariable, Tensor)>,
    /// observed x -> log p(x | pa(x)_s)
    likelihood: Vec<(RandomVariable, Tensor)>,
    num_samples: usize,
    dtype: DType,
    device: Device,
}

impl ModelTerms {
    /// Condition every model node on the batch and the observed data.
    ///
    /// # Arguments
    /// * `inference` - supplies latent keys and data
    /// * `batch` - latent draws
    /// * `with_priors` - also evaluate the prior terms of the latents
    pub fn evaluate(
        inference: &VariationalInference,
        batch: &SampleBatch,
        with_priors: bool,
    ) -> Result<Self> {
        let subst = batch.substitution(inference.data())?;
        let s = batch.num_samples;

        let prior = if with_priors {
            inference
                .latent_vars()
                .keys()
                .map(|z| {
                    let value = subst.get(z).ok_or_else(|| {
                        Error::Msg(format!("no draw for latent variable {}", z))
                    })?;
                    let log_p = z.log_prob(value, &subst)?;
                    Ok((z.clone(), sum_per_sample(&log_p, s)?))
                })
                .collect::<Result<Vec<_>>>()?
        } else {
            vec![]
        };

        let likelihood = inference
            .data()
            .observed()
            .map(|(x, obs)| {
                let log_p = x.log_prob(&obs.unsqueeze(0)?, &subst)?;
                Ok((x.clone(), sum_per_sample(&log_p, s)?))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            prior,
            likelihood,
            num_samples: s,
            dtype: batch.dtype,
            device: batch.device.clone(),
        })
    }

    /// Term of a single model variable
    pub fn term(&self, rv: &RandomVariable) -> Option<&Tensor> {
        self.iter().find(|(k, _)| *k == rv).map(|(_, t)| t)
    }

    /// All terms, latent priors first then observations
    pub fn iter(&self) -> impl Iterator<Item = (&RandomVariable, &Tensor)> {
        self.prior
            .iter()
            .chain(self.likelihood.iter())
            .map(|(k, t)| (k, t))
    }

    /// Model variables with a term
    pub fn variables(&self) -> Vec<RandomVariable> {
        self.iter().map(|(k, _)| k.clone()).collect()
    }

    /// log p(x, z), shape (S,)
    pub fn log_prob(&self) -> Result<Tensor> {
        self.sum(self.iter().map(|(_, t)| t.clone()).collect())
    }

    /// log p(x | z), shape (S,)
    pub fn log_lik(&self) -> Result<Tensor> {
        self.sum(self.likelihood.iter().map(|(_, t)| t.clone()).collect())
    }

    pub(crate) fn sum(&self, terms: Vec<Tensor>) -> Result<Tensor> {
        if terms.is_empty() {
            Tensor::zeros(self.num_samples, self.dtype, &self.device)
        } else {
            Tensor::stack(&terms, 0)?.sum(0)
        }
    }
}

/// Sum over every axis but the leading sample axis, giving shape (S,).
///
/// Terms that do not depend on the draws (leading axis of size 1) are
/// broadcast to all samples.
pub(crate) fn sum_per_sample(t: &Tensor, num_samples: usize) -> Result<Tensor> {
    let per_sample = match t.rank() {
        0 => t.unsqueeze(0)?,
        1 => t.clone(),
        _ => t.flatten_from(1)?.sum(1)?,
    };
    match per_sample.dim(0)? {
        n if n == num_samples => Ok(per_sample),
        1 => per_sample.broadcast_as(num_samples)?.contiguous(),
        n => Err(Error::Msg(format!(
            "expected {} samples along the leading axis, found {}",
            num_samples, n
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::klqp::distribution::{Distribution, Family};
    use candle_core::Var;

    fn scalar(v: f32) -> Result<Tensor> {
        Tensor::new(&[v], &Device::Cpu)
    }

    /// z ~ N(0, 1), x | z ~ N(z, 1), q(z) = N(mean, exp(ln_std))
    fn normal_normal(
        x_obs: f32,
    ) -> Result<(VariationalInference, RandomVariable, Var, Var)> {
        let z = RandomVariable::normal("z", scalar(0.0)?, scalar(1.0)?);
        let x = RandomVariable::new("x", Family::Normal, vec![z.clone()], vec![], |pa| {
            Ok(Distribution::Normal {
                loc: pa[0].clone(),
                scale: pa[0].ones_like()?,
            })
        });
        let mean = Var::new(&[0f32], &Device::Cpu)?;
        let ln_std = Var::new(&[0f32], &Device::Cpu)?;
        let qz = RandomVariable::normal_from_vars("qz", mean.clone(), ln_std.clone());

        let latent_vars = LatentVars::from_pairs([(z.clone(), qz)])?;
        let data = Data::new().with_observed(x, scalar(x_obs)?)?;
        let inference = VariationalInference::new(latent_vars, data)?;
        Ok((inference, z, mean, ln_std))
    }

    #[test]
    fn test_batch_shapes() -> Result<()> {
        let (inference, z, _, _) = normal_normal(2.0)?;
        let batch = SampleBatch::draw(inference.latent_vars(), 13, GradientPath::Reparameterized)?;

        assert_eq!(batch.latent_sample().get(&z).map(|t| t.dims().to_vec()), Some(vec![13, 1]));
        assert_eq!(batch.q_log_prob()?.dims(), &[13]);
        assert_eq!(batch.p_log_prob(&inference)?.dims(), &[13]);
        assert_eq!(batch.p_log_lik(&inference)?.dims(), &[13]);

        let terms = batch.model_terms(&inference)?;
        assert_eq!(terms.variables().len(), 2);
        Ok(())
    }

    #[test]
    fn test_joint_is_prior_plus_likelihood() -> Result<()> {
        let (inference, z, _, _) = normal_normal(2.0)?;
        let batch = SampleBatch::draw(inference.latent_vars(), 5, GradientPath::Score)?;
        let terms = batch.model_terms(&inference)?;

        let joint = terms.log_prob()?.to_vec1::<f32>()?;
        let lik = terms.log_lik()?.to_vec1::<f32>()?;
        let prior = terms
            .term(&z)
            .map(|t| t.to_vec1::<f32>())
            .transpose()?
            .unwrap_or_default();

        let ln_2pi = (2.0 * std::f32::consts::PI).ln();
        let draws = batch
            .latent_sample()
            .get(&z)
            .map(|t| t.flatten_all()?.to_vec1::<f32>())
            .transpose()?
            .unwrap_or_default();

        for s in 0..5 {
            let zs = draws[s];
            let expected_prior = -0.5 * zs * zs - 0.5 * ln_2pi;
            let expected_lik = -0.5 * (2.0 - zs) * (2.0 - zs) - 0.5 * ln_2pi;
            assert!((prior[s] - expected_prior).abs() < 1e-4);
            assert!((lik[s] - expected_lik).abs() < 1e-4);
            assert!((joint[s] - prior[s] - lik[s]).abs() < 1e-4);
        }
        Ok(())
    }

    #[test]
    fn test_score_path_treats_draws_as_constants() -> Result<()> {
        let (inference, z, mean, _) = normal_normal(2.0)?;
        let batch = SampleBatch::draw(inference.latent_vars(), 1, GradientPath::Score)?;

        // with the draw fixed, d log q / d mean = (z - mean) / σ² = z
        let draw: f32 = batch
            .latent_sample()
            .get(&z)
            .map(|t| t.flatten_all()?.get(0)?.to_scalar::<f32>())
            .transpose()?
            .unwrap_or(f32::NAN);
        let grads = batch.q_log_prob()?.sum_all()?.backward()?;
        let g: f32 = grads
            .get(mean.as_tensor())
            .map(|g| g.get(0)?.to_scalar::<f32>())
            .transpose()?
            .unwrap_or(f32::NAN);
        assert!((g - draw).abs() < 1e-5, "{} vs {}", g, draw);
        Ok(())
    }

    #[test]
    fn test_reparam_path_differentiates_through_draws() -> Result<()> {
        let (inference, _, mean, _) = normal_normal(2.0)?;
        let batch = SampleBatch::draw(inference.latent_vars(), 1, GradientPath::Reparameterized)?;

        // log q(mean + σε) = -ε²/2 - ln σ - ln(2π)/2 does not move with the mean
        let grads = batch.q_log_prob()?.sum_all()?.backward()?;
        let g: f32 = match grads.get(mean.as_tensor()) {
            Some(g) => g.get(0)?.to_scalar::<f32>()?,
            None => 0.0,
        };
        assert!(g.abs() < 1e-5, "gradient {}", g);
        Ok(())
    }

    #[test]
    fn test_zero_samples_rejected() -> Result<()> {
        let (inference, _, _, _) = normal_normal(2.0)?;
        assert!(SampleBatch::draw(inference.latent_vars(), 0, GradientPath::Score).is_err());
        Ok(())
    }

    #[test]
    fn test_sum_per_sample_broadcasts_constants() -> Result<()> {
        let t = Tensor::new(&[[1f32, 2f32, 3f32]], &Device::Cpu)?;
        let s = sum_per_sample(&t, 4)?;
        assert_eq!(s.to_vec1::<f32>()?, vec![6f32; 4]);

        let bad = Tensor::zeros((3, 2), DType::F32, &Device::Cpu)?;
        assert!(sum_per_sample(&bad, 4).is_err());
        Ok(())
    }
}
