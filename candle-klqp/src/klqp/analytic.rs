//! Closed-form KL divergences and entropies for diagonal Gaussians.

use candle_core::{Error, Result, Tensor};

use super::distribution::Family;
use super::inference::VariationalInference;
use super::sample_batch::{sum_per_sample, SampleBatch};

/// Element-wise KL(N(μq, σq²) || N(μp, σp²))
///
/// log(σp/σq) + (σq² + (μq-μp)²) / (2σp²) - 1/2
pub fn kl_normal(
    loc_q: &Tensor,
    scale_q: &Tensor,
    loc_p: &Tensor,
    scale_p: &Tensor,
) -> Result<Tensor> {
    let log_ratio = scale_p.log()?.broadcast_sub(&scale_q.log()?)?;
    let diff_sq = loc_q.broadcast_sub(loc_p)?.sqr()?;
    let num = diff_sq.broadcast_add(&scale_q.sqr()?)?;
    let quad = num.broadcast_div(&(scale_p.sqr()? * 2.0)?)?;
    log_ratio.broadcast_add(&quad)? - 0.5
}

/// Element-wise KL(N(μq, σq²) || N(0, 1))
///
/// -log(σq) + (σq² + μq²) / 2 - 1/2
pub fn kl_standard_normal(loc_q: &Tensor, scale_q: &Tensor) -> Result<Tensor> {
    let num = loc_q.sqr()?.broadcast_add(&scale_q.sqr()?)?;
    (num * 0.5)?.broadcast_sub(&scale_q.log()?)? - 0.5
}

/// Element-wise differential entropy of N(·, σ²): 0.5 * log(2πe σ²)
pub fn normal_entropy(scale: &Tensor) -> Result<Tensor> {
    let c = 0.5 * (1.0 + (2.0 * std::f64::consts::PI).ln());
    scale.log()? + c
}

/// Σ_z KL(q(z) || p(z)), a scalar.
///
/// Graph models use each latent's own normal prior. A prior whose
/// parameters depend on other variables is conditioned on the batch and
/// its KL averaged over samples. Model wrappers assume p(z) = N(0, 1).
pub fn kl_term(inference: &VariationalInference, batch: &SampleBatch) -> Result<Tensor> {
    let subst = batch.substitution(inference.data())?;
    let mut kls = Vec::with_capacity(inference.latent_vars().len());

    for (z, qz) in inference.latent_vars().iter() {
        let q_dist = qz.distribution(&subst)?;
        let (loc_q, scale_q) = q_dist
            .normal_params()
            .map_err(|_| not_gaussian("approximation", qz.family()))?;

        let kl = match inference.model_wrapper() {
            Some(_) => kl_standard_normal(loc_q, scale_q)?.sum_all()?,
            None => {
                let p_dist = z.distribution(&subst)?;
                let (loc_p, scale_p) = p_dist
                    .normal_params()
                    .map_err(|_| not_gaussian("prior", z.family()))?;
                let kl = kl_normal(loc_q, scale_q, loc_p, scale_p)?;
                if z.is_root() {
                    kl.sum_all()?
                } else {
                    sum_per_sample(&kl, batch.num_samples())?.mean(0)?
                }
            }
        };
        kls.push(kl);
    }

    Tensor::stack(&kls, 0)?.sum(0)
}

/// Σ_z H(q(z)), a scalar. Every approximation must be normal.
pub fn entropy_term(inference: &VariationalInference) -> Result<Tensor> {
    let hs = inference
        .latent_vars()
        .values()
        .map(|qz| match qz.family() {
            Family::Normal => qz.entropy(),
            family => Err(not_gaussian("approximation", family)),
        })
        .collect::<Result<Vec<_>>>()?;

    Tensor::stack(&hs, 0)?.sum(0)
}

fn not_gaussian(role: &str, family: Family) -> Error {
    Error::Msg(format!(
        "closed-form terms need a normal {}, found {:?}",
        role, family
    ))
}
