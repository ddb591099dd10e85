use candle_core::{Error, Result, Tensor};

use super::analytic::normal_entropy;

/// Distribution families a random variable can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    Normal,
    Bernoulli,
}

impl Family {
    pub fn is_continuous(&self) -> bool {
        matches!(self, Family::Normal)
    }

    /// Whether a sample can be written as a differentiable function of
    /// the parameters and parameter-free noise.
    pub fn is_reparameterized(&self) -> bool {
        matches!(self, Family::Normal)
    }
}

/// Element-wise parameterised distribution.
///
/// Parameters broadcast against each other and against the values
/// passed to [`Distribution::log_prob`]; nothing is reduced here.
#[derive(Debug, Clone)]
pub enum Distribution {
    /// N(loc, scale²) element-wise
    Normal { loc: Tensor, scale: Tensor },
    /// Bernoulli(sigmoid(logits)) element-wise
    Bernoulli { logits: Tensor },
}

impl Distribution {
    pub fn family(&self) -> Family {
        match self {
            Distribution::Normal { .. } => Family::Normal,
            Distribution::Bernoulli { .. } => Family::Bernoulli,
        }
    }

    /// (loc, scale) of a normal distribution
    pub fn normal_params(&self) -> Result<(&Tensor, &Tensor)> {
        match self {
            Distribution::Normal { loc, scale } => Ok((loc, scale)),
            other => Err(Error::Msg(format!(
                "expected a normal distribution, found {:?}",
                other.family()
            ))),
        }
    }

    /// Draw `num_samples` samples, shape (S, *param_shape)
    ///
    /// Normal draws are reparameterised: `loc + scale * ε` keeps the
    /// gradient path to both parameters. Bernoulli draws carry no
    /// gradient.
    pub fn sample(&self, num_samples: usize) -> Result<Tensor> {
        match self {
            Distribution::Normal { loc, scale } => {
                let shape = loc.shape().broadcast_shape_binary_op(scale.shape(), "sample")?;
                let mut dims = vec![num_samples];
                dims.extend_from_slice(shape.dims());

                // ε ~ N(0, I): shape (S, ...)
                let eps = Tensor::randn(0f32, 1f32, dims, loc.device())?.to_dtype(loc.dtype())?;

                eps.broadcast_mul(scale)?.broadcast_add(loc)
            }
            Distribution::Bernoulli { logits } => {
                let probs = candle_nn::ops::sigmoid(&logits.detach())?;
                let mut dims = vec![num_samples];
                dims.extend_from_slice(logits.dims());

                let u = Tensor::rand(0f32, 1f32, dims, logits.device())?.to_dtype(logits.dtype())?;
                Ok(u.broadcast_lt(&probs)?.to_dtype(logits.dtype())?.detach())
            }
        }
    }

    /// Element-wise log density at `value`
    ///
    /// * Normal: -0.5 * [(x-μ)²/σ² + ln(2π)] - ln(σ)
    /// * Bernoulli: x * l - softplus(l)
    pub fn log_prob(&self, value: &Tensor) -> Result<Tensor> {
        match self {
            Distribution::Normal { loc, scale } => {
                let ln_2pi = (2.0 * std::f64::consts::PI).ln();
                let z = value.broadcast_sub(loc)?.broadcast_div(scale)?;
                z.sqr()?
                    .affine(-0.5, -0.5 * ln_2pi)?
                    .broadcast_sub(&scale.log()?)
            }
            Distribution::Bernoulli { logits } => value
                .broadcast_mul(logits)?
                .broadcast_sub(&softplus(logits)?),
        }
    }

    /// Element-wise entropy, shape of the parameters
    pub fn entropy(&self) -> Result<Tensor> {
        match self {
            Distribution::Normal { loc, scale } => {
                normal_entropy(scale)?.broadcast_add(&loc.zeros_like()?)
            }
            Distribution::Bernoulli { logits } => {
                // softplus(l) - sigmoid(l) * l
                softplus(logits)?.sub(&candle_nn::ops::sigmoid(logits)?.mul(logits)?)
            }
        }
    }
}

/// ln(1 + exp(x)) = max(x, 0) + ln(1 + exp(-|x|))
pub(crate) fn softplus(x: &Tensor) -> Result<Tensor> {
    let tail = (x.abs()?.neg()?.exp()? + 1.0)?.log()?;
    x.relu()?.add(&tail)
}
