//! Black-box variational inference by minimising KL(q || p).
//!
//! Given a model p(x, z), mean-field approximations q(z; λ) and observed
//! data, the builders here return a scalar loss (the negative ELBO or a
//! surrogate with the same gradient) and (gradient, parameter) pairs for
//! an external optimizer.
//!
//! # Estimators
//!
//! | strategy | gradient | KL / entropy |
//! |---|---|---|
//! | `Reparam` | through the draws | sampled |
//! | `ReparamKl` | through the draws | closed-form KL |
//! | `ReparamEntropy` | through the draws | closed-form entropy |
//! | `Score` | `∇log q · detach(reward)` | sampled |
//! | `ScoreRb` | per-factor, Rao-Blackwellised | sampled |
//! | `ScoreKl` | `∇log q · detach(log lik)` | closed-form KL |
//! | `ScoreEntropy` | `∇log q · detach(log p)` | closed-form entropy |
//!
//! # Example
//!
//! ```ignore
//! use candle_klqp::klqp::*;
//!
//! let z = RandomVariable::normal("z", zero, one);
//! let x = RandomVariable::new("x", Family::Normal, vec![z.clone()], vec![], |pa| {
//!     Ok(Distribution::Normal { loc: pa[0].clone(), scale: pa[0].ones_like()? })
//! });
//! let qz = RandomVariable::normal_variational(vb.pp("qz"), "qz", 1)?;
//!
//! let mut klqp = KLqp::new(
//!     LatentVars::from_pairs([(z, qz)])?,
//!     Data::new().with_observed(x, x_obs)?,
//! )?;
//! klqp.initialize(10, false)?;
//!
//! let mut optimizer = candle_nn::AdamW::new_lr(varmap.all_vars(), 0.05)?;
//! for _ in 0..num_iters {
//!     let objective = klqp.build_loss_and_gradients(&varmap.all_vars())?;
//!     optimizer.step(&objective.to_grad_store()?)?;
//! }
//! ```

mod analytic;
mod detached;
mod distribution;
mod inference;
mod inference_data;
mod objective;
mod random_variable;
mod reparam;
mod sample_batch;
mod score;
mod selector;
mod traits;

pub use analytic::{entropy_term, kl_normal, kl_standard_normal, kl_term, normal_entropy};
pub use detached::Detached;
pub use distribution::{Distribution, Family};
pub use inference::{
    FixedKLqp, KLqp, KLqpConfig, ReparameterizationEntropyKLqp, ReparameterizationKLKLqp,
    ReparameterizationKLqp, ScoreEntropyKLqp, ScoreKLKLqp, ScoreKLqp, ScoreRBKLqp,
    VariationalInference,
};
pub use inference_data::{Data, DataKey, LatentVars};
pub use objective::{gradients, Objective};
pub use random_variable::{Conditional, RandomVariable, RvId, Substitution};
pub use reparam::{ReparamEntropyLoss, ReparamKlLoss, ReparamLoss};
pub use sample_batch::{GradientPath, ModelTerms, SampleBatch};
pub use score::{ScoreEntropyLoss, ScoreKlLoss, ScoreLoss, ScoreRbLoss};
pub use selector::{dispatch, dispatch_for, is_analytic_kl, use_score, Strategy};
pub use traits::{KLqpInference, LossBuilder, ModelWrapper, ObjectiveBuilder};
