//! Estimator selection and dispatch.

use std::fmt;

use super::distribution::Family;
use super::inference_data::LatentVars;
use super::reparam::{ReparamEntropyLoss, ReparamKlLoss, ReparamLoss};
use super::score::{ScoreEntropyLoss, ScoreKlLoss, ScoreLoss, ScoreRbLoss};
use super::traits::{ModelWrapper, ObjectiveBuilder};

/// Gradient estimator crossed with the analytic term it uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    Reparam,
    ReparamKl,
    ReparamEntropy,
    Score,
    ScoreRb,
    ScoreKl,
    ScoreEntropy,
}

impl Strategy {
    pub const ALL: [Strategy; 7] = [
        Strategy::Reparam,
        Strategy::ReparamKl,
        Strategy::ReparamEntropy,
        Strategy::Score,
        Strategy::ScoreRb,
        Strategy::ScoreKl,
        Strategy::ScoreEntropy,
    ];

    /// The builder implementing this strategy
    pub fn builder(&self) -> Box<dyn ObjectiveBuilder> {
        match self {
            Strategy::Reparam => Box::new(ReparamLoss),
            Strategy::ReparamKl => Box::new(ReparamKlLoss),
            Strategy::ReparamEntropy => Box::new(ReparamEntropyLoss),
            Strategy::Score => Box::new(ScoreLoss),
            Strategy::ScoreRb => Box::new(ScoreRbLoss),
            Strategy::ScoreKl => Box::new(ScoreKlLoss),
            Strategy::ScoreEntropy => Box::new(ScoreEntropyLoss),
        }
    }

    pub fn is_score(&self) -> bool {
        matches!(
            self,
            Strategy::Score | Strategy::ScoreRb | Strategy::ScoreKl | Strategy::ScoreEntropy
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Strategy::Reparam => "reparam",
            Strategy::ReparamKl => "reparam-kl",
            Strategy::ReparamEntropy => "reparam-entropy",
            Strategy::Score => "score",
            Strategy::ScoreRb => "score-rb",
            Strategy::ScoreKl => "score-kl",
            Strategy::ScoreEntropy => "score-entropy",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Score-function gradients are needed unless every approximation is
/// continuous and reparameterisable, or when explicitly forced.
pub fn use_score(latent_vars: &LatentVars, force_score: bool) -> bool {
    force_score
        || !latent_vars
            .values()
            .all(|qz| qz.is_reparameterized() && qz.is_continuous())
}

/// Whether a closed-form KL(q || p) is available.
///
/// Every approximation must be normal. A graph model additionally needs
/// normal priors; a model wrapper needs a separate likelihood, its prior
/// then being taken as N(0, 1).
pub fn is_analytic_kl(latent_vars: &LatentVars, model_wrapper: Option<&dyn ModelWrapper>) -> bool {
    let q_normal = latent_vars.values().all(|qz| qz.family() == Family::Normal);
    let p_ok = match model_wrapper {
        Some(model) => model.has_log_lik(),
        None => latent_vars.keys().all(|z| z.family() == Family::Normal),
    };
    q_normal && p_ok
}

/// Pick a strategy from the selector flags.
///
/// | use_score | is_analytic_kl | strategy |
/// |---|---|---|
/// | false | true | `ReparamKl` |
/// | false | false | `Reparam` |
/// | true | true | `ScoreKl` |
/// | true | false | `ScoreRb` |
///
/// Analytic-entropy strategies are never picked here; they converge
/// poorly and are reached only by name.
pub fn dispatch(use_score: bool, is_analytic_kl: bool) -> Strategy {
    match (use_score, is_analytic_kl) {
        (false, true) => Strategy::ReparamKl,
        (false, false) => Strategy::Reparam,
        (true, true) => Strategy::ScoreKl,
        (true, false) => Strategy::ScoreRb,
    }
}

/// [`dispatch`] for a concrete model. Without a graph there is nothing
/// to Rao-Blackwellise over, so a wrapped model gets the plain score
/// estimator instead.
pub fn dispatch_for(use_score: bool, is_analytic_kl: bool, has_model_wrapper: bool) -> Strategy {
    match dispatch(use_score, is_analytic_kl) {
        Strategy::ScoreRb if has_model_wrapper => Strategy::Score,
        strategy => strategy,
    }
}
