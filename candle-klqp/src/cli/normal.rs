use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::{Optimizer, VarBuilder, VarMap};
use clap::{Args, ValueEnum};
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::Distribution as _;

use crate::klqp::{
    Data, Distribution, Family, FixedKLqp, KLqp, KLqpConfig, KLqpInference, LatentVars,
    ObjectiveBuilder, RandomVariable, ReparamEntropyLoss, ReparamKlLoss, ReparamLoss,
    ScoreEntropyLoss, ScoreKlLoss, ScoreLoss, ScoreRbLoss,
};

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum Estimator {
    /// Pick from the model and the approximation
    Auto,
    Reparam,
    ReparamKl,
    ReparamEntropy,
    Score,
    ScoreRb,
    ScoreKl,
    ScoreEntropy,
}

#[derive(Args, Debug)]
pub struct NormalArgs {
    #[arg(long, default_value = "50", help = "Number of simulated observations")]
    pub num_obs: usize,

    #[arg(long, default_value = "1.5", help = "Mean the data are simulated from")]
    pub true_loc: f64,

    #[arg(long, default_value = "1.0", help = "Prior std τ of the mean")]
    pub prior_scale: f64,

    #[arg(long, default_value = "1.0", help = "Known observation noise σ")]
    pub noise_scale: f64,

    #[arg(short, long, value_enum, default_value = "auto")]
    pub estimator: Estimator,

    #[arg(long, help = "Use score-function gradients under --estimator auto")]
    pub force_score: bool,

    #[arg(long, default_value = "10")]
    pub samples: usize,

    #[arg(long, default_value = "1000")]
    pub iters: usize,

    #[arg(long, default_value = "0.05")]
    pub lr: f64,

    #[arg(long, default_value = "42")]
    pub seed: u64,

    #[arg(long)]
    pub gpu: bool,

    #[arg(short, long)]
    pub verbose: bool,
}

/// Exact posterior N(m, s²) of the mean
fn conjugate_posterior(x: &[f32], prior_scale: f64, noise_scale: f64) -> (f64, f64) {
    let sum: f64 = x.iter().map(|&v| v as f64).sum();
    let precision = 1.0 / prior_scale.powi(2) + x.len() as f64 / noise_scale.powi(2);
    let mean = sum / noise_scale.powi(2) / precision;
    (mean, (1.0 / precision).sqrt())
}

struct NormalModel {
    latent_vars: LatentVars,
    data: Data,
    q_loc: Tensor,
    q_ln_std: Tensor,
}

/// μ ~ N(0, τ²), x_i | μ ~ N(μ, σ²), q(μ) = N(m, exp(ln s)²)
fn build_model(args: &NormalArgs, x_obs: Tensor, vb: VarBuilder) -> Result<NormalModel> {
    let device = x_obs.device().clone();
    let zero = Tensor::zeros(1, DType::F32, &device)?;
    let tau = Tensor::new(&[args.prior_scale as f32], &device)?;
    let sigma = Tensor::new(&[args.noise_scale as f32], &device)?;

    let mu = RandomVariable::normal("mu", zero, tau);
    let x = RandomVariable::new("x", Family::Normal, vec![mu.clone()], vec![], move |pa| {
        Ok(Distribution::Normal {
            loc: pa[0].clone(),
            scale: sigma.clone(),
        })
    });

    let q_vb = vb.pp("q_mu");
    let q_mu = RandomVariable::normal_variational(q_vb.clone(), "q_mu", 1)?;
    let q_loc = q_vb.get(1, "mean")?;
    let q_ln_std = q_vb.get(1, "ln_std")?;

    Ok(NormalModel {
        latent_vars: LatentVars::from_pairs([(mu, q_mu)])?,
        data: Data::new().with_observed(x, x_obs)?,
        q_loc,
        q_ln_std,
    })
}

fn train<K: KLqpInference>(
    session: &K,
    varmap: &VarMap,
    model: &NormalModel,
    args: &NormalArgs,
) -> Result<()> {
    let vars = varmap.all_vars();
    let mut optimizer = candle_nn::AdamW::new_lr(vars.clone(), args.lr)?;

    info!("Training with {} for {} iterations", session.strategy()?, args.iters);

    let pb = ProgressBar::new(args.iters as u64);
    if args.verbose {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    }

    for i in 0..args.iters {
        let objective = session.build_loss_and_gradients(&vars)?;
        optimizer.step(&objective.to_grad_store()?)?;

        if args.verbose && (i % 50 == 0 || i == args.iters - 1) {
            info!(
                "iter {:4}: loss = {:10.4}, q mean = {:8.4}, q std = {:8.4}",
                i,
                objective.loss_value()?,
                model.q_loc.get(0)?.to_scalar::<f32>()?,
                model.q_ln_std.exp()?.get(0)?.to_scalar::<f32>()?
            );
        }
        pb.inc(1);
    }
    pb.finish_and_clear();
    Ok(())
}

fn fixed<B: ObjectiveBuilder + Default>(
    model: &NormalModel,
    n_samples: usize,
) -> Result<FixedKLqp<B>> {
    let mut session = FixedKLqp::<B>::new(model.latent_vars.clone(), model.data.clone())?;
    session.initialize(n_samples)?;
    Ok(session)
}

pub fn run(args: &NormalArgs) -> Result<()> {
    if args.num_obs == 0 {
        anyhow::bail!("--num-obs must be positive");
    }
    if args.iters == 0 {
        anyhow::bail!("--iters must be positive");
    }

    let device = if args.gpu {
        #[cfg(target_os = "macos")]
        { Device::new_metal(0).unwrap_or(Device::Cpu) }
        #[cfg(target_os = "linux")]
        { Device::new_cuda(0).unwrap_or(Device::Cpu) }
        #[cfg(not(any(target_os = "macos", target_os = "linux")))]
        { Device::Cpu }
    } else {
        Device::Cpu
    };
    info!("Using device: {:?}", device);

    let mut rng = StdRng::seed_from_u64(args.seed);
    let noise = rand_distr::Normal::new(args.true_loc, args.noise_scale)?;
    let x: Vec<f32> = (0..args.num_obs)
        .map(|_| noise.sample(&mut rng) as f32)
        .collect();
    info!("Simulated {} observations around {}", x.len(), args.true_loc);

    let x_obs = Tensor::from_slice(&x, x.len(), &device)?;

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = build_model(args, x_obs, vb)?;

    let n = args.samples;
    match args.estimator {
        Estimator::Auto => {
            let mut session = KLqp::new(model.latent_vars.clone(), model.data.clone())?;
            session.initialize_with(&KLqpConfig::new(n, args.force_score))?;
            train(&session, &varmap, &model, args)?;
        }
        Estimator::Reparam => train(&fixed::<ReparamLoss>(&model, n)?, &varmap, &model, args)?,
        Estimator::ReparamKl => train(&fixed::<ReparamKlLoss>(&model, n)?, &varmap, &model, args)?,
        Estimator::ReparamEntropy => {
            train(&fixed::<ReparamEntropyLoss>(&model, n)?, &varmap, &model, args)?
        }
        Estimator::Score => train(&fixed::<ScoreLoss>(&model, n)?, &varmap, &model, args)?,
        Estimator::ScoreRb => train(&fixed::<ScoreRbLoss>(&model, n)?, &varmap, &model, args)?,
        Estimator::ScoreKl => train(&fixed::<ScoreKlLoss>(&model, n)?, &varmap, &model, args)?,
        Estimator::ScoreEntropy => {
            train(&fixed::<ScoreEntropyLoss>(&model, n)?, &varmap, &model, args)?
        }
    }

    let fitted_mean = model.q_loc.get(0)?.to_scalar::<f32>()?;
    let fitted_std = model.q_ln_std.exp()?.get(0)?.to_scalar::<f32>()?;
    let (exact_mean, exact_std) = conjugate_posterior(&x, args.prior_scale, args.noise_scale);

    info!("Fitted q(mu) = N({:.4}, {:.4}²)", fitted_mean, fitted_std);
    info!("Exact p(mu | x) = N({:.4}, {:.4}²)", exact_mean, exact_std);
    Ok(())
}
