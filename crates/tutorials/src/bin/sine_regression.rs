//! Walkthrough: train a Gaussian process on noisy sine observations, then report
//! the posterior mean with its confidence region and a few posterior trajectories.

use anyhow::Result;
use clap::Parser;
use env_logger::{Builder, Env};
use linfa::prelude::{Dataset, Fit};
use log::info;
use ndarray::{Array, Axis};
use ndarray_npy::write_npy;
use ndarray_rand::rand::SeedableRng;
use ndarray_rand::rand_distr::Normal;
use ndarray_rand::RandomExt;
use rand_xoshiro::Xoshiro256Plus;
use surmise_gp::{ExactGp, Optimizer};

const PI: f64 = std::f64::consts::PI;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of training points
    #[arg(short, long, default_value_t = 100)]
    n_train: usize,
    /// Number of training iterations
    #[arg(short, long, default_value_t = 50)]
    iters: usize,
    /// Learning rate of the Adam optimizer
    #[arg(short, long, default_value_t = 0.1)]
    lr: f64,
    /// Random seed
    #[arg(short, long, default_value_t = 42)]
    seed: u64,
    /// Output directory for npy artifacts
    #[arg(short, long, default_value = "target/tutorials/sine")]
    outdir: String,
}

fn main() -> Result<()> {
    let env = Env::new().filter_or("SURMISE_LOG", "info");
    let mut builder = Builder::from_env(env);
    let builder = builder.target(env_logger::Target::Stdout);
    builder.try_init().ok();

    let args = Args::parse();

    // Training data: y = sin(2.pi.x) observed with gaussian noise
    let mut rng = Xoshiro256Plus::seed_from_u64(args.seed);
    let xt = Array::linspace(0., 1., args.n_train).insert_axis(Axis(1));
    let noise =
        Array::<f64, _>::random_using((args.n_train, 1), Normal::new(0., 0.2).unwrap(), &mut rng);
    let yt = (xt.mapv(|x| (2. * PI * x).sin()) + noise).remove_axis(Axis(1));

    let gp = ExactGp::<f64>::params()
        .optimizer(Optimizer::Adam {
            learning_rate: args.lr,
        })
        .n_iters(args.iters)
        .seed(Some(args.seed))
        .fit(&Dataset::new(xt.to_owned(), yt.to_owned()))?;

    for (i, loss) in gp.loss_history().iter().enumerate() {
        println!("Iter {:>3}/{} - Loss: {:.3}", i + 1, args.iters, loss);
    }

    println!("Trained hyperparameters:");
    println!("  lengthscale    = {:.4}", gp.lengthscales()[0]);
    println!("  outputscale    = {:.4}", gp.outputscale());
    println!("  noise variance = {:.5}", gp.noise_variance());
    println!("  avg log marginal likelihood = {:.4}", gp.likelihood());

    let xtest = Array::linspace(0., 1., 51).insert_axis(Axis(1));
    let mean = gp.predict(&xtest)?;
    let (lower, upper) = gp.confidence_region(&xtest)?;
    let trajectories = gp.sample(&xtest, 5)?;

    println!();
    println!("{:>6} {:>9} {:>9} {:>9}", "x", "mean", "lower", "upper");
    for i in (0..xtest.nrows()).step_by(5) {
        println!(
            "{:>6.2} {:>9.4} {:>9.4} {:>9.4}",
            xtest[[i, 0]],
            mean[i],
            lower[i],
            upper[i]
        );
    }

    std::fs::create_dir_all(&args.outdir)?;
    write_npy(format!("{}/xtrain.npy", args.outdir), &xt)?;
    write_npy(format!("{}/ytrain.npy", args.outdir), &yt)?;
    write_npy(format!("{}/xtest.npy", args.outdir), &xtest)?;
    write_npy(format!("{}/mean.npy", args.outdir), &mean)?;
    write_npy(format!("{}/lower.npy", args.outdir), &lower)?;
    write_npy(format!("{}/upper.npy", args.outdir), &upper)?;
    write_npy(format!("{}/trajectories.npy", args.outdir), &trajectories)?;
    info!("artifacts saved in {}", args.outdir);

    Ok(())
}
