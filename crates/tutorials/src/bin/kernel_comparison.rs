//! Walkthrough: train one Gaussian process per correlation kernel on a 1D damped
//! sine and rank the kernels with the Q2 cross validation score.

use anyhow::Result;
use clap::Parser;
use env_logger::{Builder, Env};
use linfa::prelude::{Dataset, Fit};
use log::info;
use ndarray::{Array, Array1, Array2, Axis};
use ndarray_npy::write_npy;
use ndarray_rand::rand::SeedableRng;
use ndarray_rand::rand_distr::{Normal, Uniform};
use ndarray_rand::RandomExt;
use rand_xoshiro::Xoshiro256Plus;
use surmise_gp::correlation_models::{
    AbsoluteExponentialCorr, CorrelationModel, Matern32Corr, Matern52Corr, SquaredExponentialCorr,
};
use surmise_gp::mean_models::ConstantMean;
use surmise_gp::metrics::PredictScore;
use surmise_gp::{GaussianProcess, Optimizer};

const PI: f64 = std::f64::consts::PI;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of training points
    #[arg(short, long, default_value_t = 40)]
    n_train: usize,
    /// Number of training iterations
    #[arg(short, long, default_value_t = 50)]
    iters: usize,
    /// Learning rate of the Adam optimizer
    #[arg(short, long, default_value_t = 0.1)]
    lr: f64,
    /// Random seed
    #[arg(short, long, default_value_t = 0)]
    seed: u64,
    /// Output directory for npy artifacts
    #[arg(short, long, default_value = "target/tutorials/kernels")]
    outdir: String,
}

struct KernelReport {
    name: String,
    loss: f64,
    lengthscale: f64,
    noise: f64,
    q2: f64,
    looq2: f64,
}

fn run_kernel<Corr: CorrelationModel<f64>>(
    corr: Corr,
    xt: &Array2<f64>,
    yt: &Array1<f64>,
    xtest: &Array2<f64>,
    args: &Args,
) -> Result<KernelReport> {
    let name = format!("{corr}");
    info!("training GP with {name} kernel");
    let gp = GaussianProcess::<f64, ConstantMean, Corr>::params(ConstantMean::default(), corr)
        .optimizer(Optimizer::Adam {
            learning_rate: args.lr,
        })
        .n_iters(args.iters)
        .seed(Some(args.seed))
        .fit(&Dataset::new(xt.to_owned(), yt.to_owned()))?;

    let mean = gp.predict(xtest)?;
    let (lower, upper) = gp.confidence_region(xtest)?;
    let tag = name.to_lowercase();
    write_npy(format!("{}/mean_{}.npy", args.outdir, tag), &mean)?;
    write_npy(format!("{}/lower_{}.npy", args.outdir, tag), &lower)?;
    write_npy(format!("{}/upper_{}.npy", args.outdir, tag), &upper)?;

    Ok(KernelReport {
        loss: -gp.likelihood(),
        lengthscale: gp.lengthscales()[0],
        noise: gp.noise_variance(),
        q2: gp.q2_score(5)?,
        looq2: gp.looq2_score()?,
        name,
    })
}

fn main() -> Result<()> {
    let env = Env::new().filter_or("SURMISE_LOG", "info");
    let mut builder = Builder::from_env(env);
    let builder = builder.target(env_logger::Target::Stdout);
    builder.try_init().ok();

    let args = Args::parse();

    // Training data: y = x.sin(4.pi.x) observed with gaussian noise
    let mut rng = Xoshiro256Plus::seed_from_u64(args.seed);
    let xt = Array::<f64, _>::random_using((args.n_train, 1), Uniform::new(0., 1.), &mut rng);
    let noise =
        Array::<f64, _>::random_using((args.n_train, 1), Normal::new(0., 0.1).unwrap(), &mut rng);
    let yt = (xt.mapv(|x| x * (4. * PI * x).sin()) + noise).remove_axis(Axis(1));
    let xtest = Array::linspace(0., 1., 101).insert_axis(Axis(1));

    std::fs::create_dir_all(&args.outdir)?;
    write_npy(format!("{}/xtrain.npy", args.outdir), &xt)?;
    write_npy(format!("{}/ytrain.npy", args.outdir), &yt)?;
    write_npy(format!("{}/xtest.npy", args.outdir), &xtest)?;

    let reports = vec![
        run_kernel(SquaredExponentialCorr::default(), &xt, &yt, &xtest, &args)?,
        run_kernel(AbsoluteExponentialCorr::default(), &xt, &yt, &xtest, &args)?,
        run_kernel(Matern32Corr::default(), &xt, &yt, &xtest, &args)?,
        run_kernel(Matern52Corr::default(), &xt, &yt, &xtest, &args)?,
    ];

    println!(
        "{:<20} {:>9} {:>12} {:>10} {:>8} {:>8}",
        "kernel", "loss", "lengthscale", "noise", "Q2", "LOO-Q2"
    );
    for r in &reports {
        println!(
            "{:<20} {:>9.4} {:>12.4} {:>10.5} {:>8.4} {:>8.4}",
            r.name, r.loss, r.lengthscale, r.noise, r.q2, r.looq2
        );
    }

    let best = reports
        .iter()
        .max_by(|a, b| a.q2.partial_cmp(&b.q2).expect("comparable Q2 scores"))
        .expect("non empty reports");
    println!();
    println!("Best kernel by Q2: {} (Q2 = {:.4})", best.name, best.q2);

    Ok(())
}
