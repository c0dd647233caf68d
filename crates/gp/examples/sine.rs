use linfa::prelude::*;
use ndarray::{Array, Axis};
use surmise_gp::ExactGp;

fn main() {
    let xtrain = Array::linspace(0., 1., 20).insert_axis(Axis(1));
    let ytrain = xtrain
        .mapv(|x| (2. * std::f64::consts::PI * x).sin())
        .remove_axis(Axis(1));

    let gp = ExactGp::<f64>::params()
        .seed(Some(42))
        .fit(&Dataset::new(xtrain, ytrain))
        .expect("GP fitting");

    let xtest = Array::linspace(0., 1., 100).insert_axis(Axis(1));
    let ytest = gp.predict(&xtest).expect("GP prediction");
    let (lower, upper) = gp.confidence_region(&xtest).expect("GP confidence region");
    println!(
        "lengthscales={} noise variance={:.5}",
        gp.lengthscales(),
        gp.noise_variance()
    );
    println!(
        "prediction at x=0.5: {:.4} in [{:.4}, {:.4}]",
        ytest[50], lower[50], upper[50]
    );
}
