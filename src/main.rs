//! Builds a small three-layer and seven-layer convnet and checks every
//! analytic parameter gradient against a numerical one.
//!
//! Run with:
//!   cargo run --release [-- path/to/config.json]
//!
//! The optional argument is a `NetworkConfig` in JSON; missing fields take
//! their defaults. Set `RUST_LOG=debug` for per-parameter detail.

use rand::{rngs::StdRng, SeedableRng};
use tracing::{info, warn};

use ferrite_cnn::gradcheck::{check_network_gradients, DEFAULT_STEP};
use ferrite_cnn::{ConvNet, NetworkConfig, Result, SevenLayerConvNet, Tensor, ThreeLayerConvNet};

/// Relative errors above this usually mean a broken backward pass.
const TOLERANCE: f64 = 1e-3;

fn demo_config() -> NetworkConfig {
    NetworkConfig {
        input_dim: (3, 8, 8),
        num_filters: 4,
        filter_size: 3,
        hidden_dim: 10,
        num_classes: 5,
        weight_scale: 1e-1,
        reg: 0.01,
    }
}

fn report<N: ConvNet<f64>>(label: &str, net: &mut N, x: &Tensor<f64>, y: &[usize]) -> Result<bool> {
    let (loss, _) = net.loss_and_grads(x, y)?;
    info!("{label}: initial loss {loss:.6}");
    let mut ok = true;
    for (name, err) in check_network_gradients(net, x, y, DEFAULT_STEP)? {
        if err < TOLERANCE {
            info!("{label}: {name} relative error {err:.3e}");
        } else {
            warn!("{label}: {name} relative error {err:.3e} exceeds {TOLERANCE:.0e}");
            ok = false;
        }
    }
    Ok(ok)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => {
            info!("Config: {path}");
            NetworkConfig::load_json(&path)?
        }
        None => demo_config(),
    };

    let mut rng = StdRng::seed_from_u64(0);
    let (c, h, w) = config.input_dim;
    let x = Tensor::<f64>::randn_with(&[2, c, h, w], 1.0, &mut rng);
    let y: Vec<usize> = (0..2).map(|i| i % config.num_classes).collect();

    let mut three = ThreeLayerConvNet::<f64>::with_rng(config.clone(), &mut rng)?;
    let mut ok = report("three-layer", &mut three, &x, &y)?;

    match SevenLayerConvNet::<f64>::with_rng(config, &mut rng) {
        Ok(mut seven) => ok &= report("seven-layer", &mut seven, &x, &y)?,
        Err(e) => warn!("seven-layer: skipped ({e})"),
    }

    if ok {
        info!("All gradients within tolerance");
    } else {
        warn!("Some gradients exceed tolerance");
    }
    Ok(())
}
