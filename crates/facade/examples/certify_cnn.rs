use ndarray::{Array, IxDyn};
use pixeldp::{
    aggregate_draws, build_model, certified_accuracy, certify, CertificationParams, Cnn, Hps,
    Mode, NoiseKey, NoiseState, Tensor,
};
use tracing_subscriber::EnvFilter;

const HPS_JSON: &str = r#"{
    "n_draws": 16,
    "num_classes": 10,
    "sensitivity_norm": "l2",
    "sensitivity_control_scheme": "bound",
    "layer_sensitivity_bounds": [1.0],
    "noise_after_n_layers": 1,
    "attack_norm_bound": 0.1,
    "dp_epsilon": 1.0,
    "dp_delta": 0.05
}"#;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let hps: Hps = serde_json::from_str(HPS_JSON)?;
    let arch = Cnn::default().with_dense_units(128);
    let model = build_model(hps.clone(), &arch, [32, 32, 3], NoiseKey::new(0))?;

    let batch = 4;
    let images: Tensor = Array::from_shape_fn(IxDyn(&[batch, 32, 32, 3]), |ix| {
        (((ix[0] + ix[1] * 3 + ix[2] * 5 + ix[3]) % 17) as f64 / 17.0) as _
    });
    let mut labels = Tensor::zeros(IxDyn(&[batch, hps.num_classes]));
    for b in 0..batch {
        labels[[b, b % hps.num_classes]] = 1.0;
    }

    let state = NoiseState::new(NoiseKey::new(7));
    let train = model.forward(&images, &labels, Mode::Train, state)?;
    println!(
        "cost {:.4} (xent {:.4}, decay {:.6}), noise scale {:.4}",
        train.cost, train.xent, train.decay, train.calibration.scale
    );

    let pred = model.predict(&images, train.state)?;
    let summary = aggregate_draws(&pred.predictions, batch)?;
    let certs = certify(&summary, &CertificationParams::from_hps(&hps))?;
    for (b, cert) in certs.iter().enumerate() {
        println!(
            "example {b}: label {} p_lower {:.3} p_upper {:.3} robust to {:.4}",
            cert.label, cert.p_lower, cert.p_upper, cert.robustness_size
        );
    }
    let truth: Vec<usize> = (0..batch).map(|b| b % hps.num_classes).collect();
    println!(
        "certified accuracy at 0.01: {:.2}",
        certified_accuracy(&certs, &truth, 0.01)?
    );
    Ok(())
}
