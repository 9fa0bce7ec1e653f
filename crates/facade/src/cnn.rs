//! Two-conv CNN with noise insertion points on the image and after each conv.

use pixeldp_core::{Hps, Result};

use crate::plan::{
    pre_noise_index, push_activation_and_noise, push_noise_site, Architecture, BuildStep,
};

/// Shape of one convolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConvSpec {
    /// Square filter size.
    pub filter_size: usize,
    /// Output channels.
    pub out_filters: usize,
    /// Stride.
    pub stride: usize,
}

/// `conv(5x5, 32, /2) -> conv(5x5, 64, /2) -> dense(1024) -> logits`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cnn {
    /// First convolution (scope `init/init_conv`).
    pub conv1: ConvSpec,
    /// Second convolution (scope `conv2`).
    pub conv2: ConvSpec,
    /// Width of the hidden dense layer.
    pub dense_units: usize,
}

impl Default for Cnn {
    fn default() -> Self {
        Self {
            conv1: ConvSpec {
                filter_size: 5,
                out_filters: 32,
                stride: 2,
            },
            conv2: ConvSpec {
                filter_size: 5,
                out_filters: 64,
                stride: 2,
            },
            dense_units: 1024,
        }
    }
}

impl Cnn {
    /// Override the hidden dense width.
    pub fn with_dense_units(mut self, units: usize) -> Self {
        self.dense_units = units;
        self
    }

    fn conv(scope: &str, spec: ConvSpec, pre_noise: Option<usize>) -> BuildStep {
        BuildStep::Conv {
            scope: scope.to_string(),
            filter_size: spec.filter_size,
            out_filters: spec.out_filters,
            stride: spec.stride,
            pre_noise,
        }
    }
}

impl Architecture for Cnn {
    fn name(&self) -> &str {
        "cnn"
    }

    fn body(&self, hps: &Hps) -> Result<Vec<BuildStep>> {
        let mut steps = Vec::new();
        push_noise_site(&mut steps, hps, 0);

        steps.push(Self::conv("init/init_conv", self.conv1, pre_noise_index(hps, 0)));
        push_activation_and_noise(&mut steps, hps, 1);

        steps.push(Self::conv("conv2", self.conv2, pre_noise_index(hps, 1)));
        push_activation_and_noise(&mut steps, hps, 2);

        steps.push(BuildStep::Dense {
            scope: "dense".into(),
            units: self.dense_units,
            pre_noise: None,
        });
        steps.push(BuildStep::Activate {
            leakiness: hps.relu_leakiness,
        });
        steps.push(BuildStep::Logits {
            scope: "logit".into(),
            num_classes: hps.num_classes,
        });
        Ok(steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::BuildPlan;

    fn describe(hps: &Hps) -> Vec<String> {
        BuildPlan::new(&Cnn::default(), hps).unwrap().describe()
    }

    #[test]
    fn noise_on_image() {
        let hps = Hps::default().with_noise_after_n_layers(0);
        assert_eq!(
            describe(&hps),
            vec![
                "duplicate-inputs x1",
                "noise@0",
                "conv init/init_conv 5x5/32 s2",
                "leaky-relu 0.1",
                "conv conv2 5x5/64 s2",
                "leaky-relu 0.1",
                "dense dense 1024",
                "leaky-relu 0.1",
                "logits logit 10",
                "softmax",
                "duplicate-labels x1",
                "loss",
            ]
        );
    }

    #[test]
    fn noise_after_first_conv_before_activation() {
        let hps = Hps::default()
            .with_n_draws(4)
            .with_noise_after_n_layers(1)
            .with_noise_after_activation(true);
        let plan = describe(&hps);
        assert_eq!(plan[0], "duplicate-inputs x4");
        assert_eq!(plan[1], "conv init/init_conv 5x5/32 s2 [pre-noise 0]");
        assert_eq!(plan[2], "noise@1");
        assert_eq!(plan[3], "leaky-relu 0.1");
        assert_eq!(plan[4], "conv conv2 5x5/64 s2");
    }

    #[test]
    fn noise_after_second_conv() {
        let hps = Hps::default()
            .with_noise_after_n_layers(2)
            .with_layer_sensitivity_bounds(vec![1.0, 1.0]);
        let plan = BuildPlan::new(&Cnn::default(), &hps).unwrap();
        assert_eq!(plan.noise_position(), 2);
        assert_eq!(plan.pre_noise_scopes(), vec!["init/init_conv", "conv2"]);
        let d = plan.describe();
        assert_eq!(d[4], "leaky-relu 0.1");
        assert_eq!(d[5], "noise@2");
    }

    #[test]
    fn three_layers_before_noise_is_rejected() {
        let hps = Hps::default()
            .with_noise_after_n_layers(3)
            .with_layer_sensitivity_bounds(vec![1.0, 1.0, 1.0]);
        assert!(BuildPlan::new(&Cnn::default(), &hps).unwrap_err().is_config());
    }

    #[test]
    fn activation_count_is_independent_of_noise_position() {
        for n in 0..=2 {
            for flag in [false, true] {
                let hps = Hps::default()
                    .with_noise_after_n_layers(n)
                    .with_layer_sensitivity_bounds(vec![1.0, 1.0])
                    .with_noise_after_activation(flag);
                let plan = BuildPlan::new(&Cnn::default(), &hps).unwrap();
                let activations = plan
                    .steps()
                    .iter()
                    .filter(|s| matches!(s, BuildStep::Activate { .. }))
                    .count();
                assert_eq!(activations, 3);
                let noise = plan
                    .steps()
                    .iter()
                    .filter(|s| matches!(s, BuildStep::InjectNoise { .. }))
                    .count();
                assert_eq!(noise, 1);
            }
        }
    }
}
