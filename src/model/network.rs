//! Compact VGG-style super-resolution network
//!
//! A plain stack of 3x3 convolutions with activations, a pixel shuffle to the
//! internal upscale factor, and a nearest-neighbour skip connection from the
//! input. Layer names follow the published weights (`body.N.weight`).

use crate::config::NetworkConfig;
use crate::error::UpscaleError;
use candle_core::{Module, Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, VarBuilder};
use std::str::FromStr;

/// Activation used after every hidden convolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationKind {
    /// Per-channel learned negative slope
    PRelu,
    /// `max(0, x)`
    Relu,
    /// Fixed negative slope of 0.1
    LeakyRelu,
}

impl FromStr for ActivationKind {
    type Err = UpscaleError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "prelu" => Ok(Self::PRelu),
            "relu" => Ok(Self::Relu),
            "leakyrelu" => Ok(Self::LeakyRelu),
            other => Err(UpscaleError::InvalidNetwork(format!(
                "unknown activation type {other:?}"
            ))),
        }
    }
}

/// Validated architecture description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSpec {
    /// Image channels in and out (the skip connection needs them equal)
    pub channels: usize,
    /// Hidden feature channels
    pub num_feat: usize,
    /// Hidden convolutions between the first and last layer
    pub num_conv: usize,
    /// Internal upscale factor
    pub upscale: usize,
    /// Hidden activation
    pub activation: ActivationKind,
}

impl NetworkSpec {
    /// Index of the final convolution in `body`
    #[must_use]
    pub const fn last_conv_index(&self) -> usize {
        2 + 2 * self.num_conv
    }
}

impl TryFrom<&NetworkConfig> for NetworkSpec {
    type Error = UpscaleError;

    fn try_from(cfg: &NetworkConfig) -> std::result::Result<Self, Self::Error> {
        if cfg.num_in_ch == 0 || cfg.num_feat == 0 || cfg.upscale == 0 {
            return Err(UpscaleError::InvalidNetwork(
                "channel counts and upscale must be > 0".to_owned(),
            ));
        }
        if cfg.num_in_ch != cfg.num_out_ch {
            return Err(UpscaleError::InvalidNetwork(format!(
                "input channels ({}) must equal output channels ({})",
                cfg.num_in_ch, cfg.num_out_ch
            )));
        }

        Ok(Self {
            channels: cfg.num_in_ch,
            num_feat: cfg.num_feat,
            num_conv: cfg.num_conv,
            upscale: cfg.upscale,
            activation: cfg.act_type.parse()?,
        })
    }
}

enum Activation {
    PRelu(Tensor),
    Relu,
    LeakyRelu,
}

impl Activation {
    fn load(kind: ActivationKind, num_feat: usize, vb: VarBuilder) -> Result<Self> {
        Ok(match kind {
            ActivationKind::PRelu => Self::PRelu(vb.get(num_feat, "weight")?),
            ActivationKind::Relu => Self::Relu,
            ActivationKind::LeakyRelu => Self::LeakyRelu,
        })
    }
}

impl Module for Activation {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Self::PRelu(weight) => {
                let slope = weight.reshape((1, weight.dim(0)?, 1, 1))?;
                xs.relu()? + xs.minimum(0.0)?.broadcast_mul(&slope)?
            }
            Self::Relu => xs.relu(),
            Self::LeakyRelu => candle_nn::ops::leaky_relu(xs, 0.1),
        }
    }
}

/// Loaded network, ready for inference on `(N, C, H, W)` tensors in `[0, 1]`
pub struct CompactNet {
    hidden: Vec<(Conv2d, Activation)>,
    last: Conv2d,
    upscale: usize,
}

impl CompactNet {
    /// Builds the layers from `vb`, which must hold the `body.N` tensors
    ///
    /// # Errors
    /// Returns error if a tensor is missing or has the wrong shape
    pub fn load(spec: &NetworkSpec, vb: VarBuilder) -> Result<Self> {
        let conv_cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let body = vb.pp("body");

        let mut hidden = Vec::with_capacity(spec.num_conv + 1);
        let mut in_ch = spec.channels;
        for layer in 0..=spec.num_conv {
            let conv = candle_nn::conv2d(in_ch, spec.num_feat, 3, conv_cfg, body.pp(2 * layer))?;
            let act = Activation::load(spec.activation, spec.num_feat, body.pp(2 * layer + 1))?;
            hidden.push((conv, act));
            in_ch = spec.num_feat;
        }

        let out_ch = spec.channels * spec.upscale * spec.upscale;
        let last = candle_nn::conv2d(
            spec.num_feat,
            out_ch,
            3,
            conv_cfg,
            body.pp(spec.last_conv_index()),
        )?;

        Ok(Self {
            hidden,
            last,
            upscale: spec.upscale,
        })
    }
}

impl Module for CompactNet {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (_, _, h, w) = xs.dims4()?;

        let mut out = xs.clone();
        for (conv, act) in &self.hidden {
            out = act.forward(&conv.forward(&out)?)?;
        }
        let out = self.last.forward(&out)?;
        let out = candle_nn::ops::pixel_shuffle(&out, self.upscale)?;

        // The network learns the residual over a nearest-neighbour upscale
        let base = xs.upsample_nearest2d(h * self.upscale, w * self.upscale)?;
        out + base
    }
}

/// State dict with every convolution zeroed, so the network reduces to its
/// nearest-neighbour skip connection
#[cfg(test)]
pub(crate) fn zero_state_dict(
    spec: &NetworkSpec,
    dev: &candle_core::Device,
) -> Result<std::collections::HashMap<String, Tensor>> {
    use candle_core::DType;

    let mut tensors = std::collections::HashMap::new();
    let mut in_ch = spec.channels;
    for layer in 0..=spec.num_conv {
        let conv = 2 * layer;
        tensors.insert(
            format!("body.{conv}.weight"),
            Tensor::zeros((spec.num_feat, in_ch, 3, 3), DType::F32, dev)?,
        );
        tensors.insert(
            format!("body.{conv}.bias"),
            Tensor::zeros(spec.num_feat, DType::F32, dev)?,
        );
        tensors.insert(
            format!("body.{}.weight", conv + 1),
            Tensor::full(0.25_f32, spec.num_feat, dev)?,
        );
        in_ch = spec.num_feat;
    }
    let out_ch = spec.channels * spec.upscale * spec.upscale;
    let last = spec.last_conv_index();
    tensors.insert(
        format!("body.{last}.weight"),
        Tensor::zeros((out_ch, spec.num_feat, 3, 3), DType::F32, dev)?,
    );
    tensors.insert(
        format!("body.{last}.bias"),
        Tensor::zeros(out_ch, DType::F32, dev)?,
    );
    Ok(tensors)
}
