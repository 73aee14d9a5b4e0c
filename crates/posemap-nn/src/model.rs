//! Confidence-map network zoo.
//!
//! Three architectures regress per-keypoint confidence maps at input
//! resolution: a plain encoder–decoder CNN, an hourglass with skip
//! additions and a two-stack hourglass whose stages are both supervised.
//! Every net is built from a [`ModelConfig`] so a run folder can rebuild
//! its network for prediction from `model.json` alone.

use std::path::Path;

use candle_core::Tensor;
use candle_nn::{
    conv2d, conv_transpose2d, Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig,
    Module, VarBuilder,
};

use crate::error::{Error, Result};

/// Network architecture selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetKind {
    EncDec,
    Hourglass,
    StackedHourglass,
}

impl NetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetKind::EncDec => "enc_dec",
            NetKind::Hourglass => "hourglass",
            NetKind::StackedHourglass => "stacked_hourglass",
        }
    }
}

impl std::fmt::Display for NetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NetKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "enc_dec" => Ok(Self::EncDec),
            "hourglass" => Ok(Self::Hourglass),
            "stacked_hourglass" => Ok(Self::StackedHourglass),
            other => Err(Error::Config(format!(
                "unknown net '{other}' (expected enc_dec, hourglass or stacked_hourglass)"
            ))),
        }
    }
}

/// Name of the serialized config inside a run folder.
pub const MODEL_CONFIG_FILE: &str = "model.json";

/// Everything needed to rebuild a network graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ModelConfig {
    pub net: NetKind,
    pub in_channels: usize,
    /// One confidence-map channel per tracked body part.
    pub out_channels: usize,
    /// Baseline filter count; intermediate layers use multiples of it.
    pub filters: usize,
    /// Nearest-neighbor upsampling instead of learned transposed convs.
    pub upsampling_layers: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            net: NetKind::EncDec,
            in_channels: 1,
            out_channels: 1,
            filters: 64,
            upsampling_layers: false,
        }
    }
}

impl ModelConfig {
    /// Write `model.json` into a run folder.
    pub fn save(&self, run_path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(run_path.join(MODEL_CONFIG_FILE), json)?;
        Ok(())
    }

    /// Read `model.json` from a run folder.
    pub fn load(run_path: &Path) -> Result<Self> {
        let path = run_path.join(MODEL_CONFIG_FILE);
        let json = std::fs::read_to_string(&path).map_err(|e| {
            Error::Config(format!("cannot read model config {}: {e}", path.display()))
        })?;
        Ok(serde_json::from_str(&json)?)
    }
}

/// Forward-pass result: one map stack, or one per supervised stage.
#[derive(Debug, Clone)]
pub enum ModelOutput {
    Single(Tensor),
    /// Ordered stage outputs; constructed non-empty.
    Multi(Vec<Tensor>),
}

impl ModelOutput {
    /// The tensor downstream consumers read; for staged nets this is the
    /// final stage.
    pub fn last(&self) -> &Tensor {
        match self {
            ModelOutput::Single(t) => t,
            ModelOutput::Multi(v) => v.last().expect("Multi output is never empty"),
        }
    }

    /// Every supervised output, in stage order.
    pub fn all(&self) -> Vec<&Tensor> {
        match self {
            ModelOutput::Single(t) => vec![t],
            ModelOutput::Multi(v) => v.iter().collect(),
        }
    }
}

fn conv3(in_c: usize, out_c: usize, vb: VarBuilder) -> Result<Conv2d> {
    let cfg = Conv2dConfig {
        padding: 1,
        ..Default::default()
    };
    Ok(conv2d(in_c, out_c, 3, cfg, vb)?)
}

fn conv1(in_c: usize, out_c: usize, vb: VarBuilder) -> Result<Conv2d> {
    Ok(conv2d(in_c, out_c, 1, Conv2dConfig::default(), vb)?)
}

/// k3 s2 transposed conv; doubles the spatial size exactly.
fn convt(in_c: usize, out_c: usize, vb: VarBuilder) -> Result<ConvTranspose2d> {
    let cfg = ConvTranspose2dConfig {
        padding: 1,
        output_padding: 1,
        stride: 2,
        dilation: 1,
    };
    Ok(conv_transpose2d(in_c, out_c, 3, cfg, vb)?)
}

fn upsample2x(x: &Tensor) -> Result<Tensor> {
    let (_, _, h, w) = x.dims4()?;
    Ok(x.upsample_nearest2d(h * 2, w * 2)?)
}

/// Residual bottleneck: 1x1 squeeze, 3x3, 1x1 expand (all relu), plus a
/// 1x1 projection skip when the channel counts differ.
struct Bottleneck {
    squeeze: Conv2d,
    conv: Conv2d,
    expand: Conv2d,
    skip: Option<Conv2d>,
}

impl Bottleneck {
    fn new(in_c: usize, out_c: usize, vb: VarBuilder) -> Result<Self> {
        let mid = (out_c / 2).max(1);
        let skip = if in_c != out_c {
            Some(conv1(in_c, out_c, vb.pp("skip"))?)
        } else {
            None
        };
        Ok(Self {
            squeeze: conv1(in_c, mid, vb.pp("squeeze"))?,
            conv: conv3(mid, mid, vb.pp("conv"))?,
            expand: conv1(mid, out_c, vb.pp("expand"))?,
            skip,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let y = self.squeeze.forward(x)?.relu()?;
        let y = self.conv.forward(&y)?.relu()?;
        let y = self.expand.forward(&y)?.relu()?;
        let residual = match &self.skip {
            Some(proj) => proj.forward(x)?.relu()?,
            None => x.clone(),
        };
        Ok((y + residual)?)
    }
}

/// Doubling step inside a decoder: learned transposed conv (relu) or
/// parameter-free nearest upsampling.
enum Up {
    Learned(ConvTranspose2d),
    Nearest,
}

impl Up {
    fn new(learned: bool, in_c: usize, out_c: usize, vb: VarBuilder) -> Result<Self> {
        if learned {
            Ok(Up::Learned(convt(in_c, out_c, vb)?))
        } else {
            Ok(Up::Nearest)
        }
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Up::Learned(c) => Ok(c.forward(x)?.relu()?),
            Up::Nearest => upsample2x(x),
        }
    }

    /// Channel count leaving this step given its input channels.
    fn out_channels(&self, in_c: usize, out_c: usize) -> usize {
        match self {
            Up::Learned(_) => out_c,
            Up::Nearest => in_c,
        }
    }
}

/// Plain encoder–decoder CNN: three conv blocks with two poolings down,
/// two doubling steps back up, linear map head.
pub struct EncDec {
    enc1: Vec<Conv2d>,
    enc2: Vec<Conv2d>,
    enc3: Vec<Conv2d>,
    up1: Up,
    dec: Vec<Conv2d>,
    /// Final doubling to map resolution; linear activation either way.
    head: Head,
}

enum Head {
    Learned(ConvTranspose2d),
    Nearest(Conv2d),
}

impl EncDec {
    pub fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let f = cfg.filters;
        let mut enc1 = Vec::with_capacity(3);
        let mut enc2 = Vec::with_capacity(3);
        let mut enc3 = Vec::with_capacity(3);
        for i in 0..3 {
            let in1 = if i == 0 { cfg.in_channels } else { f };
            enc1.push(conv3(in1, f, vb.pp(format!("enc1_{i}")))?);
            let in2 = if i == 0 { f } else { f * 2 };
            enc2.push(conv3(in2, f * 2, vb.pp(format!("enc2_{i}")))?);
            let in3 = if i == 0 { f * 2 } else { f * 4 };
            enc3.push(conv3(in3, f * 4, vb.pp(format!("enc3_{i}")))?);
        }

        let up1 = Up::new(!cfg.upsampling_layers, f * 4, f * 2, vb.pp("up1"))?;
        let dec_in = up1.out_channels(f * 4, f * 2);
        let dec = vec![
            conv3(dec_in, f * 2, vb.pp("dec_0"))?,
            conv3(f * 2, f * 2, vb.pp("dec_1"))?,
        ];
        let head = if cfg.upsampling_layers {
            Head::Nearest(conv3(f * 2, cfg.out_channels, vb.pp("head"))?)
        } else {
            Head::Learned(convt(f * 2, cfg.out_channels, vb.pp("head"))?)
        };
        Ok(Self {
            enc1,
            enc2,
            enc3,
            up1,
            dec,
            head,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut x = x.clone();
        for c in &self.enc1 {
            x = c.forward(&x)?.relu()?;
        }
        x = x.max_pool2d(2)?;
        for c in &self.enc2 {
            x = c.forward(&x)?.relu()?;
        }
        x = x.max_pool2d(2)?;
        for c in &self.enc3 {
            x = c.forward(&x)?.relu()?;
        }
        x = self.up1.forward(&x)?;
        for c in &self.dec {
            x = c.forward(&x)?.relu()?;
        }
        match &self.head {
            Head::Learned(c) => Ok(c.forward(&x)?),
            Head::Nearest(c) => Ok(c.forward(&upsample2x(&x)?)?),
        }
    }
}

/// Shared hourglass body: four pooled bottleneck levels down, four
/// skip-added doubling levels up. Operates at a fixed channel width.
struct HourglassCore {
    down: Vec<Bottleneck>,
    mid: Bottleneck,
    up: Vec<(Up, Bottleneck)>,
}

const HOURGLASS_LEVELS: usize = 4;

impl HourglassCore {
    fn new(filters: usize, upsampling_layers: bool, vb: VarBuilder) -> Result<Self> {
        let mut down = Vec::with_capacity(HOURGLASS_LEVELS);
        let mut up = Vec::with_capacity(HOURGLASS_LEVELS);
        for i in 0..HOURGLASS_LEVELS {
            down.push(Bottleneck::new(filters, filters, vb.pp(format!("down_{i}")))?);
            up.push((
                Up::new(!upsampling_layers, filters, filters, vb.pp(format!("up_{i}")))?,
                Bottleneck::new(filters, filters, vb.pp(format!("up_bn_{i}")))?,
            ));
        }
        Ok(Self {
            down,
            mid: Bottleneck::new(filters, filters, vb.pp("mid"))?,
            up,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut x = x.clone();
        let mut skips = Vec::with_capacity(self.down.len());
        for b in &self.down {
            x = b.forward(&x)?;
            skips.push(x.clone());
            x = x.max_pool2d(2)?;
        }
        x = self.mid.forward(&x)?;
        for ((up, bn), skip) in self.up.iter().zip(skips.into_iter().rev()) {
            x = up.forward(&x)?;
            x = (x + skip)?;
            x = bn.forward(&x)?;
        }
        Ok(x)
    }
}

/// 7x7 stem into a bottleneck that widens to the working filter count.
struct Stem {
    conv: Conv2d,
    widen: Bottleneck,
}

impl Stem {
    fn new(in_c: usize, filters: usize, vb: VarBuilder) -> Result<Self> {
        let half = (filters / 2).max(1);
        let cfg = Conv2dConfig {
            padding: 3,
            ..Default::default()
        };
        Ok(Self {
            conv: conv2d(in_c, half, 7, cfg, vb.pp("conv"))?,
            widen: Bottleneck::new(half, filters, vb.pp("widen"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.widen.forward(&self.conv.forward(x)?.relu()?)
    }
}

/// Single-stage hourglass with a linear 3x3 head.
pub struct Hourglass {
    stem: Stem,
    core: HourglassCore,
    head: Conv2d,
}

impl Hourglass {
    pub fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            stem: Stem::new(cfg.in_channels, cfg.filters, vb.pp("stem"))?,
            core: HourglassCore::new(cfg.filters, cfg.upsampling_layers, vb.pp("core"))?,
            head: conv3(cfg.filters, cfg.out_channels, vb.pp("head"))?,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.stem.forward(x)?;
        let x = self.core.forward(&x)?;
        Ok(self.head.forward(&x)?)
    }
}

/// Two hourglass stages with intermediate supervision: each stage emits
/// a map head; training supervises both, inference reads the last.
pub struct StackedHourglass {
    stem: Stem,
    stage1: HourglassCore,
    head1: Conv2d,
    stage2: HourglassCore,
    head2: Conv2d,
}

impl StackedHourglass {
    pub fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            stem: Stem::new(cfg.in_channels, cfg.filters, vb.pp("stem"))?,
            stage1: HourglassCore::new(cfg.filters, cfg.upsampling_layers, vb.pp("stage1"))?,
            head1: conv3(cfg.filters, cfg.out_channels, vb.pp("head1"))?,
            stage2: HourglassCore::new(cfg.filters, cfg.upsampling_layers, vb.pp("stage2"))?,
            head2: conv3(cfg.filters, cfg.out_channels, vb.pp("head2"))?,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Vec<Tensor>> {
        let x = self.stem.forward(x)?;
        let f1 = self.stage1.forward(&x)?;
        let out1 = self.head1.forward(&f1)?;
        let f2 = self.stage2.forward(&f1)?;
        let out2 = self.head2.forward(&f2)?;
        Ok(vec![out1, out2])
    }
}

/// A constructed network of any supported kind.
pub enum PoseNet {
    EncDec(EncDec),
    Hourglass(Hourglass),
    StackedHourglass(StackedHourglass),
}

impl PoseNet {
    pub fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        if cfg.filters == 0 || cfg.in_channels == 0 || cfg.out_channels == 0 {
            return Err(Error::Config(
                "model config requires non-zero filters and channel counts".into(),
            ));
        }
        match cfg.net {
            NetKind::EncDec => Ok(Self::EncDec(EncDec::new(cfg, vb)?)),
            NetKind::Hourglass => Ok(Self::Hourglass(Hourglass::new(cfg, vb)?)),
            NetKind::StackedHourglass => {
                Ok(Self::StackedHourglass(StackedHourglass::new(cfg, vb)?))
            }
        }
    }

    pub fn forward(&self, x: &Tensor) -> Result<ModelOutput> {
        match self {
            PoseNet::EncDec(m) => Ok(ModelOutput::Single(m.forward(x)?)),
            PoseNet::Hourglass(m) => Ok(ModelOutput::Single(m.forward(x)?)),
            PoseNet::StackedHourglass(m) => Ok(ModelOutput::Multi(m.forward(x)?)),
        }
    }
}
