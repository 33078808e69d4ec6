//! 検出ヘッド
//!
//! 3つのスケールの特徴マップ (P3, P4, P5) から、デコード前の生の出力マップを作ります。
//! ヘッドの形は [`HeadLayout`] で選びます。

use anyhow::{ensure, Context, Result};

use crate::arena::Slots;
use crate::config::{DetectConfig, HeadLayout, NUM_ANCHORS, NUM_SCALES};
use crate::conv2d::ConvGeom;
use crate::conv_unit::{Conv2d, ConvUnit};
use crate::tensor::Shape;
use crate::weights::{WeightSpec, WeightStore};

/// デコーダに渡す1スケール分の出力 (借用)
#[derive(Debug, Clone, Copy)]
pub enum HeadOutput<'a> {
    /// `3 * (5 + nc)` チャネル。アンカーごとに x, y, w, h, obj, cls... が並ぶ
    Fused { data: &'a [f32], h: usize, w: usize },
    /// `3 * 5` チャネルのボックス/オブジェクトネスと `3 * nc` チャネルのクラス
    Split { boxes: &'a [f32], classes: &'a [f32], h: usize, w: usize },
}

impl HeadOutput<'_> {
    pub fn grid(&self) -> (usize, usize) {
        match *self {
            HeadOutput::Fused { h, w, .. } | HeadOutput::Split { h, w, .. } => (h, w),
        }
    }
}

/// 1スケール分の出力マップ (所有)
#[derive(Debug, Clone)]
pub struct ScaleMap {
    pub h: usize,
    pub w: usize,
    /// Fused では全チャネル、Split ではボックス/オブジェクトネスのチャネル
    pub primary: Vec<f32>,
    /// Split のクラスチャネル
    pub classes: Option<Vec<f32>>,
}

impl ScaleMap {
    pub fn view(&self) -> HeadOutput<'_> {
        match &self.classes {
            None => HeadOutput::Fused { data: &self.primary, h: self.h, w: self.w },
            Some(classes) => HeadOutput::Split { boxes: &self.primary, classes, h: self.h, w: self.w },
        }
    }
}

/// 検出ヘッドの全スケールの出力マップ
#[derive(Debug, Clone)]
pub struct HeadMaps {
    pub scales: Vec<ScaleMap>,
}

impl HeadMaps {
    pub fn views(&self) -> Vec<HeadOutput<'_>> {
        self.scales.iter().map(ScaleMap::view).collect()
    }
}

/// Split ヘッドの1枝 (3x3 の畳み込み単位 → 1x1 のバイアス付き畳み込み)
#[derive(Debug)]
pub struct Branch<'w, U> {
    stem: U,
    out: Conv2d<'w>,
}

impl<'w, U: ConvUnit<'w>> Branch<'w, U> {
    fn geoms(c_in: usize, hidden: usize, c_out: usize) -> (ConvGeom, ConvGeom) {
        (ConvGeom::square(c_in, hidden, 3, 1, 1), ConvGeom::square(hidden, c_out, 1, 1, 0))
    }

    fn load(store: &'w WeightStore, prefix: &str, c_in: usize, hidden: usize, c_out: usize) -> Result<Self> {
        let (g0, g1) = Self::geoms(c_in, hidden, c_out);
        Ok(Self {
            stem: U::load(store, &format!("{}.0", prefix), g0)?,
            out: Conv2d::load(store, &format!("{}.1", prefix), g1, true)?,
        })
    }

    fn manifest(prefix: &str, c_in: usize, hidden: usize, c_out: usize) -> Vec<WeightSpec> {
        let (g0, g1) = Self::geoms(c_in, hidden, c_out);
        let mut m = U::manifest(&format!("{}.0", prefix), &g0);
        m.extend(Conv2d::manifest(&format!("{}.1", prefix), &g1, true));
        m
    }

    fn forward(&self, x: &[f32], shape: Shape, y: &mut [f32], tmp: &mut [f32]) -> Result<()> {
        let hidden = self.stem.output_shape(shape)?;
        let avail = tmp.len();
        let t = tmp
            .get_mut(..hidden.len())
            .with_context(|| format!("head scratch holds {} floats, need {}", avail, hidden.len()))?;
        self.stem.forward(x, shape, t)?;
        self.out.forward(t, hidden, y)?;
        Ok(())
    }
}

/// 検出ヘッド
#[derive(Debug)]
pub enum DetectHead<'w, U> {
    Fused(Vec<Conv2d<'w>>),
    Split { boxes: Vec<Branch<'w, U>>, classes: Vec<Branch<'w, U>> },
}

/// 重みの名前の接頭辞
const PREFIX: &str = "model.24";

/// Split ヘッドの隠れ層の幅 (ボックス枝, クラス枝)
fn split_hidden(channels: &[usize; NUM_SCALES], num_classes: usize) -> (usize, usize) {
    let c2 = 16.max(channels[0] / 4).max(NUM_ANCHORS * 5);
    let c3 = channels[0].max(num_classes.min(100));
    (c2, c3)
}

impl<'w, U: ConvUnit<'w>> DetectHead<'w, U> {
    /// # Args
    /// * `store` - ウェイトストア
    /// * `channels` - 各スケールの入力チャネル数
    /// * `cfg` - 検出の設定 (クラス数とヘッドの形)
    pub fn load(store: &'w WeightStore, channels: &[usize; NUM_SCALES], cfg: &DetectConfig) -> Result<Self> {
        let nc = cfg.num_classes;
        match cfg.head {
            HeadLayout::Fused => {
                let no = NUM_ANCHORS * cfg.outputs_per_anchor();
                let m = channels
                    .iter()
                    .enumerate()
                    .map(|(k, &c)| {
                        let geom = ConvGeom::square(c, no, 1, 1, 0);
                        Conv2d::load(store, &format!("{}.m.{}", PREFIX, k), geom, true)
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(DetectHead::Fused(m))
            }
            HeadLayout::Split => {
                let (c2, c3) = split_hidden(channels, nc);
                let mut boxes = Vec::with_capacity(NUM_SCALES);
                let mut classes = Vec::with_capacity(NUM_SCALES);
                for (k, &c) in channels.iter().enumerate() {
                    boxes.push(Branch::load(store, &format!("{}.cv2.{}", PREFIX, k), c, c2, NUM_ANCHORS * 5)?);
                    classes.push(Branch::load(store, &format!("{}.cv3.{}", PREFIX, k), c, c3, NUM_ANCHORS * nc)?);
                }
                Ok(DetectHead::Split { boxes, classes })
            }
        }
    }

    pub fn manifest(channels: &[usize; NUM_SCALES], cfg: &DetectConfig) -> Vec<WeightSpec> {
        let nc = cfg.num_classes;
        let mut m = Vec::new();
        match cfg.head {
            HeadLayout::Fused => {
                let no = NUM_ANCHORS * cfg.outputs_per_anchor();
                for (k, &c) in channels.iter().enumerate() {
                    m.extend(Conv2d::manifest(&format!("{}.m.{}", PREFIX, k), &ConvGeom::square(c, no, 1, 1, 0), true));
                }
            }
            HeadLayout::Split => {
                let (c2, c3) = split_hidden(channels, nc);
                for (k, &c) in channels.iter().enumerate() {
                    m.extend(Branch::<U>::manifest(&format!("{}.cv2.{}", PREFIX, k), c, c2, NUM_ANCHORS * 5));
                    m.extend(Branch::<U>::manifest(&format!("{}.cv3.{}", PREFIX, k), c, c3, NUM_ANCHORS * nc));
                }
            }
        }
        m
    }

    pub fn layout(&self) -> HeadLayout {
        match self {
            DetectHead::Fused(_) => HeadLayout::Fused,
            DetectHead::Split { .. } => HeadLayout::Split,
        }
    }

    /// 入力の形状に合わせた出力マップを確保します。
    pub fn alloc_maps(&self, shapes: &[Shape; NUM_SCALES]) -> HeadMaps {
        let scales = shapes
            .iter()
            .enumerate()
            .map(|(k, s)| match self {
                DetectHead::Fused(m) => ScaleMap {
                    h: s.h,
                    w: s.w,
                    primary: vec![0.0; s.with_c(m[k].geom.c_out).len()],
                    classes: None,
                },
                DetectHead::Split { boxes, classes } => ScaleMap {
                    h: s.h,
                    w: s.w,
                    primary: vec![0.0; s.with_c(boxes[k].out.geom.c_out).len()],
                    classes: Some(vec![0.0; s.with_c(classes[k].out.geom.c_out).len()]),
                },
            })
            .collect();
        HeadMaps { scales }
    }

    /// 1スロットに必要な要素数 (Split の隠れ層)
    pub fn scratch_len(&self, shapes: &[Shape; NUM_SCALES]) -> usize {
        match self {
            DetectHead::Fused(_) => 0,
            DetectHead::Split { boxes, classes } => shapes
                .iter()
                .zip(boxes.iter().zip(classes))
                .map(|(s, (b, c))| s.with_c(b.stem.geom().c_out.max(c.stem.geom().c_out)).len())
                .max()
                .unwrap_or(0),
        }
    }

    /// 3スケールの特徴マップから出力マップを計算します。
    pub fn forward(&self, feats: [(&[f32], Shape); NUM_SCALES], maps: &mut HeadMaps, slots: Slots<'_>) -> Result<()> {
        ensure!(maps.scales.len() == NUM_SCALES, "head maps hold {} scales", maps.scales.len());
        match self {
            DetectHead::Fused(m) => {
                for ((conv, (x, shape)), map) in m.iter().zip(feats).zip(maps.scales.iter_mut()) {
                    conv.forward(x, shape, &mut map.primary)?;
                }
            }
            DetectHead::Split { boxes, classes } => {
                let need = self.scratch_len(&feats.map(|(_, s)| s));
                let (tmp, _) = slots.take(need)?;
                for (k, ((x, shape), map)) in feats.into_iter().zip(maps.scales.iter_mut()).enumerate() {
                    boxes[k].forward(x, shape, &mut map.primary, tmp)?;
                    let cls = map.classes.as_mut().context("split head map without class buffer")?;
                    classes[k].forward(x, shape, cls, tmp)?;
                }
            }
        }
        Ok(())
    }
}
