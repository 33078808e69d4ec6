//! YOLOv5 のレイヤに関するモジュール
use anyhow::{bail, ensure, Context, Result};

use crate::conv2d::ConvGeom;
use crate::tensor::Shape;

/// レイヤの種類を表す列挙型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    /// 畳み込み + 活性化
    Conv { c_out: usize, k: usize, s: usize, p: usize },
    /// CSP ブロック
    C3 { c_out: usize, n: usize, shortcut: bool },
    /// SPPF ブロック
    Sppf { c_out: usize, k: usize },
    /// 最近傍 2 倍アップサンプル
    Upsample,
    /// チャネル方向の結合
    Concat,
}

/// レイヤグループの構造体
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerGroup {
    /// 入力元のレイヤ。負の値は自分からの相対位置 (`-1` は直前のレイヤ)
    pub from: Vec<isize>,
    /// レイヤの種類
    pub kind: LayerKind,
}

/// 入力元
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// ネットワークへの入力
    Input,
    /// 指定したレイヤの出力
    Layer(usize),
}

impl LayerGroup {
    pub fn conv(c_out: usize, k: usize, s: usize, p: usize) -> Self {
        Self { from: vec![-1], kind: LayerKind::Conv { c_out, k, s, p } }
    }

    pub fn c3(c_out: usize, n: usize, shortcut: bool) -> Self {
        Self { from: vec![-1], kind: LayerKind::C3 { c_out, n, shortcut } }
    }

    pub fn sppf(c_out: usize, k: usize) -> Self {
        Self { from: vec![-1], kind: LayerKind::Sppf { c_out, k } }
    }

    pub fn upsample() -> Self {
        Self { from: vec![-1], kind: LayerKind::Upsample }
    }

    pub fn concat(from: &[isize]) -> Self {
        Self { from: from.to_vec(), kind: LayerKind::Concat }
    }

    /// 重みの名前の接頭辞 (`model.{index}`)
    pub fn prefix(index: usize) -> String {
        format!("model.{}", index)
    }

    /// `from` を絶対位置に解決します。
    ///
    /// # Args
    /// * `index` - このレイヤの位置
    ///
    /// # Return
    /// * 入力元の列
    pub fn sources(&self, index: usize) -> Result<Vec<Source>> {
        self.from
            .iter()
            .map(|&f| {
                let abs = if f < 0 { index as isize + f } else { f };
                match abs {
                    -1 => Ok(Source::Input),
                    a if a >= 0 && (a as usize) < index => Ok(Source::Layer(a as usize)),
                    _ => bail!("layer {} reads from {} which is not an earlier layer", index, f),
                }
            })
            .collect()
    }

    /// 入力の形状から出力の形状を求めます。
    pub fn output_shape(&self, inputs: &[Shape]) -> Result<Shape> {
        let first = *inputs.first().context("layer has no inputs")?;
        match self.kind {
            LayerKind::Conv { c_out, k, s, p } => ConvGeom::square(first.c, c_out, k, s, p).output_shape(first),
            LayerKind::C3 { c_out, .. } | LayerKind::Sppf { c_out, .. } => Ok(first.with_c(c_out)),
            LayerKind::Upsample => Ok(first.with_hw(first.h * 2, first.w * 2)),
            LayerKind::Concat => {
                let mut c = 0;
                for s in inputs {
                    ensure!(
                        (s.n, s.h, s.w) == (first.n, first.h, first.w),
                        "concat inputs disagree: {:?} vs {:?}",
                        s,
                        first
                    );
                    c += s.c;
                }
                Ok(first.with_c(c))
            }
        }
    }
}

/// 全レイヤの出力形状を求めます。
///
/// # Args
/// * `layers` - レイヤの列
/// * `input` - ネットワーク入力の形状
///
/// # Return
/// * レイヤごとの出力形状
pub fn infer_shapes(layers: &[LayerGroup], input: Shape) -> Result<Vec<Shape>> {
    let mut shapes: Vec<Shape> = Vec::with_capacity(layers.len());
    for (i, layer) in layers.iter().enumerate() {
        let ins: Vec<Shape> = layer
            .sources(i)?
            .into_iter()
            .map(|s| match s {
                Source::Input => input,
                Source::Layer(j) => shapes[j],
            })
            .collect();
        let out = layer.output_shape(&ins).with_context(|| format!("layer {} ({:?})", i, layer.kind))?;
        shapes.push(out);
    }
    Ok(shapes)
}

/// 検出ヘッドが読むレイヤ (P3, P4, P5)
pub const HEAD_FROM: [usize; 3] = [17, 20, 23];

/// YOLOv5n のレイヤ構成 (backbone 0-9, head 10-23)
#[rustfmt::skip]
pub fn yolov5n() -> Vec<LayerGroup> {
    vec![
        LayerGroup::conv( 16, 6, 2, 2),         //  0 P1/2
        LayerGroup::conv( 32, 3, 2, 1),         //  1 P2/4
        LayerGroup::c3(   32, 1, true),         //  2
        LayerGroup::conv( 64, 3, 2, 1),         //  3 P3/8
        LayerGroup::c3(   64, 2, true),         //  4
        LayerGroup::conv(128, 3, 2, 1),         //  5 P4/16
        LayerGroup::c3(  128, 3, true),         //  6
        LayerGroup::conv(256, 3, 2, 1),         //  7 P5/32
        LayerGroup::c3(  256, 1, true),         //  8
        LayerGroup::sppf(256, 5),               //  9
        LayerGroup::conv(128, 1, 1, 0),         // 10
        LayerGroup::upsample(),                 // 11
        LayerGroup::concat(&[-1, 6]),           // 12 cat backbone P4
        LayerGroup::c3(  128, 1, false),        // 13
        LayerGroup::conv( 64, 1, 1, 0),         // 14
        LayerGroup::upsample(),                 // 15
        LayerGroup::concat(&[-1, 4]),           // 16 cat backbone P3
        LayerGroup::c3(   64, 1, false),        // 17 (P3/8-small)
        LayerGroup::conv( 64, 3, 2, 1),         // 18
        LayerGroup::concat(&[-1, 14]),          // 19 cat head P4
        LayerGroup::c3(  128, 1, false),        // 20 (P4/16-medium)
        LayerGroup::conv(128, 3, 2, 1),         // 21
        LayerGroup::concat(&[-1, 10]),          // 22 cat head P5
        LayerGroup::c3(  256, 1, false),        // 23 (P5/32-large)
    ]
}
