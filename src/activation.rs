//! 活性化関数とバッチ正規化のモジュール
//!
//! * `bn_silu` - バッチ正規化 (推論時のアフィン変換) と SiLU を一度に適用します。
//! * `silu` - バッチ正規化を畳み込みのバイアスへ畳み込んだモデル用。非有限値を飽和させます。

use anyhow::{ensure, Result};

use crate::tensor::Shape;

/// YOLOv5 のバッチ正規化の eps (PyTorch の既定値 1e-5 ではない)
pub const BN_EPS: f32 = 1e-3;

/// `silu` が正の非有限値に対して返す飽和値
pub const SILU_SATURATION: f32 = 100.0;

#[inline]
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// 飽和処理のない SiLU (`x * sigmoid(x)`)
#[inline]
fn silu_raw(x: f32) -> f32 {
    x * sigmoid(x)
}

/// 非有限値を飽和させる SiLU
///
/// 入力が NaN または無限大の場合、正なら [`SILU_SATURATION`]、それ以外は 0 を返します。
#[inline]
pub fn silu_saturating(x: f32) -> f32 {
    if !x.is_finite() {
        return if x > 0.0 { SILU_SATURATION } else { 0.0 };
    }
    silu_raw(x)
}

/// バッチ正規化のパラメータ (チャネルごとに1値)
#[derive(Debug, Clone, Copy)]
pub struct BatchNorm<'w> {
    pub gamma: &'w [f32],
    pub beta: &'w [f32],
    pub mean: &'w [f32],
    pub var: &'w [f32],
}

impl<'w> BatchNorm<'w> {
    /// 各パラメータの長さがチャネル数と一致するかを検証して作成します。
    pub fn new(gamma: &'w [f32], beta: &'w [f32], mean: &'w [f32], var: &'w [f32]) -> Result<Self> {
        let c = gamma.len();
        ensure!(
            beta.len() == c && mean.len() == c && var.len() == c,
            "batch norm parameter lengths differ: gamma={} beta={} mean={} var={}",
            c,
            beta.len(),
            mean.len(),
            var.len()
        );
        Ok(Self { gamma, beta, mean, var })
    }

    pub fn channels(&self) -> usize {
        self.gamma.len()
    }

    /// チャネル `c` の (scale, shift)。`z = x * scale + shift`
    fn affine(&self, c: usize, eps: f32) -> (f32, f32) {
        let inv_std = 1.0 / (self.var[c] + eps).sqrt();
        (inv_std, self.mean[c])
    }

    /// バッチ正規化を畳み込みの重みとバイアスへ畳み込みます。
    ///
    /// # Args
    /// * `weight` - OIHW の畳み込み重み (出力チャネル数はこの BN のチャネル数と同じ)
    /// * `eps` - BN の eps
    ///
    /// # Return
    /// * (畳み込み後の重み, バイアス)
    pub fn fold(&self, weight: &[f32], eps: f32) -> Result<(Vec<f32>, Vec<f32>)> {
        let c = self.channels();
        ensure!(
            c > 0 && weight.len() % c == 0,
            "weight of {} elements cannot be split into {} output channels",
            weight.len(),
            c
        );
        let per_oc = weight.len() / c;
        let mut w = Vec::with_capacity(weight.len());
        let mut b = Vec::with_capacity(c);
        for oc in 0..c {
            let s = self.gamma[oc] / (self.var[oc] + eps).sqrt();
            w.extend(weight[oc * per_oc..(oc + 1) * per_oc].iter().map(|v| v * s));
            b.push(self.beta[oc] - self.mean[oc] * s);
        }
        Ok((w, b))
    }
}

/// BN + SiLU をチャネルごとに適用します。
///
/// # Args
/// * `x` - 入力 (N, C, H, W)
/// * `shape` - 入力の形状
/// * `bn` - バッチ正規化のパラメータ
/// * `eps` - 分散に加える定数 (YOLOv5 は [`BN_EPS`])
/// * `y` - 出力先 (入力と同じ形状)
pub fn bn_silu(x: &[f32], shape: Shape, bn: &BatchNorm, eps: f32, y: &mut [f32]) -> Result<()> {
    shape.check(x.len(), "bn_silu input")?;
    shape.check(y.len(), "bn_silu output")?;
    ensure!(bn.channels() == shape.c, "bn has {} channels, tensor has {}", bn.channels(), shape.c);

    let hw = shape.plane();
    for ni in 0..shape.n {
        for ci in 0..shape.c {
            let (inv_std, m) = bn.affine(ci, eps);
            let (g, b) = (bn.gamma[ci], bn.beta[ci]);
            let base = (ni * shape.c + ci) * hw;
            for (yv, &xv) in y[base..base + hw].iter_mut().zip(&x[base..base + hw]) {
                let z = (xv - m) * inv_std;
                *yv = silu_raw(z * g + b);
            }
        }
    }
    Ok(())
}

/// [`bn_silu`] のインプレース版
pub fn bn_silu_inplace(data: &mut [f32], shape: Shape, bn: &BatchNorm, eps: f32) -> Result<()> {
    shape.check(data.len(), "bn_silu data")?;
    ensure!(bn.channels() == shape.c, "bn has {} channels, tensor has {}", bn.channels(), shape.c);

    let hw = shape.plane();
    for ni in 0..shape.n {
        for ci in 0..shape.c {
            let (inv_std, m) = bn.affine(ci, eps);
            let (g, b) = (bn.gamma[ci], bn.beta[ci]);
            let base = (ni * shape.c + ci) * hw;
            for v in data[base..base + hw].iter_mut() {
                let z = (*v - m) * inv_std;
                *v = silu_raw(z * g + b);
            }
        }
    }
    Ok(())
}

/// 飽和処理付き SiLU を全要素に適用します。
pub fn silu(x: &[f32], y: &mut [f32]) -> Result<()> {
    ensure!(x.len() == y.len(), "silu: input has {} elements, output has {}", x.len(), y.len());
    for (yv, &xv) in y.iter_mut().zip(x) {
        *yv = silu_saturating(xv);
    }
    Ok(())
}

/// [`silu`] のインプレース版
pub fn silu_inplace(data: &mut [f32]) {
    data.iter_mut().for_each(|v| *v = silu_saturating(*v));
}
