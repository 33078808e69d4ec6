//! 畳み込み + 活性化の単位 (YOLOv5 の `Conv` モジュール)
//!
//! 2種類のバリアントがあり、モデル構築時に型パラメータで選びます。
//!
//! * [`ConvBn`] - `conv.weight` と `bn.*` を読み込み、畳み込み後に BN + SiLU を適用
//! * [`ConvFused`] - BN を畳み込みのバイアスへ畳み込んだ `conv.weight` / `conv.bias` を読み込み、
//!   バイアス付き畳み込み後に飽和付き SiLU を適用

use anyhow::{Context, Result};

use crate::activation::{bn_silu_inplace, silu_inplace, BatchNorm, BN_EPS};
use crate::conv2d::{conv2d, ConvGeom};
use crate::tensor::Shape;
use crate::weights::{WeightSpec, WeightStore};

/// 活性化を含まない畳み込み (検出ヘッドの最終層などで使用)
#[derive(Debug, Clone, Copy)]
pub struct Conv2d<'w> {
    pub weight: &'w [f32],
    pub bias: Option<&'w [f32]>,
    pub geom: ConvGeom,
}

impl<'w> Conv2d<'w> {
    /// `{prefix}.weight` (と `with_bias` なら `{prefix}.bias`) を読み込みます。
    pub fn load(store: &'w WeightStore, prefix: &str, geom: ConvGeom, with_bias: bool) -> Result<Self> {
        let weight = store.get_shaped(&format!("{}.weight", prefix), &geom.weight_dims())?;
        let bias = if with_bias {
            Some(store.get_shaped(&format!("{}.bias", prefix), &[geom.c_out])?)
        } else {
            None
        };
        Ok(Self { weight, bias, geom })
    }

    pub fn manifest(prefix: &str, geom: &ConvGeom, with_bias: bool) -> Vec<WeightSpec> {
        let mut m = vec![WeightSpec::new(format!("{}.weight", prefix), geom.weight_dims())];
        if with_bias {
            m.push(WeightSpec::new(format!("{}.bias", prefix), vec![geom.c_out]));
        }
        m
    }

    /// 畳み込みを実行し、出力の形状を返します。
    pub fn forward(&self, x: &[f32], shape: Shape, y: &mut [f32]) -> Result<Shape> {
        let out = self.geom.output_shape(shape)?;
        conv2d(x, shape, self.weight, self.bias, &self.geom, y, out)?;
        Ok(out)
    }
}

/// 畳み込み + 活性化の単位
pub trait ConvUnit<'w>: Sized {
    /// ログ出力用のバリアント名
    const VARIANT: &'static str;

    /// `prefix` 以下の重みを読み込みます。
    fn load(store: &'w WeightStore, prefix: &str, geom: ConvGeom) -> Result<Self>;

    /// この単位が必要とする重みの一覧
    fn manifest(prefix: &str, geom: &ConvGeom) -> Vec<WeightSpec>;

    fn geom(&self) -> &ConvGeom;

    /// 畳み込みと活性化を実行し、出力の形状を返します。
    fn forward(&self, x: &[f32], shape: Shape, y: &mut [f32]) -> Result<Shape>;

    /// 出力の形状
    fn output_shape(&self, shape: Shape) -> Result<Shape> {
        self.geom().output_shape(shape)
    }
}

/// BN を持つ変種
#[derive(Debug, Clone, Copy)]
pub struct ConvBn<'w> {
    conv: Conv2d<'w>,
    bn: BatchNorm<'w>,
}

impl<'w> ConvUnit<'w> for ConvBn<'w> {
    const VARIANT: &'static str = "batch-norm";

    fn load(store: &'w WeightStore, prefix: &str, geom: ConvGeom) -> Result<Self> {
        let conv = Conv2d::load(store, &format!("{}.conv", prefix), geom, false)?;
        let c = [geom.c_out];
        let bn = BatchNorm::new(
            store.get_shaped(&format!("{}.bn.weight", prefix), &c)?,
            store.get_shaped(&format!("{}.bn.bias", prefix), &c)?,
            store.get_shaped(&format!("{}.bn.running_mean", prefix), &c)?,
            store.get_shaped(&format!("{}.bn.running_var", prefix), &c)?,
        )
        .with_context(|| format!("{}.bn", prefix))?;
        Ok(Self { conv, bn })
    }

    fn manifest(prefix: &str, geom: &ConvGeom) -> Vec<WeightSpec> {
        let mut m = Conv2d::manifest(&format!("{}.conv", prefix), geom, false);
        for p in ["weight", "bias", "running_mean", "running_var"] {
            m.push(WeightSpec::new(format!("{}.bn.{}", prefix, p), vec![geom.c_out]));
        }
        m
    }

    fn geom(&self) -> &ConvGeom {
        &self.conv.geom
    }

    fn forward(&self, x: &[f32], shape: Shape, y: &mut [f32]) -> Result<Shape> {
        let out = self.conv.forward(x, shape, y)?;
        bn_silu_inplace(y, out, &self.bn, BN_EPS)?;
        Ok(out)
    }
}

/// BN をバイアスへ畳み込んだ変種
#[derive(Debug, Clone, Copy)]
pub struct ConvFused<'w> {
    conv: Conv2d<'w>,
}

impl<'w> ConvUnit<'w> for ConvFused<'w> {
    const VARIANT: &'static str = "bias-fused";

    fn load(store: &'w WeightStore, prefix: &str, geom: ConvGeom) -> Result<Self> {
        Ok(Self { conv: Conv2d::load(store, &format!("{}.conv", prefix), geom, true)? })
    }

    fn manifest(prefix: &str, geom: &ConvGeom) -> Vec<WeightSpec> {
        Conv2d::manifest(&format!("{}.conv", prefix), geom, true)
    }

    fn geom(&self) -> &ConvGeom {
        &self.conv.geom
    }

    fn forward(&self, x: &[f32], shape: Shape, y: &mut [f32]) -> Result<Shape> {
        let out = self.conv.forward(x, shape, y)?;
        silu_inplace(y);
        Ok(out)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::conv2d::tests::fill;
    use crate::weights::WeightTensor;

    /// マニフェストに従って決定的な乱数で重みを埋めたストアを作ります。
    ///
    /// `running_var` は正の値になるようにします。
    pub(crate) fn synthetic_store(manifest: &[WeightSpec], seed: u32) -> WeightStore {
        let tensors = manifest
            .iter()
            .enumerate()
            .map(|(i, spec)| {
                let len = spec.dims.iter().product();
                let mut data = fill(len, seed.wrapping_add(i as u32 * 7919), 0.5);
                if spec.name.ends_with("running_var") {
                    data.iter_mut().for_each(|v| *v = v.abs() + 0.5);
                }
                WeightTensor::new(spec.name.clone(), spec.dims.clone(), data).unwrap()
            })
            .collect();
        WeightStore::from_tensors(tensors).unwrap()
    }

    #[test]
    fn bn_and_fused_units_agree() {
        let geom = ConvGeom::square(4, 6, 3, 2, 1);
        let store = synthetic_store(&ConvBn::manifest("model.0", &geom), 3);
        let fused_store = store.fuse_batch_norm(BN_EPS).unwrap();

        let bn = ConvBn::load(&store, "model.0", geom).unwrap();
        let fused = ConvFused::load(&fused_store, "model.0", geom).unwrap();

        let shape = Shape::new(1, 4, 9, 10);
        let x = fill(shape.len(), 11, 1.0);
        let out = bn.output_shape(shape).unwrap();
        let mut a = vec![0.0; out.len()];
        let mut b = vec![0.0; out.len()];
        assert_eq!(bn.forward(&x, shape, &mut a).unwrap(), out);
        assert_eq!(fused.forward(&x, shape, &mut b).unwrap(), out);
        for (p, q) in a.iter().zip(&b) {
            assert!((p - q).abs() < 1e-4, "{} vs {}", p, q);
        }
    }

    #[test]
    fn load_fails_on_missing_or_misshaped_weights() {
        let geom = ConvGeom::square(2, 3, 1, 1, 0);
        let store = synthetic_store(&ConvFused::manifest("model.1", &geom), 1);
        assert!(ConvFused::load(&store, "model.1", geom).is_ok());
        assert!(ConvBn::load(&store, "model.1", geom).is_err());
        assert!(ConvFused::load(&store, "model.1", ConvGeom::square(2, 4, 1, 1, 0)).is_err());
    }
}
