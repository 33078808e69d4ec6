//! YOLOv5 の複合ブロック (Bottleneck, C3, SPPF)
//!
//! どのブロックも畳み込み単位 `U` ([`ConvUnit`]) を型パラメータに取り、
//! BN 版とバイアス畳み込み版を同じコードで扱います。
//! 中間テンソルは呼び出し側の [`Slots`] から借ります。

use std::mem;

use anyhow::{ensure, Context, Result};

use crate::arena::Slots;
use crate::conv2d::ConvGeom;
use crate::conv_unit::ConvUnit;
use crate::layout::{add_inplace, concat, maxpool2d};
use crate::tensor::Shape;
use crate::weights::{WeightSpec, WeightStore};

/// ブロックが同時に借りるスロット数の最大
pub const SCRATCH_SLOTS: usize = 5;

/// 1x1, stride 1 の畳み込み
const fn pointwise(c_in: usize, c_out: usize) -> ConvGeom {
    ConvGeom::square(c_in, c_out, 1, 1, 0)
}

/// 残差ブロック: `cv1` (1x1) → `cv2` (3x3) → 入力との加算 (任意)
#[derive(Debug)]
pub struct Bottleneck<U> {
    cv1: U,
    cv2: U,
    add: bool,
}

impl<'w, U: ConvUnit<'w>> Bottleneck<U> {
    fn geoms(c_in: usize, c_out: usize) -> (ConvGeom, ConvGeom) {
        (pointwise(c_in, c_out), ConvGeom::square(c_out, c_out, 3, 1, 1))
    }

    /// # Args
    /// * `store` - ウェイトストア
    /// * `prefix` - 重みの名前の接頭辞 (例: `model.2.m.0`)
    /// * `c_in` - 入力チャネル数
    /// * `c_out` - 出力チャネル数 (隠れ層も同じ幅)
    /// * `shortcut` - 残差接続を使うか。`c_in != c_out` の場合は無視されます
    pub fn load(store: &'w WeightStore, prefix: &str, c_in: usize, c_out: usize, shortcut: bool) -> Result<Self> {
        let (g1, g2) = Self::geoms(c_in, c_out);
        Ok(Self {
            cv1: U::load(store, &format!("{}.cv1", prefix), g1)?,
            cv2: U::load(store, &format!("{}.cv2", prefix), g2)?,
            add: shortcut && c_in == c_out,
        })
    }

    pub fn manifest(prefix: &str, c_in: usize, c_out: usize) -> Vec<WeightSpec> {
        let (g1, g2) = Self::geoms(c_in, c_out);
        let mut m = U::manifest(&format!("{}.cv1", prefix), &g1);
        m.extend(U::manifest(&format!("{}.cv2", prefix), &g2));
        m
    }

    pub fn has_residual(&self) -> bool {
        self.add
    }

    /// # Args
    /// * `x` - 入力
    /// * `shape` - 入力の形状
    /// * `y` - 出力先
    /// * `tmp` - `cv1` の出力を置く作業領域 ([`Self::scratch_len`] 以上)
    pub fn forward(&self, x: &[f32], shape: Shape, y: &mut [f32], tmp: &mut [f32]) -> Result<Shape> {
        let hidden = self.cv1.output_shape(shape)?;
        let avail = tmp.len();
        let t = tmp
            .get_mut(..hidden.len())
            .with_context(|| format!("bottleneck scratch holds {} floats, need {}", avail, hidden.len()))?;
        self.cv1.forward(x, shape, t)?;
        let out = self.cv2.forward(t, hidden, y)?;
        if self.add {
            add_inplace(y, x)?;
        }
        Ok(out)
    }

    pub fn scratch_len(&self, shape: Shape) -> usize {
        shape.with_c(self.cv1.geom().c_out).len()
    }
}

/// CSP ブロック
///
/// `cv1` → Bottleneck × n の経路と、`cv2` だけの経路をチャネル方向に結合し (Bottleneck 側が先)、
/// `cv3` で出力チャネル数に戻します。
#[derive(Debug)]
pub struct C3<U> {
    cv1: U,
    cv2: U,
    cv3: U,
    m: Vec<Bottleneck<U>>,
    hidden: usize,
}

impl<'w, U: ConvUnit<'w>> C3<U> {
    fn geoms(c_in: usize, c_out: usize) -> (usize, [ConvGeom; 3]) {
        let c_ = c_out / 2;
        (c_, [pointwise(c_in, c_), pointwise(c_in, c_), pointwise(2 * c_, c_out)])
    }

    /// # Args
    /// * `store` - ウェイトストア
    /// * `prefix` - 重みの名前の接頭辞 (例: `model.4`)
    /// * `c_in` - 入力チャネル数
    /// * `c_out` - 出力チャネル数
    /// * `n` - Bottleneck の繰り返し数
    /// * `shortcut` - 各 Bottleneck で残差接続を使うか
    pub fn load(
        store: &'w WeightStore,
        prefix: &str,
        c_in: usize,
        c_out: usize,
        n: usize,
        shortcut: bool,
    ) -> Result<Self> {
        let (c_, [g1, g2, g3]) = Self::geoms(c_in, c_out);
        let m = (0..n)
            .map(|i| Bottleneck::load(store, &format!("{}.m.{}", prefix, i), c_, c_, shortcut))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            cv1: U::load(store, &format!("{}.cv1", prefix), g1)?,
            cv2: U::load(store, &format!("{}.cv2", prefix), g2)?,
            cv3: U::load(store, &format!("{}.cv3", prefix), g3)?,
            m,
            hidden: c_,
        })
    }

    pub fn manifest(prefix: &str, c_in: usize, c_out: usize, n: usize) -> Vec<WeightSpec> {
        let (c_, [g1, g2, g3]) = Self::geoms(c_in, c_out);
        let mut m = U::manifest(&format!("{}.cv1", prefix), &g1);
        m.extend(U::manifest(&format!("{}.cv2", prefix), &g2));
        m.extend(U::manifest(&format!("{}.cv3", prefix), &g3));
        for i in 0..n {
            m.extend(Bottleneck::<U>::manifest(&format!("{}.m.{}", prefix, i), c_, c_));
        }
        m
    }

    pub fn forward(&self, x: &[f32], shape: Shape, y: &mut [f32], slots: Slots<'_>) -> Result<Shape> {
        let hidden = shape.with_c(self.hidden);
        let len = hidden.len();
        let (a, slots) = slots.take(len)?;
        let (b, slots) = slots.take(len)?;
        let (skip, slots) = slots.take(len)?;
        let (cat, slots) = slots.take(2 * len)?;
        let (tmp, _) = slots.take(len)?;

        self.cv1.forward(x, shape, a)?;
        let (mut cur, mut next) = (a, b);
        for m in &self.m {
            m.forward(cur, hidden, next, tmp)?;
            mem::swap(&mut cur, &mut next);
        }

        self.cv2.forward(x, shape, skip)?;
        concat(&[(&*cur, self.hidden), (&*skip, self.hidden)], shape.n, shape.h, shape.w, cat)?;
        self.cv3.forward(cat, hidden.with_c(2 * self.hidden), y)
    }

    /// 1スロットに必要な要素数
    pub fn scratch_len(&self, shape: Shape) -> usize {
        shape.with_c(2 * self.hidden).len()
    }

    pub fn output_shape(&self, shape: Shape) -> Result<Shape> {
        self.cv3.output_shape(shape.with_c(2 * self.hidden))
    }
}

/// SPPF ブロック
///
/// `cv1` の出力 `x1` に同じカーネルの最大値プーリングを3回連続で適用し、
/// `[x1, y1, y2, y3]` を結合して `cv2` に通します。
#[derive(Debug)]
pub struct Sppf<U> {
    cv1: U,
    cv2: U,
    hidden: usize,
    k: usize,
}

impl<'w, U: ConvUnit<'w>> Sppf<U> {
    fn geoms(c_in: usize, c_out: usize) -> (usize, [ConvGeom; 2]) {
        let c_ = c_in / 2;
        (c_, [pointwise(c_in, c_), pointwise(4 * c_, c_out)])
    }

    /// # Args
    /// * `store` - ウェイトストア
    /// * `prefix` - 重みの名前の接頭辞 (例: `model.9`)
    /// * `c_in` - 入力チャネル数
    /// * `c_out` - 出力チャネル数
    /// * `k` - プーリングのカーネルサイズ (奇数)
    pub fn load(store: &'w WeightStore, prefix: &str, c_in: usize, c_out: usize, k: usize) -> Result<Self> {
        ensure!(k % 2 == 1, "SPPF kernel must be odd, got {}", k);
        let (c_, [g1, g2]) = Self::geoms(c_in, c_out);
        Ok(Self {
            cv1: U::load(store, &format!("{}.cv1", prefix), g1)?,
            cv2: U::load(store, &format!("{}.cv2", prefix), g2)?,
            hidden: c_,
            k,
        })
    }

    pub fn manifest(prefix: &str, c_in: usize, c_out: usize) -> Vec<WeightSpec> {
        let (_, [g1, g2]) = Self::geoms(c_in, c_out);
        let mut m = U::manifest(&format!("{}.cv1", prefix), &g1);
        m.extend(U::manifest(&format!("{}.cv2", prefix), &g2));
        m
    }

    pub fn forward(&self, x: &[f32], shape: Shape, y: &mut [f32], slots: Slots<'_>) -> Result<Shape> {
        let hidden = shape.with_c(self.hidden);
        let len = hidden.len();
        let (x1, slots) = slots.take(len)?;
        let (y1, slots) = slots.take(len)?;
        let (y2, slots) = slots.take(len)?;
        let (y3, slots) = slots.take(len)?;
        let (cat, _) = slots.take(4 * len)?;

        self.cv1.forward(x, shape, x1)?;
        let (k, pad) = (self.k, self.k / 2);
        maxpool2d(x1, hidden, k, 1, pad, y1, hidden)?;
        maxpool2d(y1, hidden, k, 1, pad, y2, hidden)?;
        maxpool2d(y2, hidden, k, 1, pad, y3, hidden)?;

        let c = self.hidden;
        concat(&[(&*x1, c), (&*y1, c), (&*y2, c), (&*y3, c)], shape.n, shape.h, shape.w, cat)?;
        self.cv2.forward(cat, hidden.with_c(4 * c), y)
    }

    pub fn scratch_len(&self, shape: Shape) -> usize {
        shape.with_c(4 * self.hidden).len()
    }

    pub fn output_shape(&self, shape: Shape) -> Result<Shape> {
        self.cv2.output_shape(shape.with_c(4 * self.hidden))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::BN_EPS;
    use crate::arena::Arena;
    use crate::conv2d::tests::fill;
    use crate::conv_unit::tests::synthetic_store;
    use crate::conv_unit::{ConvBn, ConvFused};

    fn assert_close(a: &[f32], b: &[f32], tol: f32) {
        assert_eq!(a.len(), b.len());
        for (i, (p, q)) in a.iter().zip(b).enumerate() {
            assert!((p - q).abs() < tol, "index {}: {} vs {}", i, p, q);
        }
    }

    #[test]
    fn bottleneck_adds_input_only_when_shapes_allow() {
        let manifest = Bottleneck::<ConvFused>::manifest("b", 4, 4);
        let store = synthetic_store(&manifest, 5);
        let with = Bottleneck::<ConvFused>::load(&store, "b", 4, 4, true).unwrap();
        let without = Bottleneck::<ConvFused>::load(&store, "b", 4, 4, false).unwrap();
        assert!(with.has_residual());
        assert!(!without.has_residual());

        let shape = Shape::new(1, 4, 5, 5);
        let x = fill(shape.len(), 2, 1.0);
        let mut tmp = vec![0.0; with.scratch_len(shape)];
        let mut y_with = vec![0.0; shape.len()];
        let mut y_without = vec![0.0; shape.len()];
        with.forward(&x, shape, &mut y_with, &mut tmp).unwrap();
        without.forward(&x, shape, &mut y_without, &mut tmp).unwrap();

        let diff: Vec<f32> = y_with.iter().zip(&y_without).map(|(a, b)| a - b).collect();
        assert_close(&diff, &x, 1e-5);
    }

    #[test]
    fn bottleneck_skips_residual_on_channel_mismatch() {
        let store = synthetic_store(&Bottleneck::<ConvFused>::manifest("b", 3, 4), 6);
        let b = Bottleneck::<ConvFused>::load(&store, "b", 3, 4, true).unwrap();
        assert!(!b.has_residual());
    }

    #[test]
    fn c3_concatenates_bottleneck_path_first() {
        // cv3 を恒等写像にすると、出力の前半は Bottleneck 経路、後半はスキップ経路になる
        let (c_in, c_out) = (4, 4);
        let mut manifest = C3::<ConvFused>::manifest("c", c_in, c_out, 0);
        manifest.retain(|s| !s.name.starts_with("c.cv3"));
        let base = synthetic_store(&manifest, 9);

        let mut tensors: Vec<_> = base.iter().cloned().collect();
        let mut eye = vec![0.0; c_out * c_out];
        for i in 0..c_out {
            eye[i * c_out + i] = 1.0;
        }
        tensors.push(crate::weights::WeightTensor::new("c.cv3.conv.weight", vec![c_out, c_out, 1, 1], eye).unwrap());
        tensors.push(crate::weights::WeightTensor::new("c.cv3.conv.bias", vec![c_out], vec![0.0; c_out]).unwrap());
        let store = WeightStore::from_tensors(tensors).unwrap();

        let c3 = C3::<ConvFused>::load(&store, "c", c_in, c_out, 0, true).unwrap();
        let cv1 = ConvFused::load(&store, "c.cv1", pointwise(c_in, 2)).unwrap();
        let cv2 = ConvFused::load(&store, "c.cv2", pointwise(c_in, 2)).unwrap();

        let shape = Shape::new(1, c_in, 3, 4);
        let x = fill(shape.len(), 4, 1.0);
        let mut arena = Arena::new(c3.scratch_len(shape), SCRATCH_SLOTS).unwrap();
        let mut y = vec![0.0; shape.len()];
        c3.forward(&x, shape, &mut y, arena.slots()).unwrap();

        let half = shape.with_c(2).len();
        let mut a = vec![0.0; half];
        let mut b = vec![0.0; half];
        cv1.forward(&x, shape, &mut a).unwrap();
        cv2.forward(&x, shape, &mut b).unwrap();
        // cv3 の SiLU を同じように通す
        crate::activation::silu_inplace(&mut a);
        crate::activation::silu_inplace(&mut b);
        assert_close(&y[..half], &a, 1e-5);
        assert_close(&y[half..], &b, 1e-5);
    }

    #[test]
    fn c3_bn_and_fused_agree() {
        let manifest = C3::<ConvBn>::manifest("model.2", 8, 8, 2);
        let store = synthetic_store(&manifest, 13);
        let fused_store = store.fuse_batch_norm(BN_EPS).unwrap();
        let bn = C3::<ConvBn>::load(&store, "model.2", 8, 8, 2, true).unwrap();
        let fused = C3::<ConvFused>::load(&fused_store, "model.2", 8, 8, 2, true).unwrap();

        let shape = Shape::new(1, 8, 6, 6);
        let x = fill(shape.len(), 17, 1.0);
        let mut arena = Arena::new(bn.scratch_len(shape), SCRATCH_SLOTS).unwrap();
        let mut a = vec![0.0; shape.len()];
        let mut b = vec![0.0; shape.len()];
        assert_eq!(bn.forward(&x, shape, &mut a, arena.slots()).unwrap(), shape);
        fused.forward(&x, shape, &mut b, arena.slots()).unwrap();
        assert_close(&a, &b, 1e-4);
    }

    #[test]
    fn sppf_output_shape_and_variants_agree() {
        let manifest = Sppf::<ConvBn>::manifest("model.9", 8, 6);
        let store = synthetic_store(&manifest, 21);
        let fused_store = store.fuse_batch_norm(BN_EPS).unwrap();
        let bn = Sppf::<ConvBn>::load(&store, "model.9", 8, 6, 5).unwrap();
        let fused = Sppf::<ConvFused>::load(&fused_store, "model.9", 8, 6, 5).unwrap();

        let shape = Shape::new(1, 8, 7, 5);
        let out = bn.output_shape(shape).unwrap();
        assert_eq!(out, shape.with_c(6));

        let x = fill(shape.len(), 23, 1.0);
        let mut arena = Arena::new(bn.scratch_len(shape), SCRATCH_SLOTS).unwrap();
        let mut a = vec![0.0; out.len()];
        let mut b = vec![0.0; out.len()];
        bn.forward(&x, shape, &mut a, arena.slots()).unwrap();
        fused.forward(&x, shape, &mut b, arena.slots()).unwrap();
        assert_close(&a, &b, 1e-4);
    }

    #[test]
    fn sppf_rejects_even_kernel() {
        let store = synthetic_store(&Sppf::<ConvFused>::manifest("s", 4, 4), 1);
        assert!(Sppf::<ConvFused>::load(&store, "s", 4, 4, 4).is_err());
    }

    #[test]
    fn undersized_arena_is_an_error() {
        let store = synthetic_store(&Sppf::<ConvFused>::manifest("s", 4, 4), 1);
        let sppf = Sppf::<ConvFused>::load(&store, "s", 4, 4, 5).unwrap();
        let shape = Shape::new(1, 4, 4, 4);
        let x = fill(shape.len(), 3, 1.0);
        let mut y = vec![0.0; shape.len()];
        let mut arena = Arena::new(sppf.scratch_len(shape) - 1, SCRATCH_SLOTS).unwrap();
        assert!(sppf.forward(&x, shape, &mut y, arena.slots()).is_err());
    }
}
