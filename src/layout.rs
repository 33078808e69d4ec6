//! チャネル結合・アップサンプル・プーリングなど、重みを持たないテンソル操作のモジュール

use anyhow::{ensure, Result};

use crate::tensor::Shape;

/// 複数のテンソルをチャネル方向に結合します。
///
/// 出力のチャネル順は `inputs` の順番どおりです (先頭のテンソルのチャネルが先)。
///
/// # Args
/// * `inputs` - (データ, チャネル数) の配列。N, H, W はすべて共通
/// * `n` - バッチ数
/// * `h` - 高さ
/// * `w` - 幅
/// * `y` - 出力先 (N, ΣC, H, W)
pub fn concat(inputs: &[(&[f32], usize)], n: usize, h: usize, w: usize, y: &mut [f32]) -> Result<()> {
    let hw = h * w;
    let c_total: usize = inputs.iter().map(|(_, c)| c).sum();
    for (i, (data, c)) in inputs.iter().enumerate() {
        ensure!(
            data.len() == n * c * hw,
            "concat input {} has {} elements, expected {}",
            i,
            data.len(),
            n * c * hw
        );
    }
    Shape::new(n, c_total, h, w).check(y.len(), "concat output")?;

    for ni in 0..n {
        let mut c_off = 0;
        for (data, c) in inputs {
            let src = &data[ni * c * hw..][..c * hw];
            let dst_base = (ni * c_total + c_off) * hw;
            y[dst_base..dst_base + c * hw].copy_from_slice(src);
            c_off += c;
        }
    }
    Ok(())
}

/// 最近傍補間で縦横2倍にアップサンプルします。
///
/// 各入力画素は出力の 2x2 ブロックに複製されます。
///
/// # Args
/// * `x` - 入力 (N, C, H, W)
/// * `shape` - 入力の形状
/// * `y` - 出力先 (N, C, 2H, 2W)
pub fn upsample_nearest2x(x: &[f32], shape: Shape, y: &mut [f32]) -> Result<()> {
    shape.check(x.len(), "upsample input")?;
    let out = shape.with_hw(shape.h * 2, shape.w * 2);
    out.check(y.len(), "upsample output")?;

    for ni in 0..shape.n {
        for ci in 0..shape.c {
            for ih in 0..shape.h {
                let src = &x[shape.offset(ni, ci, ih, 0)..][..shape.w];
                for oh in [ih * 2, ih * 2 + 1] {
                    let dst = &mut y[out.offset(ni, ci, oh, 0)..][..out.w];
                    for (pair, &v) in dst.chunks_exact_mut(2).zip(src) {
                        pair[0] = v;
                        pair[1] = v;
                    }
                }
            }
        }
    }
    Ok(())
}

/// 最大値プーリング
///
/// パディング位置は無視されます (ゼロとしては扱わない)。
///
/// # Args
/// * `x` - 入力 (N, C, H, W)
/// * `shape` - 入力の形状
/// * `k` - 正方カーネルのサイズ
/// * `stride` - ストライド
/// * `pad` - パディング
/// * `y` - 出力先
/// * `out_shape` - 出力の形状
pub fn maxpool2d(
    x: &[f32],
    shape: Shape,
    k: usize,
    stride: usize,
    pad: usize,
    y: &mut [f32],
    out_shape: Shape,
) -> Result<()> {
    ensure!(k > 0 && stride > 0, "maxpool: invalid kernel {} / stride {}", k, stride);
    ensure!(pad <= k / 2, "maxpool: pad {} exceeds half of kernel {}", pad, k);
    shape.check(x.len(), "maxpool input")?;
    let expected = crate::tensor::conv_out(shape.h, k, stride, pad)
        .zip(crate::tensor::conv_out(shape.w, k, stride, pad))
        .map(|(h, w)| shape.with_hw(h, w));
    ensure!(
        expected == Some(out_shape),
        "maxpool output shape {:?} does not match computed {:?}",
        out_shape,
        expected
    );
    out_shape.check(y.len(), "maxpool output")?;

    for ni in 0..shape.n {
        for ci in 0..shape.c {
            let plane = &x[shape.offset(ni, ci, 0, 0)..][..shape.plane()];
            for oh in 0..out_shape.h {
                let h0 = (oh * stride) as isize - pad as isize;
                let r0 = h0.max(0) as usize;
                let r1 = ((h0 + k as isize) as usize).min(shape.h);
                for ow in 0..out_shape.w {
                    let w0 = (ow * stride) as isize - pad as isize;
                    let q0 = w0.max(0) as usize;
                    let q1 = ((w0 + k as isize) as usize).min(shape.w);
                    let mut m = f32::NEG_INFINITY;
                    for r in r0..r1 {
                        for &v in &plane[r * shape.w + q0..r * shape.w + q1] {
                            if v > m {
                                m = v;
                            }
                        }
                    }
                    y[out_shape.offset(ni, ci, oh, ow)] = m;
                }
            }
        }
    }
    Ok(())
}

/// 残差接続: `y += x`
pub fn add_inplace(y: &mut [f32], x: &[f32]) -> Result<()> {
    ensure!(y.len() == x.len(), "residual add: {} vs {} elements", y.len(), x.len());
    y.iter_mut().zip(x).for_each(|(a, b)| *a += b);
    Ok(())
}
