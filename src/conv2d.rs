//! NCHW 畳み込み (groups = 1) のモジュール
//!
//! 2つの経路を持ちます。
//!
//! * [`conv2d`] - 出力平面を 8x8 のタイルに分け、出力チャネルを最大 32 ずつまとめて処理する最適化版。
//!   タイル全体がパディングに触れない (内側) かを一度だけ判定し、内側のタイルでは画素ごとの境界チェックを省きます。
//! * [`conv2d_reference`] - 素直な多重ループによる参照実装。テストで最適化版と比較するために使います。
//!
//! 重みは OIHW (出力チャネル, 入力チャネル, カーネル高さ, カーネル幅) の順に並んでいるものとします。

use anyhow::{bail, ensure, Context, Result};

use crate::tensor::{conv_out, Shape};

/// タイルの高さ
pub const TILE_H: usize = 8;
/// タイルの幅
pub const TILE_W: usize = 8;
/// 一度に処理する出力チャネル数
pub const OC_BLOCK: usize = 32;

/// 畳み込みの形状パラメータ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeom {
    /// 入力チャネル数
    pub c_in: usize,
    /// 出力チャネル数
    pub c_out: usize,
    /// カーネルの高さ
    pub kh: usize,
    /// カーネルの幅
    pub kw: usize,
    pub stride_h: usize,
    pub stride_w: usize,
    pub pad_h: usize,
    pub pad_w: usize,
    /// グループ数 (1 のみ対応)
    pub groups: usize,
}

impl ConvGeom {
    /// 正方カーネル・縦横同じストライドとパディングの `ConvGeom` を作成します。
    ///
    /// # Args
    /// * `c_in` - 入力チャネル数
    /// * `c_out` - 出力チャネル数
    /// * `k` - カーネルサイズ
    /// * `stride` - ストライド
    /// * `pad` - パディング
    pub const fn square(c_in: usize, c_out: usize, k: usize, stride: usize, pad: usize) -> Self {
        Self {
            c_in,
            c_out,
            kh: k,
            kw: k,
            stride_h: stride,
            stride_w: stride,
            pad_h: pad,
            pad_w: pad,
            groups: 1,
        }
    }

    /// 重みの要素数 (Cout * Cin * Kh * Kw)
    pub const fn weight_len(&self) -> usize {
        self.c_out * self.c_in * self.kh * self.kw
    }

    /// OIHW の重みの次元
    pub fn weight_dims(&self) -> Vec<usize> {
        vec![self.c_out, self.c_in, self.kh, self.kw]
    }

    /// 入力形状から出力形状を計算します。
    pub fn output_shape(&self, input: Shape) -> Result<Shape> {
        ensure!(
            input.c == self.c_in,
            "conv input has {} channels, expected {}",
            input.c,
            self.c_in
        );
        let h = conv_out(input.h, self.kh, self.stride_h, self.pad_h)
            .with_context(|| format!("invalid conv height: in={} geom={:?}", input.h, self))?;
        let w = conv_out(input.w, self.kw, self.stride_w, self.pad_w)
            .with_context(|| format!("invalid conv width: in={} geom={:?}", input.w, self))?;
        Ok(Shape::new(input.n, self.c_out, h, w))
    }
}

/// 呼び出し側が渡した形状とバッファの整合性を検証します。
fn validate(
    x: &[f32],
    in_shape: Shape,
    w: &[f32],
    bias: Option<&[f32]>,
    geom: &ConvGeom,
    y: &[f32],
    out_shape: Shape,
) -> Result<()> {
    if geom.groups != 1 {
        bail!("unsupported conv configuration: groups={} (only groups=1 is supported)", geom.groups);
    }
    in_shape.check(x.len(), "conv input")?;
    ensure!(
        w.len() == geom.weight_len(),
        "conv weight has {} elements, expected {} for {:?}",
        w.len(),
        geom.weight_len(),
        geom
    );
    if let Some(b) = bias {
        ensure!(b.len() == geom.c_out, "conv bias has {} elements, expected {}", b.len(), geom.c_out);
    }
    let expected = geom.output_shape(in_shape)?;
    ensure!(
        out_shape == expected,
        "conv output shape {:?} does not match computed {:?}",
        out_shape,
        expected
    );
    out_shape.check(y.len(), "conv output")
}

/// パディングに触れない出力インデックスの範囲 `[lo, hi)` を返します。
fn interior_range(input: usize, k: usize, stride: usize, pad: usize) -> (usize, usize) {
    let lo = (pad + stride - 1) / stride;
    let hi = if input + pad >= k { (input + pad - k) / stride + 1 } else { 0 };
    (lo, hi)
}

/// 境界チェックなしでカーネル窓と重みの内積を計算します。
#[inline]
fn window_dot(xc: &[f32], w_in: usize, ih0: usize, iw0: usize, wk: &[f32], kh: usize, kw: usize) -> f32 {
    let mut contrib = 0.0f32;
    for r in 0..kh {
        let x_row = &xc[(ih0 + r) * w_in + iw0..][..kw];
        let w_row = &wk[r * kw..][..kw];
        for (xv, wv) in x_row.iter().zip(w_row) {
            contrib += xv * wv;
        }
    }
    contrib
}

/// 画素ごとに境界をチェックしながら内積を計算します (ゼロパディング)。
#[inline]
fn window_dot_padded(
    xc: &[f32],
    h_in: usize,
    w_in: usize,
    oh: usize,
    ow: usize,
    wk: &[f32],
    geom: &ConvGeom,
) -> f32 {
    let mut contrib = 0.0f32;
    for r in 0..geom.kh {
        let ih = (oh * geom.stride_h + r) as isize - geom.pad_h as isize;
        if ih < 0 || ih >= h_in as isize {
            continue;
        }
        let x_row = &xc[ih as usize * w_in..][..w_in];
        for q in 0..geom.kw {
            let iw = (ow * geom.stride_w + q) as isize - geom.pad_w as isize;
            if iw < 0 || iw >= w_in as isize {
                continue;
            }
            contrib += x_row[iw as usize] * wk[r * geom.kw + q];
        }
    }
    contrib
}

/// タイル化した畳み込みを実行します。
///
/// # Args
/// * `x` - 入力テンソル (N, Cin, Hin, Win)
/// * `in_shape` - 入力の形状
/// * `w` - 重み (Cout, Cin, Kh, Kw)
/// * `bias` - 出力チャネルごとのバイアス
/// * `geom` - 畳み込みのパラメータ
/// * `y` - 出力先 (N, Cout, Hout, Wout)
/// * `out_shape` - 出力の形状。標準の出力サイズ式と一致しなければエラー
pub fn conv2d(
    x: &[f32],
    in_shape: Shape,
    w: &[f32],
    bias: Option<&[f32]>,
    geom: &ConvGeom,
    y: &mut [f32],
    out_shape: Shape,
) -> Result<()> {
    validate(x, in_shape, w, bias, geom, y, out_shape)?;

    let (h_in, w_in) = (in_shape.h, in_shape.w);
    let (h_out, w_out) = (out_shape.h, out_shape.w);
    let (oh_lo, oh_hi) = interior_range(h_in, geom.kh, geom.stride_h, geom.pad_h);
    let (ow_lo, ow_hi) = interior_range(w_in, geom.kw, geom.stride_w, geom.pad_w);

    let plane_in = in_shape.plane();
    let plane_out = out_shape.plane();
    let w_ic = geom.kh * geom.kw;
    let w_oc = geom.c_in * w_ic;

    // 累積バッファ [dh][dw][b]
    let mut acc = [0.0f32; TILE_H * TILE_W * OC_BLOCK];
    let at = |dh: usize, dw: usize, b: usize| (dh * TILE_W + dw) * OC_BLOCK + b;

    for ni in 0..in_shape.n {
        let xn = &x[ni * in_shape.batch_len()..][..in_shape.batch_len()];
        let yn = &mut y[ni * out_shape.batch_len()..][..out_shape.batch_len()];

        for oh0 in (0..h_out).step_by(TILE_H) {
            let oh_end = (oh0 + TILE_H).min(h_out);
            for ow0 in (0..w_out).step_by(TILE_W) {
                let ow_end = (ow0 + TILE_W).min(w_out);

                // タイル全体が内側かどうかは一度だけ判定する
                let tile_interior = oh0 >= oh_lo && oh_end <= oh_hi && ow0 >= ow_lo && ow_end <= ow_hi;

                for oc0 in (0..geom.c_out).step_by(OC_BLOCK) {
                    let n_oc = OC_BLOCK.min(geom.c_out - oc0);

                    for dh in 0..oh_end - oh0 {
                        for dw in 0..ow_end - ow0 {
                            for b in 0..n_oc {
                                acc[at(dh, dw, b)] = bias.map_or(0.0, |bs| bs[oc0 + b]);
                            }
                        }
                    }

                    // ic -> b -> dh -> dw: 1つのフィルタをタイル全体で使い回す
                    for ic in 0..geom.c_in {
                        let xc = &xn[ic * plane_in..][..plane_in];
                        for b in 0..n_oc {
                            let wk = &w[(oc0 + b) * w_oc + ic * w_ic..][..w_ic];

                            if tile_interior {
                                for oh in oh0..oh_end {
                                    let ih0 = oh * geom.stride_h - geom.pad_h;
                                    for ow in ow0..ow_end {
                                        let iw0 = ow * geom.stride_w - geom.pad_w;
                                        acc[at(oh - oh0, ow - ow0, b)] +=
                                            window_dot(xc, w_in, ih0, iw0, wk, geom.kh, geom.kw);
                                    }
                                }
                            } else {
                                for oh in oh0..oh_end {
                                    for ow in ow0..ow_end {
                                        let interior = oh >= oh_lo && oh < oh_hi && ow >= ow_lo && ow < ow_hi;
                                        let contrib = if interior {
                                            let ih0 = oh * geom.stride_h - geom.pad_h;
                                            let iw0 = ow * geom.stride_w - geom.pad_w;
                                            window_dot(xc, w_in, ih0, iw0, wk, geom.kh, geom.kw)
                                        } else {
                                            window_dot_padded(xc, h_in, w_in, oh, ow, wk, geom)
                                        };
                                        acc[at(oh - oh0, ow - ow0, b)] += contrib;
                                    }
                                }
                            }
                        }
                    }

                    for oh in oh0..oh_end {
                        for ow in ow0..ow_end {
                            for b in 0..n_oc {
                                yn[(oc0 + b) * plane_out + oh * w_out + ow] = acc[at(oh - oh0, ow - ow0, b)];
                            }
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

/// 多重ループによる参照実装の畳み込み
///
/// 引数は [`conv2d`] と同じです。
pub fn conv2d_reference(
    x: &[f32],
    in_shape: Shape,
    w: &[f32],
    bias: Option<&[f32]>,
    geom: &ConvGeom,
    y: &mut [f32],
    out_shape: Shape,
) -> Result<()> {
    validate(x, in_shape, w, bias, geom, y, out_shape)?;

    for ni in 0..out_shape.n {
        for oc in 0..geom.c_out {
            for oh in 0..out_shape.h {
                for ow in 0..out_shape.w {
                    let mut sum = bias.map_or(0.0, |b| b[oc]);
                    for ic in 0..geom.c_in {
                        for r in 0..geom.kh {
                            let ih = (oh * geom.stride_h + r) as isize - geom.pad_h as isize;
                            if ih < 0 || ih >= in_shape.h as isize {
                                continue;
                            }
                            for q in 0..geom.kw {
                                let iw = (ow * geom.stride_w + q) as isize - geom.pad_w as isize;
                                if iw < 0 || iw >= in_shape.w as isize {
                                    continue;
                                }
                                let xv = x[in_shape.offset(ni, ic, ih as usize, iw as usize)];
                                let wv = w[((oc * geom.c_in + ic) * geom.kh + r) * geom.kw + q];
                                sum += xv * wv;
                            }
                        }
                    }
                    y[out_shape.offset(ni, oc, oh, ow)] = sum;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// テスト用の決定的な擬似乱数 (xorshift)
    pub(crate) fn fill(len: usize, seed: u32, scale: f32) -> Vec<f32> {
        let mut s = seed.max(1);
        (0..len)
            .map(|_| {
                s ^= s << 13;
                s ^= s >> 17;
                s ^= s << 5;
                ((s % 2001) as f32 / 1000.0 - 1.0) * scale
            })
            .collect()
    }

    fn compare(n: usize, geom: ConvGeom, h: usize, w: usize, with_bias: bool) {
        compare_scaled(n, geom, h, w, with_bias, 0.5);
    }

    /// 重みを `[-w_scale, w_scale)` で埋めて最適化版と参照実装を比べます。
    fn compare_scaled(n: usize, geom: ConvGeom, h: usize, w: usize, with_bias: bool, w_scale: f32) {
        let in_shape = Shape::new(n, geom.c_in, h, w);
        let out_shape = geom.output_shape(in_shape).unwrap();
        let x = fill(in_shape.len(), 7, 1.0);
        let wt = fill(geom.weight_len(), 11, w_scale);
        let b = fill(geom.c_out, 13, 0.2);
        let bias = if with_bias { Some(b.as_slice()) } else { None };

        let mut fast = vec![0.0; out_shape.len()];
        let mut reference = vec![0.0; out_shape.len()];
        conv2d(&x, in_shape, &wt, bias, &geom, &mut fast, out_shape).unwrap();
        conv2d_reference(&x, in_shape, &wt, bias, &geom, &mut reference, out_shape).unwrap();

        let max_diff = fast
            .iter()
            .zip(&reference)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f32, f32::max);
        assert!(max_diff < 1e-4, "geom={:?} h={} w={} max_diff={}", geom, h, w, max_diff);
    }

    #[test]
    fn tiled_matches_reference_3x3_pad1() {
        compare(1, ConvGeom::square(3, 5, 3, 1, 1), 19, 13, true);
    }

    #[test]
    fn tiled_matches_reference_stride2() {
        compare(1, ConvGeom::square(4, 8, 3, 2, 1), 20, 20, false);
        compare(1, ConvGeom::square(3, 6, 6, 2, 2), 24, 18, true);
    }

    #[test]
    fn tiled_matches_reference_many_output_channels() {
        // OC_BLOCK をまたぐ出力チャネル数
        compare(1, ConvGeom::square(6, 70, 1, 1, 0), 9, 11, true);
        compare(2, ConvGeom::square(5, 40, 3, 1, 1), 17, 10, true);
    }

    #[test]
    fn tiled_matches_reference_at_network_depth() {
        // YOLOv5n の深い層と同じ入力チャネル数。重みは fan-in で正規化し、出力を 1 前後に保つ
        for &(c_in, c_out, stride) in &[(128usize, 40usize, 1usize), (256, 40, 1), (256, 34, 2)] {
            let scale = 1.0 / ((c_in * 9) as f32).sqrt();
            compare_scaled(1, ConvGeom::square(c_in, c_out, 3, stride, 1), 12, 12, true, scale);
        }
    }

    #[test]
    fn tiled_matches_reference_asymmetric() {
        let geom = ConvGeom {
            c_in: 2,
            c_out: 3,
            kh: 3,
            kw: 5,
            stride_h: 1,
            stride_w: 2,
            pad_h: 1,
            pad_w: 2,
            groups: 1,
        };
        compare(1, geom, 16, 23, true);
    }

    #[test]
    fn tiled_matches_reference_kernel_wider_than_input() {
        compare(1, ConvGeom::square(2, 3, 5, 1, 2), 3, 4, true);
    }

    #[test]
    fn identity_1x1_reproduces_input() {
        let geom = ConvGeom::square(1, 1, 1, 1, 0);
        let shape = Shape::new(1, 1, 9, 14);
        let x = fill(shape.len(), 3, 10.0);
        let mut y = vec![0.0; shape.len()];
        conv2d(&x, shape, &[1.0], Some(&[0.0f32][..]), &geom, &mut y, shape).unwrap();
        assert_eq!(x, y);
    }

    #[test]
    fn rejects_grouped_conv() {
        let geom = ConvGeom { groups: 2, ..ConvGeom::square(2, 2, 1, 1, 0) };
        let shape = Shape::new(1, 2, 4, 4);
        let x = vec![0.0; shape.len()];
        let mut y = vec![7.0; shape.len()];
        let err = conv2d(&x, shape, &[0.0; 4], None, &geom, &mut y, shape).unwrap_err();
        assert!(err.to_string().contains("groups"));
        // 失敗時は出力に書き込まない
        assert!(y.iter().all(|&v| v == 7.0));
    }

    #[test]
    fn rejects_wrong_output_shape() {
        let geom = ConvGeom::square(1, 1, 3, 2, 1);
        let in_shape = Shape::new(1, 1, 8, 8);
        let wrong = Shape::new(1, 1, 8, 8);
        let x = vec![0.0; in_shape.len()];
        let mut y = vec![0.0; wrong.len()];
        assert!(conv2d(&x, in_shape, &[0.0; 9], None, &geom, &mut y, wrong).is_err());
    }
}
