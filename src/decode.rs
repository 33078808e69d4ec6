//! 検出ヘッドの出力から候補ボックスを取り出すアンカーベースのデコーダ

use anyhow::{ensure, Result};
use log::{debug, warn};

use crate::activation::sigmoid;
use crate::config::{DetectConfig, NUM_ANCHORS, NUM_SCALES};
use crate::detect::HeadOutput;
use crate::detection_result::Detection;

/// 1スケール分のチャネルの読み出し方
struct ScaleView<'a> {
    boxes: &'a [f32],
    classes: &'a [f32],
    /// アンカー a のボックス/オブジェクトネスの先頭チャネル
    box_stride: usize,
    /// アンカー a のクラスの先頭チャネル
    cls_stride: usize,
    cls_offset: usize,
    h: usize,
    w: usize,
}

impl<'a> ScaleView<'a> {
    fn new(out: &HeadOutput<'a>, nc: usize) -> Result<Self> {
        let view = match *out {
            HeadOutput::Fused { data, h, w } => {
                let no = 5 + nc;
                ensure!(
                    data.len() == NUM_ANCHORS * no * h * w,
                    "fused head map has {} values, expected {} for {}x{}",
                    data.len(),
                    NUM_ANCHORS * no * h * w,
                    h,
                    w
                );
                Self { boxes: data, classes: data, box_stride: no, cls_stride: no, cls_offset: 5, h, w }
            }
            HeadOutput::Split { boxes, classes, h, w } => {
                ensure!(
                    boxes.len() == NUM_ANCHORS * 5 * h * w,
                    "box map has {} values, expected {} for {}x{}",
                    boxes.len(),
                    NUM_ANCHORS * 5 * h * w,
                    h,
                    w
                );
                ensure!(
                    classes.len() == NUM_ANCHORS * nc * h * w,
                    "class map has {} values, expected {} for {}x{}",
                    classes.len(),
                    NUM_ANCHORS * nc * h * w,
                    h,
                    w
                );
                Self { boxes, classes, box_stride: 5, cls_stride: nc, cls_offset: 0, h, w }
            }
        };
        Ok(view)
    }

    #[inline]
    fn box_value(&self, a: usize, j: usize, spatial: usize) -> f32 {
        self.boxes[(a * self.box_stride + j) * self.h * self.w + spatial]
    }

    #[inline]
    fn class_value(&self, a: usize, c: usize, spatial: usize) -> f32 {
        self.classes[(a * self.cls_stride + self.cls_offset + c) * self.h * self.w + spatial]
    }
}

/// 3スケールの出力マップを候補ボックスにデコードします。
///
/// 走査順はスケール → 行 → 列 → アンカーです。`conf = sigmoid(obj) * max_c sigmoid(cls_c)` が
/// 閾値未満の候補は捨て、`max_detections` 件に達した時点で打ち切ります。
/// 最後に座標が非有限値の候補を順番を保ったまま取り除きます。
///
/// # Args
/// * `outputs` - スケールごとの出力マップ (ストライドの小さい順)
/// * `cfg` - 検出の設定
///
/// # Return
/// * 入力サイズで正規化した候補ボックス
pub fn decode(outputs: &[HeadOutput<'_>], cfg: &DetectConfig) -> Result<Vec<Detection>> {
    ensure!(outputs.len() == NUM_SCALES, "decode expects {} scales, got {}", NUM_SCALES, outputs.len());
    let nc = cfg.num_classes;
    let views = outputs.iter().map(|o| ScaleView::new(o, nc)).collect::<Result<Vec<_>>>()?;
    let input_size = cfg.input_size as f32;

    let mut dets = Vec::new();
    'scales: for (scale, v) in views.iter().enumerate() {
        let stride = cfg.strides[scale];
        let anchors = &cfg.anchors[scale];
        for y in 0..v.h {
            for x in 0..v.w {
                let spatial = y * v.w + x;
                for a in 0..NUM_ANCHORS {
                    let obj = sigmoid(v.box_value(a, 4, spatial));
                    let mut max_cls = 0.0f32;
                    let mut class_id = 0;
                    for c in 0..nc {
                        let p = sigmoid(v.class_value(a, c, spatial));
                        if p > max_cls {
                            max_cls = p;
                            class_id = c;
                        }
                    }
                    let confidence = obj * max_cls;
                    if confidence < cfg.conf_threshold {
                        continue;
                    }
                    if dets.len() >= cfg.max_detections {
                        break 'scales;
                    }

                    let tx = sigmoid(v.box_value(a, 0, spatial));
                    let ty = sigmoid(v.box_value(a, 1, spatial));
                    let tw = sigmoid(v.box_value(a, 2, spatial));
                    let th = sigmoid(v.box_value(a, 3, spatial));

                    let cx = (tx * 2.0 + (x as f32 - 0.5)) * stride;
                    let cy = (ty * 2.0 + (y as f32 - 0.5)) * stride;
                    let ww = (tw * 2.0) * (tw * 2.0) * anchors[a * 2];
                    let hh = (th * 2.0) * (th * 2.0) * anchors[a * 2 + 1];

                    dets.push(Detection {
                        x: cx / input_size,
                        y: cy / input_size,
                        w: ww / input_size,
                        h: hh / input_size,
                        confidence,
                        class_id: class_id as u32,
                    });
                }
            }
        }
    }

    let before = dets.len();
    dets.retain(Detection::is_finite);
    if dets.len() != before {
        warn!("decode: dropped {} boxes with non-finite coordinates", before - dets.len());
    }
    debug!("decode: {} candidates", dets.len());
    Ok(dets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeadLayout;

    const NC: usize = 3;

    fn cfg() -> DetectConfig {
        DetectConfig { input_size: 64, num_classes: NC, max_detections: 1000, ..Default::default() }
    }

    /// 全値が `fill` の Fused 出力マップ (8x8, 4x4, 2x2)
    fn fused_maps(fill: f32) -> Vec<(Vec<f32>, usize)> {
        [8, 4, 2].iter().map(|&g| (vec![fill; NUM_ANCHORS * (5 + NC) * g * g], g)).collect()
    }

    fn views(maps: &[(Vec<f32>, usize)]) -> Vec<HeadOutput<'_>> {
        maps.iter().map(|(d, g)| HeadOutput::Fused { data: d, h: *g, w: *g }).collect()
    }

    #[test]
    fn negative_logits_give_no_detections() {
        let maps = fused_maps(-20.0);
        assert!(decode(&views(&maps), &cfg()).unwrap().is_empty());
    }

    #[test]
    fn dense_input_is_capped() {
        let maps = fused_maps(10.0);
        let c = DetectConfig { max_detections: 7, ..cfg() };
        let dets = decode(&views(&maps), &c).unwrap();
        assert_eq!(dets.len(), 7);
        // 最初のスケールの (0, 0) セルのアンカー 0, 1, 2 から順に出てくる
        assert!((dets[0].w - dets[1].w).abs() > 0.0);
        assert!((dets[0].x - dets[3].x).abs() > 0.0);
    }

    #[test]
    fn decodes_single_cell_exactly() {
        let mut maps = fused_maps(-20.0);
        let (g, no) = (4, 5 + NC);
        let (y, x, a) = (2, 1, 1);
        let spatial = y * g + x;
        let plane = g * g;
        {
            let data = &mut maps[1].0;
            let ch = |j: usize| (a * no + j) * plane + spatial;
            data[ch(0)] = 0.0;
            data[ch(1)] = 0.0;
            data[ch(2)] = 0.0;
            data[ch(3)] = 0.0;
            data[ch(4)] = 20.0;
            data[ch(5 + 2)] = 20.0;
        }
        let dets = decode(&views(&maps), &cfg()).unwrap();
        assert_eq!(dets.len(), 1);
        let d = dets[0];
        assert_eq!(d.class_id, 2);
        assert!(d.confidence > 0.99);
        let stride = 16.0;
        assert!((d.x - (1.0 + x as f32 - 0.5) * stride / 64.0).abs() < 1e-6);
        assert!((d.y - (1.0 + y as f32 - 0.5) * stride / 64.0).abs() < 1e-6);
        // (0.5 * 2)^2 * anchor
        assert!((d.w - 62.0 / 64.0).abs() < 1e-6);
        assert!((d.h - 45.0 / 64.0).abs() < 1e-6);
    }

    #[test]
    fn class_ties_keep_first_index() {
        let maps = fused_maps(5.0);
        let dets = decode(&views(&maps), &DetectConfig { max_detections: 3, ..cfg() }).unwrap();
        assert!(dets.iter().all(|d| d.class_id == 0));
    }

    #[test]
    fn split_layout_matches_fused() {
        let fused = {
            let mut m = fused_maps(0.0);
            for (data, _) in m.iter_mut() {
                for (i, v) in data.iter_mut().enumerate() {
                    *v = ((i * 37 % 101) as f32 - 50.0) / 10.0;
                }
            }
            m
        };
        // Fused の [a][5 + nc] を box [a][5] と cls [a][nc] に分ける
        let split: Vec<(Vec<f32>, Vec<f32>, usize)> = fused
            .iter()
            .map(|(data, g)| {
                let plane = g * g;
                let mut boxes = Vec::new();
                let mut classes = Vec::new();
                for a in 0..NUM_ANCHORS {
                    let base = a * (5 + NC) * plane;
                    boxes.extend_from_slice(&data[base..base + 5 * plane]);
                    classes.extend_from_slice(&data[base + 5 * plane..base + (5 + NC) * plane]);
                }
                (boxes, classes, *g)
            })
            .collect();
        let split_views: Vec<HeadOutput<'_>> = split
            .iter()
            .map(|(b, c, g)| HeadOutput::Split { boxes: b, classes: c, h: *g, w: *g })
            .collect();

        let c = DetectConfig { conf_threshold: 0.3, ..cfg() };
        let a = decode(&views(&fused), &c).unwrap();
        let b = decode(&split_views, &DetectConfig { head: HeadLayout::Split, ..c.clone() }).unwrap();
        assert!(!a.is_empty());
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_wrong_map_sizes() {
        let maps = fused_maps(0.0);
        let mut v = views(&maps);
        v.pop();
        assert!(decode(&v, &cfg()).is_err());

        let short = vec![0.0; 10];
        let bad = [HeadOutput::Fused { data: &short, h: 8, w: 8 }, v[0], v[1]];
        assert!(decode(&bad, &cfg()).is_err());
    }
}
