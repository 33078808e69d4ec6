//! 検出パイプラインの設定
//!
//! 既定値は COCO で学習した YOLOv5n (入力 640x640, 80 クラス) に合わせています。

use anyhow::{ensure, Result};

/// 検出ヘッドのスケール数 (P3, P4, P5)
pub const NUM_SCALES: usize = 3;
/// 1グリッドセルあたりのアンカー数
pub const NUM_ANCHORS: usize = 3;

/// 検出ヘッドの形
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadLayout {
    /// スケールごとに 1x1 畳み込み1つで `3 * (5 + nc)` チャネルを出力
    Fused,
    /// ボックス/オブジェクトネス (`3 * 5` チャネル) とクラス (`3 * nc` チャネル) を別々の枝で出力
    Split,
}

/// 検出の設定
#[derive(Debug, Clone, PartialEq)]
pub struct DetectConfig {
    /// ネットワーク入力の一辺 (正方形)
    pub input_size: usize,
    /// クラス数
    pub num_classes: usize,
    /// 信頼度の閾値。`obj * cls` がこれ未満の候補は捨てます
    pub conf_threshold: f32,
    /// NMS の IoU 閾値
    pub iou_threshold: f32,
    /// デコード・NMS それぞれの最大検出数
    pub max_detections: usize,
    /// スケールごとのストライド
    pub strides: [f32; NUM_SCALES],
    /// スケールごとのアンカー (w, h) × 3 (入力画素単位)
    pub anchors: [[f32; 2 * NUM_ANCHORS]; NUM_SCALES],
    pub head: HeadLayout,
}

impl Default for DetectConfig {
    fn default() -> Self {
        Self {
            input_size: 640,
            num_classes: 80,
            conf_threshold: 0.25,
            iou_threshold: 0.45,
            max_detections: 300,
            strides: [8.0, 16.0, 32.0],
            anchors: [
                [10.0, 13.0, 16.0, 30.0, 33.0, 23.0],
                [30.0, 61.0, 62.0, 45.0, 59.0, 119.0],
                [116.0, 90.0, 156.0, 198.0, 373.0, 326.0],
            ],
            head: HeadLayout::Fused,
        }
    }
}

impl DetectConfig {
    /// 1アンカーあたりのチャネル数 (x, y, w, h, obj, cls...)
    pub fn outputs_per_anchor(&self) -> usize {
        5 + self.num_classes
    }

    /// 設定値の整合性を検証します。
    pub fn validate(&self) -> Result<()> {
        let max_stride = self.strides.iter().fold(0.0f32, |m, &s| m.max(s));
        ensure!(
            self.strides.iter().all(|&s| s >= 1.0 && s.fract() == 0.0),
            "strides must be positive integers: {:?}",
            self.strides
        );
        ensure!(
            self.input_size > 0 && self.input_size % max_stride as usize == 0,
            "input size {} must be a positive multiple of the largest stride {}",
            self.input_size,
            max_stride
        );
        ensure!(
            (1..=256).contains(&self.num_classes),
            "number of classes must be in 1..=256, got {}",
            self.num_classes
        );
        ensure!(
            (0.0..=1.0).contains(&self.conf_threshold),
            "confidence threshold out of range: {}",
            self.conf_threshold
        );
        ensure!(
            (0.0..=1.0).contains(&self.iou_threshold),
            "IoU threshold out of range: {}",
            self.iou_threshold
        );
        ensure!(self.max_detections > 0, "max detections must be positive");
        ensure!(
            self.anchors.iter().flatten().all(|&a| a.is_finite() && a > 0.0),
            "anchors must be positive: {:?}",
            self.anchors
        );
        Ok(())
    }
}
