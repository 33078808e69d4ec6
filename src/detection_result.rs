//! 物体検出の結果を処理するモジュール

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use log::info;

use crate::img_proc::ImageMeta;

/// 1つの検出結果
///
/// 座標はネットワーク入力サイズで正規化した中心 (x, y) と幅・高さです。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    /// 中心のx
    pub x: f32,
    /// 中心のy
    pub y: f32,
    /// 幅
    pub w: f32,
    /// 高さ
    pub h: f32,
    /// コンフィデンス (objectness * クラス確率)
    pub confidence: f32,
    /// クラス
    pub class_id: u32,
}

/// 元画像の座標系に戻したバウンディングボックス (画素単位の左上・右下)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
    pub class_id: u32,
}

impl Detection {
    /// 左上・右下の座標 (正規化座標のまま)
    pub fn corners(&self) -> (f32, f32, f32, f32) {
        let (hw, hh) = (self.w / 2.0, self.h / 2.0);
        (self.x - hw, self.y - hh, self.x + hw, self.y + hh)
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.w.is_finite() && self.h.is_finite()
    }

    /// 検出結果の座標を元の画像の座標系に戻します。
    ///
    /// # Args
    /// * `meta` - レターボックス処理のパラメータ
    ///
    /// # Return
    /// * 元画像の範囲にクリップした画素単位のボックス
    pub fn reverse_transform(&self, meta: &ImageMeta) -> PixelBox {
        let size = meta.size as f32;
        let (x1, y1, x2, y2) = self.corners();
        let (x1, y1) = point_reverse_transform(meta, x1 * size, y1 * size);
        let (x2, y2) = point_reverse_transform(meta, x2 * size, y2 * size);
        PixelBox { x1, y1, x2, y2, confidence: self.confidence, class_id: self.class_id }
    }
}

/// ネットワーク入力上の座標を元の画像の座標系に戻します。
///
/// # Args
/// * `meta` - レターボックス処理のパラメータ
/// * `x` - x座標 (入力画素単位)
/// * `y` - y座標 (入力画素単位)
///
/// # Return
/// * 新たな座標 (x, y)
fn point_reverse_transform(meta: &ImageMeta, x: f32, y: f32) -> (f32, f32) {
    let ox = ((x - meta.pad_x as f32) / meta.scale).clamp(0.0, meta.orig_width as f32);
    let oy = ((y - meta.pad_y as f32) / meta.scale).clamp(0.0, meta.orig_height as f32);
    (ox, oy)
}

/// 検出結果をテキスト形式で書き出します。
///
/// 先頭に `#` で始まるヘッダ行、続いて1行1件で `class_id confidence x y w h` を出力します。
pub fn write_results<W: Write>(mut w: W, dets: &[Detection]) -> Result<()> {
    writeln!(w, "# YOLOv5n Detection Results")?;
    writeln!(w, "# Detections: {}", dets.len())?;
    writeln!(w, "# Format: class_id confidence x y w h")?;
    writeln!(w)?;
    for d in dets {
        writeln!(
            w,
            "{} {:.6} {:.6} {:.6} {:.6} {:.6}",
            d.class_id, d.confidence, d.x, d.y, d.w, d.h
        )?;
    }
    w.flush()?;
    Ok(())
}

/// 検出結果をファイルに保存します。
pub fn save_results<P: AsRef<Path>>(path: P, dets: &[Detection]) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    write_results(BufWriter::new(file), dets).with_context(|| format!("failed to write {}", path.display()))?;
    info!("saved {} detections to {}", dets.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x: f32, y: f32, w: f32, h: f32) -> Detection {
        Detection { x, y, w, h, confidence: 0.5, class_id: 3 }
    }

    #[test]
    fn result_lines_have_six_fields() {
        let mut buf = Vec::new();
        write_results(&mut buf, &[det(0.5, 0.25, 0.1, 0.2)]).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().filter(|l| !l.starts_with('#') && !l.is_empty()).collect();
        assert_eq!(lines, vec!["3 0.500000 0.500000 0.250000 0.100000 0.200000"]);
        assert!(text.contains("# Detections: 1"));
    }

    #[test]
    fn reverse_transform_undoes_letterbox() {
        // 1280x640 を 640 にレターボックス: scale 0.5, 上下に 160 の余白
        let meta = ImageMeta { orig_width: 1280, orig_height: 640, scale: 0.5, pad_x: 0, pad_y: 160, size: 640 };
        let d = det(0.5, 0.5, 0.25, 0.125);
        let b = d.reverse_transform(&meta);
        assert!((b.x1 - 480.0).abs() < 1e-3);
        assert!((b.x2 - 800.0).abs() < 1e-3);
        assert!((b.y1 - 240.0).abs() < 1e-3);
        assert!((b.y2 - 400.0).abs() < 1e-3);
    }

    #[test]
    fn reverse_transform_clips_to_image() {
        let meta = ImageMeta { orig_width: 100, orig_height: 100, scale: 1.0, pad_x: 0, pad_y: 0, size: 100 };
        let b = det(0.0, 1.0, 0.5, 0.5).reverse_transform(&meta);
        assert_eq!((b.x1, b.y2), (0.0, 100.0));
    }
}
