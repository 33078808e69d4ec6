//! ハードウェアへ検出結果を渡すための固定長レコード
//!
//! レイアウト (リトルエンディアン、パディングなし、12 バイト):
//!
//! | offset | size | 内容 |
//! |--------|------|------|
//! | 0  | 2 | 中心 x (画素、切り捨て) |
//! | 2  | 2 | 中心 y (画素) |
//! | 4  | 2 | 幅 (画素) |
//! | 6  | 2 | 高さ (画素) |
//! | 8  | 1 | クラスID |
//! | 9  | 1 | コンフィデンス * 255 (切り捨て) |
//! | 10 | 2 | 予約 (0) |
//!
//! ストリームは先頭1バイトの件数とそれに続くレコードの列です。件数は最大 255 で、
//! それを超える検出結果は先頭の 255 件だけを書き出します。

use anyhow::{ensure, Context, Result};
use log::warn;

use crate::detection_result::Detection;

/// 入力画素単位の検出結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwDetection {
    pub x: u16,
    pub y: u16,
    pub w: u16,
    pub h: u16,
    pub class_id: u8,
    pub confidence: u8,
}

fn to_pixel(v: f32, input_size: usize) -> u16 {
    (v * input_size as f32).clamp(0.0, u16::MAX as f32) as u16
}

impl HwDetection {
    /// レコードのバイト数
    pub const SIZE: usize = 12;

    /// 正規化座標の検出結果を入力画素単位に変換します。
    pub fn from_detection(d: &Detection, input_size: usize) -> Result<Self> {
        let class_id = u8::try_from(d.class_id)
            .with_context(|| format!("class id {} does not fit in a hardware record", d.class_id))?;
        Ok(Self {
            x: to_pixel(d.x, input_size),
            y: to_pixel(d.y, input_size),
            w: to_pixel(d.w, input_size),
            h: to_pixel(d.h, input_size),
            class_id,
            confidence: (d.confidence * 255.0).clamp(0.0, 255.0) as u8,
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut b = [0u8; Self::SIZE];
        b[0..2].copy_from_slice(&self.x.to_le_bytes());
        b[2..4].copy_from_slice(&self.y.to_le_bytes());
        b[4..6].copy_from_slice(&self.w.to_le_bytes());
        b[6..8].copy_from_slice(&self.h.to_le_bytes());
        b[8] = self.class_id;
        b[9] = self.confidence;
        b
    }

    pub fn from_bytes(b: &[u8]) -> Result<Self> {
        ensure!(b.len() >= Self::SIZE, "hardware record needs {} bytes, got {}", Self::SIZE, b.len());
        let u16_at = |i: usize| u16::from_le_bytes([b[i], b[i + 1]]);
        Ok(Self {
            x: u16_at(0),
            y: u16_at(2),
            w: u16_at(4),
            h: u16_at(6),
            class_id: b[8],
            confidence: b[9],
        })
    }
}

/// 件数バイト + レコード列にエンコードします。
///
/// 件数は1バイトなので、255 件を超える場合は先頭の 255 件だけを書き出します。
pub fn encode_stream(dets: &[Detection], input_size: usize) -> Result<Vec<u8>> {
    let count = dets.len().min(u8::MAX as usize);
    if count < dets.len() {
        warn!("hardware stream holds {} of {} detections", count, dets.len());
    }
    let mut out = Vec::with_capacity(1 + count * HwDetection::SIZE);
    out.push(count as u8);
    for d in &dets[..count] {
        out.extend_from_slice(&HwDetection::from_detection(d, input_size)?.to_bytes());
    }
    Ok(out)
}

/// [`encode_stream`] の逆変換
pub fn decode_stream(buf: &[u8]) -> Result<Vec<HwDetection>> {
    let (&count, rest) = buf.split_first().context("empty detection stream")?;
    let count = count as usize;
    ensure!(
        rest.len() >= count * HwDetection::SIZE,
        "detection stream declares {} records but holds {} bytes",
        count,
        rest.len()
    );
    rest.chunks_exact(HwDetection::SIZE).take(count).map(HwDetection::from_bytes).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_layout_is_packed_little_endian() {
        let r = HwDetection { x: 0x0102, y: 0x0304, w: 0x0506, h: 0x0708, class_id: 9, confidence: 200 };
        assert_eq!(r.to_bytes(), [0x02, 0x01, 0x04, 0x03, 0x06, 0x05, 0x08, 0x07, 9, 200, 0, 0]);
        assert_eq!(HwDetection::from_bytes(&r.to_bytes()).unwrap(), r);
    }

    #[test]
    fn converts_normalized_boxes_to_pixels() {
        let d = Detection { x: 0.5, y: 0.25, w: 0.125, h: 1.0, confidence: 1.0, class_id: 17 };
        let r = HwDetection::from_detection(&d, 640).unwrap();
        assert_eq!((r.x, r.y, r.w, r.h), (320, 160, 80, 640));
        assert_eq!((r.class_id, r.confidence), (17, 255));

        let too_big = Detection { class_id: 300, ..d };
        assert!(HwDetection::from_detection(&too_big, 640).is_err());
    }

    #[test]
    fn pixels_and_confidence_are_truncated() {
        let d = Detection { x: 0.999, y: 0.01, w: 0.5, h: 0.5, confidence: 0.5, class_id: 0 };
        let r = HwDetection::from_detection(&d, 64).unwrap();
        // 63.936 -> 63, 0.64 -> 0, 127.5 -> 127
        assert_eq!((r.x, r.y), (63, 0));
        assert_eq!(r.confidence, 127);

        let out_of_range = Detection { x: -0.1, confidence: 1.5, ..d };
        let r = HwDetection::from_detection(&out_of_range, 64).unwrap();
        assert_eq!((r.x, r.confidence), (0, 255));
    }

    #[test]
    fn stream_starts_with_count() {
        let d = Detection { x: 0.5, y: 0.5, w: 0.5, h: 0.5, confidence: 0.5, class_id: 1 };
        let buf = encode_stream(&[d, d], 64).unwrap();
        assert_eq!(buf.len(), 1 + 2 * HwDetection::SIZE);
        assert_eq!(buf[0], 2);
        let recs = decode_stream(&buf).unwrap();
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].x, 32);
        assert_eq!(recs[0].confidence, 127);
        assert!(decode_stream(&buf[..buf.len() - 1]).is_err());
    }

    #[test]
    fn stream_keeps_first_255_records() {
        let dets: Vec<Detection> = (0..300)
            .map(|i| Detection { x: 0.5, y: 0.5, w: 0.25, h: 0.25, confidence: 0.9, class_id: i % 80 })
            .collect();
        let buf = encode_stream(&dets, 640).unwrap();
        assert_eq!(buf[0], 255);
        assert_eq!(buf.len(), 1 + 255 * HwDetection::SIZE);
        let recs = decode_stream(&buf).unwrap();
        assert_eq!(recs.len(), 255);
        assert_eq!(recs[254].class_id, (254 % 80) as u8);

        assert_eq!(encode_stream(&[], 640).unwrap(), vec![0]);
    }
}
