//! クラスごとの Non-Maximum Suppression (NMS)

use anyhow::{anyhow, ensure, Result};

use crate::detection_result::Detection;

/// 2つのボックスの IoU を計算します。
///
/// 中心・サイズ表現を左上・右下に変換して交差領域を求めます。
/// 重ならない場合と和集合の面積が 0 以下の場合は 0 を返します。
pub fn iou(a: &Detection, b: &Detection) -> f32 {
    let (ax1, ay1, ax2, ay2) = a.corners();
    let (bx1, by1, bx2, by2) = b.corners();

    let x1 = ax1.max(bx1);
    let y1 = ay1.max(by1);
    let x2 = ax2.min(bx2);
    let y2 = ay2.min(by2);
    if x2 < x1 || y2 < y1 {
        return 0.0;
    }

    let inter = (x2 - x1) * (y2 - y1);
    let union = (ax2 - ax1) * (ay2 - ay1) + (bx2 - bx1) * (by2 - by1) - inter;
    if union <= 0.0 {
        return 0.0;
    }
    inter / union
}

/// コンフィデンスの降順に安定ソートします。
///
/// 同じコンフィデンスの要素は元の順番を保ちます。
pub fn sort_by_confidence(dets: &mut [Detection]) {
    dets.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
}

/// 貪欲法による NMS
///
/// 入力はコンフィデンスの降順に並んでいる必要があります。
/// 先頭から順に残すボックスを決め、それ以降の同じクラスのボックスのうち IoU が
/// `iou_threshold` を超えるものを抑制します。残すボックスが `max_detections` 件に達したら終了します。
///
/// # Args
/// * `dets` - コンフィデンス降順の検出結果
/// * `iou_threshold` - 抑制する IoU の閾値
/// * `max_detections` - 出力の最大件数
///
/// # Return
/// * 残ったボックス (入力と同じ相対順序)
pub fn nms(dets: &[Detection], iou_threshold: f32, max_detections: usize) -> Result<Vec<Detection>> {
    ensure!(!dets.is_empty(), "nms called with no detections");

    let mut suppressed = vec![false; dets.len()];
    let mut kept = Vec::new();
    kept.try_reserve_exact(dets.len().min(max_detections))
        .map_err(|e| anyhow!("failed to allocate nms output: {}", e))?;

    for i in 0..dets.len() {
        if kept.len() >= max_detections {
            break;
        }
        if suppressed[i] {
            continue;
        }
        kept.push(dets[i]);

        for j in (i + 1)..dets.len() {
            if suppressed[j] || dets[i].class_id != dets[j].class_id {
                continue;
            }
            if iou(&dets[i], &dets[j]) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }
    Ok(kept)
}
