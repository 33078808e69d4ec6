//! 検出ヘッドの出力を最終的な検出結果に変換するモジュール

use anyhow::Result;
use log::debug;

use crate::config::DetectConfig;
use crate::decode::decode;
use crate::detect::HeadOutput;
use crate::detection_result::Detection;
use crate::nms::{nms, sort_by_confidence};

/// `post_process`関数は、検出ヘッドの出力から物体検出を行います
///
/// # Args
/// * `outputs` - スケールごとの検出ヘッドの出力
/// * `cfg` - 閾値や最大検出数などの設定
///
/// # Return
/// * コンフィデンス降順の検出結果
///
/// 閾値を超える候補が1つもない場合は空のベクトルを返します (エラーではありません)。
pub fn post_process(outputs: &[HeadOutput<'_>], cfg: &DetectConfig) -> Result<Vec<Detection>> {
    let mut candidates = decode(outputs, cfg)?;
    if candidates.is_empty() {
        return Ok(candidates);
    }

    sort_by_confidence(&mut candidates);
    let kept = nms(&candidates, cfg.iou_threshold, cfg.max_detections)?;
    debug!("post_process: {} candidates -> {} detections", candidates.len(), kept.len());
    Ok(kept)
}
