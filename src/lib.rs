//! # YOLOv5n 推論ライブラリ
//!
//! このクレートは、YOLOv5n による物体検出を CPU 上の `f32` 演算だけで実行するRustライブラリです。
//!
//! ## 主な機能
//!
//! 1. **重みの読み込み**: 名前付きテンソルのバイナリ (`.bin` または `.tar.gz`) を読み込み、必要な重みを検証します。
//! 2. **前処理**: 画像をレターボックス処理して正規化した NCHW テンソルにします。
//! 3. **推論**: 24 レイヤのバックボーン/ネックと検出ヘッドを実行します。
//!    BN 版とバイアス版の重みは型パラメータで切り替えます。
//! 4. **後処理**: アンカーによるデコード、クラスごとの NMS、結果ファイルとハードウェア向けレコードへの出力を行います。
//!
//! ## Example
//! ```no_run
//! use yolo_v5n_infer::config::DetectConfig;
//! use yolo_v5n_infer::img_proc::PreprocessedImage;
//! use yolo_v5n_infer::weights::WeightStore;
//! use yolo_v5n_infer::yolov5n::YoloV5nFused;
//!
//! # fn main() -> anyhow::Result<()> {
//! let store = WeightStore::load("weights/yolov5n.bin")?;
//! let mut yolo = YoloV5nFused::new(&store, DetectConfig::default())?;
//! let img = PreprocessedImage::load("images/bus.bin")?;
//! let dets = yolo.detect(&img.data)?;
//! # Ok(())
//! # }
//! ```

pub mod activation;
pub mod arena;
pub mod blocks;
pub mod config;
pub mod conv2d;
pub mod conv_unit;
pub mod decode;
pub mod detect;
pub mod detection_result;
pub mod hw_detection;
pub mod img_proc;
pub mod layer_group;
pub mod layout;
pub mod nms;
pub mod postprocess;
pub mod tensor;
pub mod weights;
pub mod yolov5n;
