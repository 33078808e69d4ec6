use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use std::time::Instant;

use yolo_v5n_infer::activation::BN_EPS;
use yolo_v5n_infer::config::DetectConfig;
use yolo_v5n_infer::detection_result::{save_results, PixelBox};
use yolo_v5n_infer::hw_detection::encode_stream;
use yolo_v5n_infer::img_proc::{class_name, draw_bbox, letterbox, PreprocessedImage};
use yolo_v5n_infer::weights::WeightStore;
use yolo_v5n_infer::yolov5n::YoloV5nFused;

fn main() -> Result<()> {
    // 使い方: detect [重み (.bin / .tar.gz)] [画像 (.bin / .jpg など)] [出力ディレクトリ]
    let args: Vec<String> = std::env::args().collect();
    let wpath = args.get(1).map_or("demos/yolov5n.tar.gz", String::as_str);
    let ipath = args.get(2).map_or("demos/bus.jpg", String::as_str);
    let out_dir = Path::new(args.get(3).map_or("./out", String::as_str));

    let cfg = DetectConfig::default();

    // 重みを読み込み、BN をバイアスに畳み込む
    let store = WeightStore::load(wpath)?;
    let store = if store.find("model.0.bn.weight").is_some() {
        store.fuse_batch_norm(BN_EPS)?
    } else {
        store
    };
    let mut yolo = YoloV5nFused::new(&store, cfg.clone())?;

    // 前処理済みのコンテナならそのまま、それ以外は画像として読み込んでレターボックス処理
    let (input, original) = if ipath.ends_with(".bin") {
        (PreprocessedImage::load(ipath)?, None)
    } else {
        let img = image::open(ipath).with_context(|| format!("failed to open {}", ipath))?;
        (letterbox(&img, cfg.input_size as u32)?, Some(img))
    };

    let start = Instant::now();

    // YOLOの処理を開始
    let result = yolo.detect(&input.data)?;

    let t = start.elapsed().as_secs_f64() * 1000.0;
    for d in &result {
        println!("{:>14} {:.3} ({:.3}, {:.3}, {:.3}, {:.3})", class_name(d.class_id), d.confidence, d.x, d.y, d.w, d.h);
    }
    println!("Processing time:{:.03}ms, {:.1}FPS, {} detections", t, 1000. / t, result.len());

    fs::create_dir_all(out_dir)?;
    save_results(out_dir.join("results.txt"), &result)?;
    let hw = encode_stream(&result, cfg.input_size)?;
    fs::write(out_dir.join("detections.hw"), hw)?;

    // 元画像があればBBoxを描画して保存
    if let Some(img) = original {
        let boxes: Vec<PixelBox> = result.iter().map(|d| d.reverse_transform(&input.meta)).collect();
        let mut rgb_img = img.to_rgb8();
        draw_bbox(&mut rgb_img, &boxes, None, 20., 4.);
        rgb_img.save(out_dir.join("out.png"))?;
    }

    Ok(())
}
