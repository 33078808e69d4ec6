//! YOLOに関する画像処理モジュール
//!
//! * 前処理済み画像コンテナ (`.bin`) の読み書き
//! * レターボックス処理 (アスペクト比を保ったリサイズ + 灰色パディング)
//! * 検出結果の描画

use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{ensure, Context, Result};
use image::imageops::FilterType;
use image::{DynamicImage, Pixel, Rgb, RgbImage};
use imageproc::drawing::draw_filled_rect_mut;
use imageproc::drawing::{draw_text_mut, text_size};
use imageproc::rect::Rect;
use rusttype::{Font, Scale};

use crate::detection_result::PixelBox;
use crate::tensor::Shape;

/// ヘッダのバイト数 (u32 * 2, f32, u32 * 3)
pub const HEADER_LEN: usize = 24;

/// レターボックスの余白の画素値
pub const PAD_VALUE: u8 = 114;

/// レターボックス処理のパラメータ
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageMeta {
    /// 元画像の幅
    pub orig_width: u32,
    /// 元画像の高さ
    pub orig_height: u32,
    /// リサイズの倍率
    pub scale: f32,
    /// 左の余白
    pub pad_x: u32,
    /// 上の余白
    pub pad_y: u32,
    /// 正方形の一辺
    pub size: u32,
}

/// 前処理済みの入力画像 (1, 3, size, size) と、元画像に戻すためのパラメータ
#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessedImage {
    pub meta: ImageMeta,
    /// 0..1 に正規化した NCHW の画素値
    pub data: Vec<f32>,
}

fn read_u32(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

impl PreprocessedImage {
    pub fn shape(&self) -> Shape {
        let s = self.meta.size as usize;
        Shape::new(1, 3, s, s)
    }

    /// コンテナのバイト列を解析します。
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        ensure!(buf.len() >= HEADER_LEN, "image file too short for header: {} bytes", buf.len());
        let meta = ImageMeta {
            orig_width: read_u32(buf, 0),
            orig_height: read_u32(buf, 4),
            scale: f32::from_bits(read_u32(buf, 8)),
            pad_x: read_u32(buf, 12),
            pad_y: read_u32(buf, 16),
            size: read_u32(buf, 20),
        };
        let numel = (meta.size as usize)
            .checked_mul(meta.size as usize)
            .and_then(|v| v.checked_mul(3))
            .with_context(|| format!("image size {} overflows", meta.size))?;
        let payload = &buf[HEADER_LEN..];
        ensure!(
            payload.len() >= numel * 4,
            "truncated image file: size {} needs {} bytes of pixels, got {}",
            meta.size,
            numel * 4,
            payload.len()
        );
        let data = payload[..numel * 4]
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        Ok(Self { meta, data })
    }

    /// ファイルから読み込みます。
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let buf = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_bytes(&buf).with_context(|| format!("failed to parse {}", path.display()))
    }

    /// コンテナ形式で書き出します。
    pub fn write_to<W: Write>(&self, mut w: W) -> Result<()> {
        let m = &self.meta;
        for v in [m.orig_width, m.orig_height, m.scale.to_bits(), m.pad_x, m.pad_y, m.size] {
            w.write_all(&v.to_le_bytes())?;
        }
        for v in &self.data {
            w.write_all(&v.to_le_bytes())?;
        }
        w.flush()?;
        Ok(())
    }
}

/// 画像をアスペクト比を保ってリサイズし、正方形に整形したYOLO入力データを生成します。
///
/// # Args
/// * `img` - 入力画像
/// * `size` - 正方形の一辺
///
/// # Return
/// * バイリニア補間でリサイズし、中央に配置して余白を灰色 (114) で埋め、255 で割った NCHW データ
pub fn letterbox(img: &DynamicImage, size: u32) -> Result<PreprocessedImage> {
    let (canvas, meta) = letterbox_img(img, size)?;
    let plane = (size * size) as usize;
    let mut data = vec![0.0; 3 * plane];
    for (x, y, pixel) in canvas.enumerate_pixels() {
        let base = (y * size + x) as usize;
        for c in 0..3 {
            data[c * plane + base] = pixel[c] as f32 / 255.0;
        }
    }
    Ok(PreprocessedImage { meta, data })
}

/// レターボックス処理したRGB画像とそのパラメータを返します。
pub fn letterbox_img(img: &DynamicImage, size: u32) -> Result<(RgbImage, ImageMeta)> {
    let (ow, oh) = (img.width(), img.height());
    ensure!(ow > 0 && oh > 0 && size > 0, "cannot letterbox {}x{} into {}", ow, oh, size);

    let scale = f32::min(size as f32 / ow as f32, size as f32 / oh as f32);
    let nw = ((ow as f32 * scale) as u32).clamp(1, size);
    let nh = ((oh as f32 * scale) as u32).clamp(1, size);
    let resized = img.resize_exact(nw, nh, FilterType::Triangle).to_rgb8();

    let pad_x = (size - nw) / 2;
    let pad_y = (size - nh) / 2;
    let mut canvas = RgbImage::from_pixel(size, size, Rgb([PAD_VALUE; 3]));
    for (x, y, &pixel) in resized.enumerate_pixels() {
        canvas.put_pixel(x + pad_x, y + pad_y, pixel);
    }

    let meta = ImageMeta { orig_width: ow, orig_height: oh, scale, pad_x, pad_y, size };
    Ok((canvas, meta))
}

/// COCO のクラス名
pub const COCO_CLASSES: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat",
    "dog", "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack",
    "umbrella", "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball",
    "kite", "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket",
    "bottle", "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple",
    "sandwich", "orange", "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair",
    "couch", "potted plant", "bed", "dining table", "toilet", "tv", "laptop", "mouse",
    "remote", "keyboard", "cell phone", "microwave", "oven", "toaster", "sink", "refrigerator",
    "book", "clock", "vase", "scissors", "teddy bear", "hair drier", "toothbrush",
];

/// クラスIDの表示名
pub fn class_name(class_id: u32) -> String {
    COCO_CLASSES
        .get(class_id as usize)
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("class_{}", class_id))
}

const COLORS: [[u8; 3]; 10] = [
    [255, 0, 0],
    [255, 255, 0],
    [0, 0, 255],
    [14, 23, 50],
    [28, 105, 80],
    [190, 159, 53],
    [46, 194, 148],
    [242, 30, 131],
    [97, 101, 198],
    [115, 11, 87],
];

/// 画像上に線を描画します。
///
/// # Args
///
/// * `img` - 線を描画する画像 (in-place)
/// * `x1`, `y1`, `x2`, `y2` - 線の始点と終点の座標
/// * `thickness` - 線の太さ
/// * `color` - 線の色
fn draw_line(img: &mut RgbImage, x1: f32, y1: f32, x2: f32, y2: f32, thickness: f32, color: Rgb<u8>) {
    let (bx, by) = (x1.min(x2) - (thickness / 2.).floor(), y1.min(y2) - (thickness / 2.).floor());

    let (w, h) = if x1 == x2 {
        (thickness, (y2 - y1).abs() + thickness)
    } else {
        ((x2 - x1).abs() + thickness, thickness)
    };

    let rect = Rect::at(bx as i32, by as i32).of_size((w as u32).max(1), (h as u32).max(1));
    draw_filled_rect_mut(img, rect, color);
}

/// 画像上に矩形を描画します。
fn draw_rect(img: &mut RgbImage, x1: f32, y1: f32, x2: f32, y2: f32, thickness: f32, color: Rgb<u8>) {
    draw_line(img, x1, y1, x1, y2, thickness, color);
    draw_line(img, x1, y2, x2, y2, thickness, color);
    draw_line(img, x1, y1, x2, y1, thickness, color);
    draw_line(img, x2, y1, x2, y2, thickness, color);
}

/// 画像上にラベルを描画します。
///
/// # Args
///
/// * `img` - ラベルを描画する画像 (in-place)
/// * `x1`, `y1` - ラベルの左上の座標
/// * `line_thickness` - ラベルの枠線の太さ
/// * `bg_color` - ラベルの背景色
/// * `font` - ラベルのフォント
/// * `font_size` - ラベルのフォントサイズ
/// * `text` - ラベルに表示するテキスト
#[allow(clippy::too_many_arguments)]
fn draw_label(
    img: &mut RgbImage,
    x1: f32,
    y1: f32,
    line_thickness: f32,
    bg_color: Rgb<u8>,
    font: &Font,
    font_size: f32,
    text: &str,
) {
    let label_h = font_size;
    let dx1 = x1 - (line_thickness / 2.).floor();
    let label_y = (y1 - label_h).max(0.);

    let pad = 6.;
    let scale = Scale::uniform(label_h);
    let (text_w, _) = text_size(scale, font, text);
    let v_metrics = font.v_metrics(scale);
    let text_h = v_metrics.ascent - v_metrics.descent + v_metrics.line_gap;

    let rect = Rect::at(dx1 as i32, label_y as i32)
        .of_size((text_w as f32 + pad * 2.) as u32, label_h.max(1.) as u32);
    draw_filled_rect_mut(img, rect, bg_color);

    let text_y = label_y + (label_h - text_h) / 2.;

    let text_color = if (bg_color[0] as i32 + bg_color[1] as i32 + bg_color[2] as i32) < 382 {
        Rgb([255u8, 255, 255])
    } else {
        Rgb([0u8, 0, 0])
    };
    draw_text_mut(img, text_color, (dx1 + pad) as i32, text_y as i32, scale, font, text);
}

/// 画像上にバウンディングボックスとラベルを描画します。
///
/// # Args
///
/// * `img` - 描画先の画像 (in-place)。ボックスの座標系の画像 (通常は元画像)
/// * `boxes` - 画素単位のボックス
/// * `font` - ラベルのフォント。`None` ならボックスだけを描画します
/// * `font_size` - ラベルのフォントサイズ
/// * `line_thickness` - バウンディングボックスの線の太さ
pub fn draw_bbox(img: &mut RgbImage, boxes: &[PixelBox], font: Option<&Font>, font_size: f32, line_thickness: f32) {
    let mut sorted = boxes.to_vec();
    sorted.sort_by(|a, b| a.confidence.total_cmp(&b.confidence));

    for d in sorted.iter() {
        let color: Rgb<u8> = *Rgb::from_slice(&COLORS[d.class_id as usize % COLORS.len()]);

        let x1 = d.x1.round();
        let y1 = d.y1.round();
        let x2 = d.x2.round();
        let y2 = d.y2.round();

        draw_rect(img, x1, y1, x2, y2, line_thickness, color);

        if let Some(font) = font {
            let text = format!("{}: {:.2}", class_name(d.class_id), d.confidence);
            draw_label(img, x1, y1, line_thickness, color, font, font_size, &text);
        }
    }
}
