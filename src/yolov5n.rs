//! YOLOv5n のモデルを実行するモジュール

use anyhow::{bail, ensure, Context, Result};
use log::{debug, info};

use crate::arena::{Arena, Slots};
use crate::blocks::{Sppf, C3, SCRATCH_SLOTS};
use crate::config::{DetectConfig, NUM_SCALES};
use crate::conv2d::ConvGeom;
use crate::conv_unit::{ConvBn, ConvFused, ConvUnit};
use crate::detect::{DetectHead, HeadMaps};
use crate::detection_result::Detection;
use crate::img_proc::PreprocessedImage;
use crate::layer_group::{infer_shapes, yolov5n, LayerGroup, LayerKind, Source, HEAD_FROM};
use crate::layout::{concat, upsample_nearest2x};
use crate::postprocess;
use crate::tensor::Shape;
use crate::weights::{WeightSpec, WeightStore};

/// BN を畳み込む前の重みで動かすモデル
pub type YoloV5nBn<'w> = YoloV5n<'w, ConvBn<'w>>;
/// BN をバイアスに畳み込んだ重みで動かすモデル
pub type YoloV5nFused<'w> = YoloV5n<'w, ConvFused<'w>>;

/// 読み込み済みの1レイヤ
#[derive(Debug)]
enum Stage<U> {
    Conv(U),
    C3(C3<U>),
    Sppf(Sppf<U>),
    Upsample,
    Concat,
}

impl<'w, U: ConvUnit<'w>> Stage<U> {
    fn load(store: &'w WeightStore, index: usize, layer: &LayerGroup, input: Shape) -> Result<Self> {
        let prefix = LayerGroup::prefix(index);
        let stage = match layer.kind {
            LayerKind::Conv { c_out, k, s, p } => {
                Stage::Conv(U::load(store, &prefix, ConvGeom::square(input.c, c_out, k, s, p))?)
            }
            LayerKind::C3 { c_out, n, shortcut } => Stage::C3(C3::load(store, &prefix, input.c, c_out, n, shortcut)?),
            LayerKind::Sppf { c_out, k } => Stage::Sppf(Sppf::load(store, &prefix, input.c, c_out, k)?),
            LayerKind::Upsample => Stage::Upsample,
            LayerKind::Concat => Stage::Concat,
        };
        Ok(stage)
    }

    fn manifest(index: usize, layer: &LayerGroup, input: Shape) -> Vec<WeightSpec> {
        let prefix = LayerGroup::prefix(index);
        match layer.kind {
            LayerKind::Conv { c_out, k, s, p } => U::manifest(&prefix, &ConvGeom::square(input.c, c_out, k, s, p)),
            LayerKind::C3 { c_out, n, .. } => C3::<U>::manifest(&prefix, input.c, c_out, n),
            LayerKind::Sppf { c_out, .. } => Sppf::<U>::manifest(&prefix, input.c, c_out),
            LayerKind::Upsample | LayerKind::Concat => Vec::new(),
        }
    }

    /// 1スロットに必要な要素数
    fn scratch_len(&self, input: Shape) -> usize {
        match self {
            Stage::C3(b) => b.scratch_len(input),
            Stage::Sppf(b) => b.scratch_len(input),
            Stage::Conv(_) | Stage::Upsample | Stage::Concat => 0,
        }
    }

    fn forward(&self, inputs: &[(&[f32], Shape)], y: &mut [f32], out: Shape, slots: Slots<'_>) -> Result<()> {
        let (x, shape) = *inputs.first().context("stage has no inputs")?;
        match self {
            Stage::Conv(u) => {
                u.forward(x, shape, y)?;
            }
            Stage::C3(b) => {
                b.forward(x, shape, y, slots)?;
            }
            Stage::Sppf(b) => {
                b.forward(x, shape, y, slots)?;
            }
            Stage::Upsample => upsample_nearest2x(x, shape, y)?,
            Stage::Concat => {
                let parts: Vec<(&[f32], usize)> = inputs.iter().map(|&(d, s)| (d, s.c)).collect();
                concat(&parts, out.n, out.h, out.w, y)?;
            }
        }
        Ok(())
    }
}

/// YOLOv5n のモデルを実行する構造体
///
/// 畳み込み単位 `U` で BN 版 ([`ConvBn`]) と バイアス版 ([`ConvFused`]) を切り替えます。
/// レイヤの出力バッファ、検出ヘッドの出力マップ、ブロック内部のスクラッチ領域は
/// すべて構築時に確保し、推論のたびに使い回します。
#[derive(Debug)]
pub struct YoloV5n<'w, U> {
    cfg: DetectConfig,
    layers: Vec<LayerGroup>,
    stages: Vec<Stage<U>>,
    head: DetectHead<'w, U>,
    input_shape: Shape,
    shapes: Vec<Shape>,
    outputs: Vec<Vec<f32>>,
    maps: HeadMaps,
    arena: Arena,
}

impl<'w, U: ConvUnit<'w>> YoloV5n<'w, U> {
    /// 新しい `YoloV5n` インスタンスを作成します。
    ///
    /// 必要な重みがすべてストアにあり形状が正しいことを先に検証します。
    ///
    /// # Args
    /// * `store` - ウェイトストア
    /// * `cfg` - 検出の設定
    ///
    /// # Return
    /// * 新たな `YoloV5n` インスタンス
    pub fn new(store: &'w WeightStore, cfg: DetectConfig) -> Result<Self> {
        cfg.validate()?;
        let layers = yolov5n();
        let input_shape = Shape::new(1, 3, cfg.input_size, cfg.input_size);
        let shapes = infer_shapes(&layers, input_shape)?;

        store
            .validate(&Self::manifest_for(&layers, &shapes, input_shape, &cfg)?)
            .context("weight store does not match YOLOv5n")?;

        let mut stages = Vec::with_capacity(layers.len());
        for (i, layer) in layers.iter().enumerate() {
            let input = Self::first_input(&layers, &shapes, input_shape, i)?;
            let stage = Stage::<U>::load(store, i, layer, input)
                .with_context(|| format!("failed to load layer {}", i))?;
            stages.push(stage);
        }
        let head = DetectHead::<U>::load(store, &Self::head_channels(&shapes), &cfg)?;

        let head_shapes = Self::head_shapes(&shapes);
        let mut slot_len = head.scratch_len(&head_shapes);
        for (i, stage) in stages.iter().enumerate() {
            let input = Self::first_input(&layers, &shapes, input_shape, i)?;
            slot_len = slot_len.max(stage.scratch_len(input));
        }
        let arena = Arena::new(slot_len, SCRATCH_SLOTS)?;
        let outputs = shapes.iter().map(|s| vec![0.0; s.len()]).collect();
        let maps = head.alloc_maps(&head_shapes);

        info!(
            "YOLOv5n ready: variant={}, head={:?}, input={}, classes={}, arena={} floats ({} x {})",
            U::VARIANT,
            head.layout(),
            cfg.input_size,
            cfg.num_classes,
            arena.len(),
            SCRATCH_SLOTS,
            slot_len
        );

        Ok(Self {
            cfg,
            layers,
            stages,
            head,
            input_shape,
            shapes,
            outputs,
            maps,
            arena,
        })
    }

    /// 設定 `cfg` でモデルが必要とする重みの一覧
    pub fn manifest(cfg: &DetectConfig) -> Result<Vec<WeightSpec>> {
        let layers = yolov5n();
        let input_shape = Shape::new(1, 3, cfg.input_size, cfg.input_size);
        let shapes = infer_shapes(&layers, input_shape)?;
        Self::manifest_for(&layers, &shapes, input_shape, cfg)
    }

    fn manifest_for(
        layers: &[LayerGroup],
        shapes: &[Shape],
        input_shape: Shape,
        cfg: &DetectConfig,
    ) -> Result<Vec<WeightSpec>> {
        let mut m = Vec::new();
        for (i, layer) in layers.iter().enumerate() {
            let input = Self::first_input(layers, shapes, input_shape, i)?;
            m.extend(Stage::<U>::manifest(i, layer, input));
        }
        m.extend(DetectHead::<U>::manifest(&Self::head_channels(shapes), cfg));
        Ok(m)
    }

    fn first_input(layers: &[LayerGroup], shapes: &[Shape], input_shape: Shape, index: usize) -> Result<Shape> {
        match layers[index].sources(index)?.first() {
            Some(Source::Input) => Ok(input_shape),
            Some(&Source::Layer(j)) => Ok(shapes[j]),
            None => bail!("layer {} has no inputs", index),
        }
    }

    fn head_shapes(shapes: &[Shape]) -> [Shape; NUM_SCALES] {
        HEAD_FROM.map(|i| shapes[i])
    }

    fn head_channels(shapes: &[Shape]) -> [usize; NUM_SCALES] {
        HEAD_FROM.map(|i| shapes[i].c)
    }

    pub fn config(&self) -> &DetectConfig {
        &self.cfg
    }

    /// ネットワーク入力の形状 (1, 3, size, size)
    pub fn input_shape(&self) -> Shape {
        self.input_shape
    }

    /// レイヤごとの出力形状
    pub fn layer_shapes(&self) -> &[Shape] {
        &self.shapes
    }

    /// スクラッチ領域の要素数
    pub fn arena_len(&self) -> usize {
        self.arena.len()
    }

    /// ネットワークを実行し、検出ヘッドの出力マップを返します。
    ///
    /// # Args
    /// * `input` - 正規化済みの NCHW 入力 (`3 * size * size` 要素)
    pub fn forward(&mut self, input: &[f32]) -> Result<&HeadMaps> {
        self.input_shape.check(input.len(), "network input")?;

        for i in 0..self.stages.len() {
            let sources = self.layers[i].sources(i)?;
            let (done, rest) = self.outputs.split_at_mut(i);
            let done: &[Vec<f32>] = done;
            let y = &mut rest[0];
            let inputs: Vec<(&[f32], Shape)> = sources
                .iter()
                .map(|s| match *s {
                    Source::Input => (input, self.input_shape),
                    Source::Layer(j) => (done[j].as_slice(), self.shapes[j]),
                })
                .collect();
            self.stages[i]
                .forward(&inputs, y, self.shapes[i], self.arena.slots())
                .with_context(|| format!("layer {} ({:?}) failed", i, self.layers[i].kind))?;
            debug!("layer {:2} {:?} -> {:?}", i, self.layers[i].kind, self.shapes[i]);
        }

        let feats = HEAD_FROM.map(|i| (self.outputs[i].as_slice(), self.shapes[i]));
        self.head.forward(feats, &mut self.maps, self.arena.slots())?;
        debug!("detect head ({:?}) done", self.head.layout());
        Ok(&self.maps)
    }

    /// 前処理済みの画像を入力として推論します。
    pub fn forward_image(&mut self, img: &PreprocessedImage) -> Result<&HeadMaps> {
        ensure!(
            img.meta.size as usize == self.cfg.input_size,
            "image size {} does not match model input {}",
            img.meta.size,
            self.cfg.input_size
        );
        self.forward(&img.data)
    }

    /// 推論、デコード、NMS までを実行します。
    ///
    /// # Args
    /// * `input` - 正規化済みの NCHW 入力
    ///
    /// # Return
    /// * コンフィデンス降順の検出結果 (入力サイズで正規化した中心・サイズ)
    pub fn detect(&mut self, input: &[f32]) -> Result<Vec<Detection>> {
        self.forward(input)?;
        postprocess::post_process(&self.maps.views(), &self.cfg)
    }
}
