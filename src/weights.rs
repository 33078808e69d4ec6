//! 学習済みパラメータを名前で引くためのウェイトストア
//!
//! コンテナ形式 (すべてリトルエンディアン):
//!
//! ```text
//! u32 テンソル数
//! テンソルごとに:
//!   u32 名前の長さ, 名前 (終端文字なし)
//!   u32 次元数 (<= 8), u32 * 次元数
//!   f32 * 要素数
//! ```
//!
//! `.bin` をそのまま読むか、`.bin` を1つ含む tar.gz アーカイブから読みます。

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, ensure, Context, Result};
use flate2::read::GzDecoder;
use log::{debug, info, warn};

use crate::activation::BatchNorm;

/// 名前の最大長
pub const MAX_NAME_LEN: usize = 1024;
/// 次元数の上限
pub const MAX_DIMS: usize = 8;

/// 名前付きの重みテンソル
#[derive(Debug, Clone, PartialEq)]
pub struct WeightTensor {
    pub name: String,
    pub dims: Vec<usize>,
    pub data: Vec<f32>,
}

impl WeightTensor {
    pub fn new(name: impl Into<String>, dims: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let name = name.into();
        let expected: usize = dims.iter().product();
        ensure!(
            data.len() == expected,
            "tensor {}: dims {:?} need {} values, got {}",
            name,
            dims,
            expected,
            data.len()
        );
        Ok(Self { name, dims, data })
    }
}

/// モデルが必要とする重みの名前と形状
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightSpec {
    pub name: String,
    pub dims: Vec<usize>,
}

impl WeightSpec {
    pub fn new(name: impl Into<String>, dims: Vec<usize>) -> Self {
        Self { name: name.into(), dims }
    }
}

/// 読み込み済みの重みを保持し、名前で検索します。
#[derive(Debug, Default)]
pub struct WeightStore {
    tensors: Vec<WeightTensor>,
    index: HashMap<String, usize>,
    /// 接頭辞の読み替えを一度でも警告したか
    fallback_warned: AtomicBool,
}

/// バイト列を先頭から読み進めるカーソル
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .with_context(|| {
                format!(
                    "truncated weight file: {} needs {} bytes at offset {}, only {} left",
                    what,
                    len,
                    self.pos,
                    self.buf.len() - self.pos
                )
            })?;
        let s = &self.buf[self.pos..end];
        self.pos = end;
        Ok(s)
    }

    fn u32(&mut self, what: &str) -> Result<usize> {
        let b = self.take(4, what)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize)
    }
}

impl WeightStore {
    /// テンソルの一覧からストアを作ります。名前の重複はエラーです。
    pub fn from_tensors(tensors: Vec<WeightTensor>) -> Result<Self> {
        let mut index = HashMap::with_capacity(tensors.len());
        for (i, t) in tensors.iter().enumerate() {
            if index.insert(t.name.clone(), i).is_some() {
                bail!("duplicate weight name: {}", t.name);
            }
        }
        Ok(Self { tensors, index, fallback_warned: AtomicBool::new(false) })
    }

    /// コンテナのバイト列を解析します。
    ///
    /// 宣言されたサイズがバッファを超える場合や、名前長・次元数が上限を超える場合はエラーです。
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let mut cur = Cursor { buf, pos: 0 };
        let count = cur.u32("tensor count")?;
        let mut tensors = Vec::new();

        for i in 0..count {
            let name_len = cur.u32("name length")?;
            ensure!(
                name_len <= MAX_NAME_LEN,
                "tensor #{}: name length {} exceeds {}",
                i,
                name_len,
                MAX_NAME_LEN
            );
            let name = std::str::from_utf8(cur.take(name_len, "name")?)
                .with_context(|| format!("tensor #{}: name is not valid UTF-8", i))?
                .to_string();

            let ndim = cur.u32("dimension count")?;
            ensure!(ndim <= MAX_DIMS, "tensor {}: {} dimensions exceeds {}", name, ndim, MAX_DIMS);
            let mut dims = Vec::with_capacity(ndim);
            for _ in 0..ndim {
                dims.push(cur.u32("dimension")?);
            }

            let numel = dims
                .iter()
                .try_fold(1usize, |acc, &d| acc.checked_mul(d))
                .with_context(|| format!("tensor {}: element count overflows", name))?;
            let bytes_len = numel
                .checked_mul(4)
                .with_context(|| format!("tensor {}: byte size overflows", name))?;
            let data = cur
                .take(bytes_len, &name)?
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();

            tensors.push(WeightTensor { name, dims, data });
        }

        if cur.pos != buf.len() {
            warn!("{} trailing bytes after {} tensors", buf.len() - cur.pos, count);
        }
        Self::from_tensors(tensors)
    }

    /// gzip 圧縮された tar アーカイブから、最初の `.bin` エントリを読み込みます。
    pub fn from_archive<R: Read>(reader: R) -> Result<Self> {
        let mut archive = tar::Archive::new(GzDecoder::new(reader));
        for entry in archive.entries().context("failed to read tar entries")? {
            let mut entry = entry.context("failed to read tar entry")?;
            let path = entry.path().context("invalid entry path")?.into_owned();
            if path.extension().map_or(true, |ext| ext != "bin") {
                continue;
            }
            let mut buf = Vec::with_capacity(entry.header().size().unwrap_or(0) as usize);
            entry
                .read_to_end(&mut buf)
                .with_context(|| format!("failed to read {}", path.display()))?;
            info!("weights: reading archive member {}", path.display());
            return Self::from_bytes(&buf).with_context(|| format!("in archive member {}", path.display()));
        }
        bail!("no .bin member found in weight archive")
    }

    /// ファイルから読み込みます。拡張子が `.tar.gz` / `.tgz` ならアーカイブとして扱います。
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        let store = if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Self::from_archive(BufReader::new(file))
        } else {
            let mut buf = Vec::new();
            BufReader::new(file)
                .read_to_end(&mut buf)
                .with_context(|| format!("failed to read {}", path.display()))?;
            Self::from_bytes(&buf)
        }
        .with_context(|| format!("failed to load weights from {}", path.display()))?;

        info!("weights: loaded {} tensors from {}", store.len(), path.display());
        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WeightTensor> {
        self.tensors.iter()
    }

    /// 名前でテンソルを探します。
    ///
    /// 完全一致がなければ `model.X` を `model.model.X`、`model.model.model.X` の順に読み替えます。
    /// 読み替えの警告はストアごとに最初の1回だけで、以降は `debug!` に落とします。
    pub fn find(&self, name: &str) -> Option<&WeightTensor> {
        if let Some(&i) = self.index.get(name) {
            return Some(&self.tensors[i]);
        }
        let rest = name.strip_prefix("model.")?;
        for prefix in ["model.model.", "model.model.model."] {
            let alt = format!("{}{}", prefix, rest);
            if let Some(&i) = self.index.get(&alt) {
                if self.fallback_warned.swap(true, Ordering::Relaxed) {
                    debug!("weight {} resolved as {}", name, alt);
                } else {
                    warn!("weight {} resolved as {} (further renames are logged at debug level)", name, alt);
                }
                return Some(&self.tensors[i]);
            }
        }
        None
    }

    /// 名前でテンソルを取得します。見つからなければエラーです。
    pub fn tensor(&self, name: &str) -> Result<&WeightTensor> {
        self.find(name).with_context(|| format!("weight not found: {}", name))
    }

    /// 名前でデータを取得します。
    pub fn get(&self, name: &str) -> Result<&[f32]> {
        Ok(&self.tensor(name)?.data)
    }

    /// 形状を確認したうえでデータを取得します。
    pub fn get_shaped(&self, name: &str, dims: &[usize]) -> Result<&[f32]> {
        let t = self.tensor(name)?;
        ensure!(t.dims == dims, "weight {}: expected shape {:?}, found {:?}", name, dims, t.dims);
        Ok(&t.data)
    }

    /// 必要な重みがすべて揃っているかを一度に検証します。
    ///
    /// 欠けている名前と形状の合わない名前をまとめて報告します。
    pub fn validate(&self, manifest: &[WeightSpec]) -> Result<()> {
        let mut missing = Vec::new();
        let mut mismatched = Vec::new();
        for spec in manifest {
            match self.find(&spec.name) {
                None => missing.push(spec.name.as_str()),
                Some(t) if t.dims != spec.dims => {
                    mismatched.push(format!("{} (expected {:?}, found {:?})", spec.name, spec.dims, t.dims))
                }
                Some(_) => {}
            }
        }
        if missing.is_empty() && mismatched.is_empty() {
            return Ok(());
        }

        let mut msg = String::new();
        if !missing.is_empty() {
            msg += &format!("{} missing weights: {}", missing.len(), missing.join(", "));
        }
        if !mismatched.is_empty() {
            if !msg.is_empty() {
                msg += "; ";
            }
            msg += &format!("{} shape mismatches: {}", mismatched.len(), mismatched.join(", "));
        }
        bail!(msg)
    }

    /// コンテナ形式で書き出します。
    pub fn write_to<W: Write>(&self, mut w: W) -> Result<()> {
        let put = |w: &mut W, v: usize| -> Result<()> {
            let v = u32::try_from(v).context("value does not fit in u32")?;
            w.write_all(&v.to_le_bytes())?;
            Ok(())
        };
        put(&mut w, self.tensors.len())?;
        for t in &self.tensors {
            put(&mut w, t.name.len())?;
            w.write_all(t.name.as_bytes())?;
            put(&mut w, t.dims.len())?;
            for &d in &t.dims {
                put(&mut w, d)?;
            }
            for v in &t.data {
                w.write_all(&v.to_le_bytes())?;
            }
        }
        w.flush()?;
        Ok(())
    }

    /// バッチ正規化を畳み込みのバイアスへ畳み込んだストアを作ります。
    ///
    /// `P.conv.weight` と `P.bn.{weight,bias,running_mean,running_var}` の組を
    /// `P.conv.weight` と `P.conv.bias` に置き換えます。それ以外のテンソルはそのままコピーします。
    pub fn fuse_batch_norm(&self, eps: f32) -> Result<WeightStore> {
        let prefixes: HashSet<&str> = self
            .tensors
            .iter()
            .filter_map(|t| t.name.strip_suffix(".bn.weight"))
            .collect();

        let exact = |name: String| -> Result<&WeightTensor> {
            self.index
                .get(&name)
                .map(|&i| &self.tensors[i])
                .with_context(|| format!("batch norm fusion: {} not found", name))
        };

        let mut out = Vec::with_capacity(self.tensors.len());
        for t in &self.tensors {
            if let Some(p) = t.name.strip_suffix(".conv.weight").filter(|p| prefixes.contains(p)) {
                let bn = BatchNorm::new(
                    &exact(format!("{}.bn.weight", p))?.data,
                    &exact(format!("{}.bn.bias", p))?.data,
                    &exact(format!("{}.bn.running_mean", p))?.data,
                    &exact(format!("{}.bn.running_var", p))?.data,
                )
                .with_context(|| format!("batch norm fusion: {}", p))?;
                ensure!(
                    t.dims.first() == Some(&bn.channels()),
                    "batch norm fusion: {} has dims {:?} but bn has {} channels",
                    t.name,
                    t.dims,
                    bn.channels()
                );
                let (w, b) = bn.fold(&t.data, eps)?;
                out.push(WeightTensor { name: t.name.clone(), dims: t.dims.clone(), data: w });
                out.push(WeightTensor { name: format!("{}.conv.bias", p), dims: vec![b.len()], data: b });
            } else if prefixes.iter().any(|p| t.name.starts_with(&format!("{}.bn.", p))) {
                continue;
            } else {
                out.push(t.clone());
            }
        }

        info!("weights: fused {} batch norm layers", prefixes.len());
        Self::from_tensors(out)
    }
}
