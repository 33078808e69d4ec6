//! NCHW テンソルの形状を扱うモジュール
//!
//! テンソルの実体は呼び出し側が確保した `f32` のフラットなバッファで、
//! このモジュールは形状 (N, C, H, W) とインデックス計算、長さの検証だけを受け持ちます。

use anyhow::{ensure, Result};

/// NCHW テンソルの形状
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shape {
    /// バッチ数
    pub n: usize,
    /// チャネル数
    pub c: usize,
    /// 高さ
    pub h: usize,
    /// 幅
    pub w: usize,
}

impl Shape {
    pub const fn new(n: usize, c: usize, h: usize, w: usize) -> Self {
        Self { n, c, h, w }
    }

    /// 要素数 (N * C * H * W)
    pub const fn len(&self) -> usize {
        self.n * self.c * self.h * self.w
    }

    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 1チャネル分の要素数 (H * W)
    pub const fn plane(&self) -> usize {
        self.h * self.w
    }

    /// 1バッチ分の要素数 (C * H * W)
    pub const fn batch_len(&self) -> usize {
        self.c * self.h * self.w
    }

    /// 要素 (n, c, h, w) のフラットなオフセットを返します。
    pub const fn offset(&self, n: usize, c: usize, h: usize, w: usize) -> usize {
        ((n * self.c + c) * self.h + h) * self.w + w
    }

    /// チャネル数だけを差し替えた形状
    pub const fn with_c(&self, c: usize) -> Self {
        Self { c, ..*self }
    }

    /// 空間サイズだけを差し替えた形状
    pub const fn with_hw(&self, h: usize, w: usize) -> Self {
        Self { h, w, ..*self }
    }

    /// バッファの長さが形状と一致するかを検証します。
    ///
    /// # Args
    /// * `buf_len` - バッファの長さ
    /// * `what` - エラーメッセージに使う名前
    pub fn check(&self, buf_len: usize, what: &str) -> Result<()> {
        ensure!(
            buf_len == self.len(),
            "{}: buffer length {} does not match shape {:?} ({} elements)",
            what,
            buf_len,
            self,
            self.len()
        );
        Ok(())
    }
}

/// 畳み込みの出力サイズ `(in + 2 * pad - k) / stride + 1` を計算します。
///
/// # Return
/// * カーネルがパディング込みの入力に収まらない場合や `stride == 0` の場合は `None`
pub fn conv_out(input: usize, k: usize, stride: usize, pad: usize) -> Option<usize> {
    if stride == 0 || k == 0 {
        return None;
    }
    let padded = input + 2 * pad;
    if padded < k {
        return None;
    }
    Some((padded - k) / stride + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_is_channel_major() {
        let s = Shape::new(2, 3, 4, 5);
        assert_eq!(s.len(), 120);
        assert_eq!(s.offset(0, 0, 0, 1), 1);
        assert_eq!(s.offset(0, 0, 1, 0), 5);
        assert_eq!(s.offset(0, 1, 0, 0), 20);
        assert_eq!(s.offset(1, 0, 0, 0), 60);
        assert_eq!(s.offset(1, 2, 3, 4), 119);
    }

    #[test]
    fn conv_out_matches_formula() {
        assert_eq!(conv_out(640, 6, 2, 2), Some(320));
        assert_eq!(conv_out(320, 3, 2, 1), Some(160));
        assert_eq!(conv_out(20, 1, 1, 0), Some(20));
        assert_eq!(conv_out(2, 5, 1, 0), None);
        assert_eq!(conv_out(8, 3, 0, 1), None);
    }

    #[test]
    fn check_rejects_wrong_length() {
        let s = Shape::new(1, 2, 2, 2);
        assert!(s.check(8, "x").is_ok());
        assert!(s.check(7, "x").is_err());
    }
}
