//! ブロック内部の中間テンソル用スクラッチ領域
//!
//! 1本の連続した `Vec<f32>` を同じ長さのスロットに分割し、ブロックが順番に借ります。
//! スロット長はネットワーク構成ごとに最大の中間テンソルに合わせて決めます。

use anyhow::{anyhow, ensure, Context, Result};

/// スクラッチ領域
#[derive(Debug)]
pub struct Arena {
    data: Vec<f32>,
    slot_len: usize,
}

impl Arena {
    /// `slot_len` 要素のスロットを `slots` 個持つ領域を確保します。
    pub fn new(slot_len: usize, slots: usize) -> Result<Self> {
        let total = slot_len
            .checked_mul(slots)
            .with_context(|| format!("arena size overflows: {} x {}", slot_len, slots))?;

        let mut data = Vec::new();
        data.try_reserve_exact(total)
            .map_err(|e| anyhow!("failed to allocate scratch arena of {} floats: {}", total, e))?;
        data.resize(total, 0.0);
        Ok(Self { data, slot_len })
    }

    pub fn slot_len(&self) -> usize {
        self.slot_len
    }

    pub fn slot_count(&self) -> usize {
        if self.slot_len == 0 {
            0
        } else {
            self.data.len() / self.slot_len
        }
    }

    /// 全体の要素数
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// 先頭からスロットを借りるためのハンドルを返します。
    pub fn slots(&mut self) -> Slots<'_> {
        Slots { rest: &mut self.data, slot_len: self.slot_len }
    }
}

/// まだ貸し出していないスロットの列
#[derive(Debug)]
pub struct Slots<'a> {
    rest: &'a mut [f32],
    slot_len: usize,
}

impl<'a> Slots<'a> {
    /// スロットを1つ借り、先頭 `len` 要素のスライスと残りのスロットを返します。
    pub fn take(self, len: usize) -> Result<(&'a mut [f32], Slots<'a>)> {
        ensure!(
            len <= self.slot_len,
            "scratch slot too small: need {} floats, slot holds {}",
            len,
            self.slot_len
        );
        ensure!(self.rest.len() >= self.slot_len && self.slot_len > 0, "scratch arena has no free slot");
        let (head, tail) = self.rest.split_at_mut(self.slot_len);
        Ok((&mut head[..len], Slots { rest: tail, slot_len: self.slot_len }))
    }

    /// 残りのスロット数
    pub fn remaining(&self) -> usize {
        if self.slot_len == 0 {
            0
        } else {
            self.rest.len() / self.slot_len
        }
    }
}
