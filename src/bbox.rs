//! バウンディングボックスの表現を扱うモジュール
//!
//! 同じ矩形に対して対角点形式 `(x1, y1, x2, y2)` と中心点形式 `(cx, cy, w, h)` の
//! 2つの表現があります。形式の混同を避けるため、変換は必ず明示的に行います。

use std::ops::Index;

/// 対角点形式のバウンディングボックス
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BBox {
    /// 左上のx
    pub x1: f32,
    /// 左上のy
    pub y1: f32,
    /// 右下のx
    pub x2: f32,
    /// 右下のy
    pub y2: f32,
}

/// 中心点形式のバウンディングボックス
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CenterBox {
    /// 中心のx
    pub cx: f32,
    /// 中心のy
    pub cy: f32,
    /// 幅
    pub w: f32,
    /// 高さ
    pub h: f32,
}

/// 配列で渡されるボックスの座標形式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoxFormat {
    /// `(x1, y1, x2, y2)`
    Corners,
    /// `(cx, cy, w, h)`
    Center,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// 配列の1行から、指定された形式として解釈したボックスを作成します。
    ///
    /// # Args
    /// * `row` - 先頭4要素に座標が入っている行
    /// * `format` - 行の座標形式
    ///
    /// # Return
    /// * 対角点形式に揃えた `BBox`
    pub fn from_row<R: Index<usize, Output = f32> + ?Sized>(row: &R, format: BoxFormat) -> Self {
        match format {
            BoxFormat::Corners => Self::new(row[0], row[1], row[2], row[3]),
            BoxFormat::Center => CenterBox::new(row[0], row[1], row[2], row[3]).into(),
        }
    }

    /// +1 を含む画素単位の面積
    pub fn area_inclusive(&self) -> f32 {
        (self.x2 - self.x1 + 1.) * (self.y2 - self.y1 + 1.)
    }

    /// 座標差そのままの面積
    pub fn area(&self) -> f32 {
        (self.x2 - self.x1) * (self.y2 - self.y1)
    }
}

impl CenterBox {
    pub fn new(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self { cx, cy, w, h }
    }
}

impl From<CenterBox> for BBox {
    fn from(b: CenterBox) -> Self {
        Self {
            x1: b.cx - b.w / 2.,
            y1: b.cy - b.h / 2.,
            x2: b.cx + b.w / 2.,
            y2: b.cy + b.h / 2.,
        }
    }
}

impl From<BBox> for CenterBox {
    fn from(b: BBox) -> Self {
        Self {
            cx: (b.x1 + b.x2) / 2.,
            cy: (b.y1 + b.y2) / 2.,
            w: b.x2 - b.x1,
            h: b.y2 - b.y1,
        }
    }
}
