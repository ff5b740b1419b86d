//! バウンディングボックス同士の IoU (Intersection over Union) を計算するモジュール
//!
//! 面積の数え方が異なる2種類の IoU があり、呼び出し側ごとに期待する数値が違うため
//! 統一せずに別々の関数として提供します。
//!
//! * [`bbox_iou`] / [`iou_inclusive`] - 画素の両端を含む +1 規約。NMS とアンカー選択で使用
//! * [`bbox_iou_matrix`] / [`iou_exclusive`] - 座標差そのままの規約。N×M の総当たり

use anyhow::{bail, ensure, Result};
use ndarray::{Array1, Array2, ArrayView2};

use crate::bbox::{BBox, BoxFormat};

/// 和集合の面積に加えるゼロ除算よけ
pub const UNION_EPS: f32 = 1e-16;

/// +1 規約で2つのボックスの IoU を計算します。
///
/// # Args
/// * `a` - 1つ目のボックス
/// * `b` - 2つ目のボックス
///
/// # Return
/// * IoU (クランプはしない)
pub fn iou_inclusive(a: &BBox, b: &BBox) -> f32 {
    let inter_x1 = a.x1.max(b.x1);
    let inter_y1 = a.y1.max(b.y1);
    let inter_x2 = a.x2.min(b.x2);
    let inter_y2 = a.y2.min(b.y2);

    let inter_area = (inter_x2 - inter_x1 + 1.).max(0.) * (inter_y2 - inter_y1 + 1.).max(0.);
    inter_area / (a.area_inclusive() + b.area_inclusive() - inter_area + UNION_EPS)
}

/// 座標差そのままの規約で2つのボックスの IoU を計算します。
///
/// 和集合の面積はマシンイプシロンで下限を取ります。
pub fn iou_exclusive(a: &BBox, b: &BBox) -> f32 {
    let iw = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.);
    let ih = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.);
    let inter_area = iw * ih;
    let union = (a.area() + b.area() - inter_area).max(f64::EPSILON as f32);
    inter_area / union
}

fn ensure_coords(boxes: &ArrayView2<f32>, name: &str) -> Result<()> {
    ensure!(
        boxes.ncols() >= 4,
        "{} must have at least 4 columns, got shape {:?}",
        name,
        boxes.shape()
    );
    Ok(())
}

/// 行同士を対応させて IoU を計算します (+1 規約)。
///
/// 行数が等しければ i 行目同士を、どちらかが1行であればその1行を相手の全行と比較します。
/// 5列目以降は無視されます。
///
/// # Args
/// * `box1` - (N, 4+) のボックス配列
/// * `box2` - (N, 4+) のボックス配列
/// * `format` - 2つの配列の座標形式
///
/// # Return
/// * 長さ max(N1, N2) の IoU 配列
pub fn bbox_iou(
    box1: ArrayView2<f32>,
    box2: ArrayView2<f32>,
    format: BoxFormat,
) -> Result<Array1<f32>> {
    ensure_coords(&box1, "box1")?;
    ensure_coords(&box2, "box2")?;

    let (n1, n2) = (box1.nrows(), box2.nrows());
    let n = match (n1, n2) {
        _ if n1 == n2 => n1,
        (1, _) => n2,
        (_, 1) => n1,
        _ => bail!("box count mismatch: {:?} vs {:?}", box1.shape(), box2.shape()),
    };

    let ious: Vec<f32> = (0..n)
        .map(|i| {
            let a = BBox::from_row(&box1.row(if n1 == 1 { 0 } else { i }), format);
            let b = BBox::from_row(&box2.row(if n2 == 1 { 0 } else { i }), format);
            iou_inclusive(&a, &b)
        })
        .collect();
    Ok(Array1::from(ious))
}

/// 対角点形式の2つのボックス集合について、全組み合わせの IoU を計算します。
///
/// # Args
/// * `box1` - (N, 4) のボックス配列
/// * `box2` - (M, 4) のボックス配列
///
/// # Return
/// * (N, M) の IoU 行列
pub fn bbox_iou_matrix(box1: ArrayView2<f32>, box2: ArrayView2<f32>) -> Result<Array2<f32>> {
    ensure_coords(&box1, "box1")?;
    ensure_coords(&box2, "box2")?;

    let b1: Vec<BBox> = box1
        .rows()
        .into_iter()
        .map(|r| BBox::from_row(&r, BoxFormat::Corners))
        .collect();
    let b2: Vec<BBox> = box2
        .rows()
        .into_iter()
        .map(|r| BBox::from_row(&r, BoxFormat::Corners))
        .collect();

    Ok(Array2::from_shape_fn((b1.len(), b2.len()), |(i, j)| {
        iou_exclusive(&b1[i], &b2[j])
    }))
}
