//! 物体検出の結果を保持するモジュール

use anyhow::{ensure, Result};

use crate::bbox::{BBox, CenterBox};

/// NMS を通過した1つの検出結果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    /// バウンディングボックス左上のx
    pub x1: f32,
    /// バウンディングボックス左上のy
    pub y1: f32,
    /// バウンディングボックス右下のx
    pub x2: f32,
    /// バウンディングボックス右下のy
    pub y2: f32,
    /// 物体らしさ (objectness)
    pub object_conf: f32,
    /// 最大のクラス確率
    pub class_conf: f32,
    /// クラス
    pub class: usize,
}

impl Detection {
    /// YOLOの出力1行から新しい Detection を作成します。
    ///
    /// # Args
    ///
    /// * `yolo_result` - `(cx, cy, w, h, objectness, クラス確率...)` の行
    /// * `num_classes` - クラス数
    ///
    /// # Return
    /// * 対角点形式に変換し、最大のクラス確率とそのクラスを持つ Detection。
    ///   `num_classes` が 0 か、行が `5 + num_classes` より短い場合はエラー
    ///
    /// 同じ確率のクラスが複数ある場合は、インデックスが小さいものを選びます。
    pub fn new_from_yolo(yolo_result: &[f32], num_classes: usize) -> Result<Self> {
        ensure!(num_classes > 0, "num_classes must be positive");
        ensure!(
            yolo_result.len() >= 5 + num_classes,
            "yolo row has {} fields, expected at least {}",
            yolo_result.len(),
            5 + num_classes
        );

        let b: BBox =
            CenterBox::new(yolo_result[0], yolo_result[1], yolo_result[2], yolo_result[3]).into();

        let (class, class_conf) = yolo_result[5..5 + num_classes].iter().enumerate().fold(
            (0, f32::NEG_INFINITY),
            |(best, best_conf), (i, &conf)| {
                if conf > best_conf {
                    (i, conf)
                } else {
                    (best, best_conf)
                }
            },
        );

        Ok(Self {
            x1: b.x1,
            y1: b.y1,
            x2: b.x2,
            y2: b.y2,
            object_conf: yolo_result[4],
            class_conf,
            class,
        })
    }

    pub fn bbox(&self) -> BBox {
        BBox::new(self.x1, self.y1, self.x2, self.y2)
    }
}
