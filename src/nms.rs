//! 信頼度によるフィルタリングとクラス別の Non-Maximum Suppression (NMS) を行うモジュール

use std::collections::BTreeMap;

use anyhow::{ensure, Context, Result};
use log::debug;
use ndarray::{ArrayView2, ArrayView3};

use crate::detection_result::Detection;
use crate::iou::iou_inclusive;

/// NMS のパラメータ
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NmsConfig {
    /// クラス数
    pub num_classes: usize,
    /// objectness の閾値 (これ未満は捨てる)
    pub conf_thres: f32,
    /// 抑制する IoU の閾値 (これ以上重なると捨てる)
    pub nms_thres: f32,
}

impl NmsConfig {
    /// 閾値を既定値 (conf 0.5, nms 0.4) にした `NmsConfig` を作成します。
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            conf_thres: 0.5,
            nms_thres: 0.4,
        }
    }

    /// この設定で [`non_max_suppression`] を実行します。
    pub fn run(&self, prediction: ArrayView3<f32>) -> Result<Vec<Vec<Detection>>> {
        non_max_suppression(prediction, self.num_classes, self.conf_thres, self.nms_thres)
    }
}

/// 同じクラスの検出結果に貪欲法で NMS を適用します。
///
/// # Args
/// * `bb` - 同じクラスの検出結果
/// * `nms_threshold` - この値以上重なる低信頼度のボックスを捨てる
///
/// # Return
/// * 残った検出結果 (objectness の降順)
fn nms(bb: Vec<Detection>, nms_threshold: f32) -> Vec<Detection> {
    let mut sorted_bb = bb;
    // 安定ソートなので同じ信頼度なら入力順
    sorted_bb.sort_by(|a, b| b.object_conf.total_cmp(&a.object_conf));

    // 残した全ボックスとの IoU が閾値未満のものだけが残る
    let mut kept: Vec<Detection> = Vec::with_capacity(sorted_bb.len());
    for d in sorted_bb {
        let b = d.bbox();
        if kept.iter().all(|k| iou_inclusive(&k.bbox(), &b) < nms_threshold) {
            kept.push(d);
        }
    }
    kept
}

/// 1枚分の予測に対して閾値処理とクラス別 NMS を行います。
fn suppress_image(
    image_pred: ArrayView2<f32>,
    num_classes: usize,
    conf_thres: f32,
    nms_thres: f32,
) -> Result<Vec<Detection>> {
    let rows = image_pred.as_standard_layout();
    let flat = rows
        .as_slice()
        .context("prediction rows are not contiguous")?;

    // クラス別に分割 (クラス番号の昇順で処理する)
    let mut cls: BTreeMap<usize, Vec<Detection>> = BTreeMap::new();
    let mut n_candidates = 0;
    for yolo_result in flat.chunks_exact(image_pred.ncols()) {
        if !(yolo_result[4] >= conf_thres) {
            continue;
        }
        let detection = Detection::new_from_yolo(yolo_result, num_classes)?;
        cls.entry(detection.class).or_default().push(detection);
        n_candidates += 1;
    }

    let new_box: Vec<Detection> = cls
        .into_values()
        .flat_map(|d| nms(d, nms_thres))
        .collect();
    debug!(
        "nms: {} boxes, {} above conf {}, {} kept",
        image_pred.nrows(),
        n_candidates,
        conf_thres,
        new_box.len()
    );
    Ok(new_box)
}

/// objectness が `conf_thres` 未満の予測を除き、クラスごとに NMS を適用します。
///
/// # Args
/// * `prediction` - (画像数, ボックス数, 5 + クラス数) の中心点形式の予測。
///   各行は `(cx, cy, w, h, objectness, クラス確率...)`
/// * `num_classes` - クラス数
/// * `conf_thres` - objectness の閾値
/// * `nms_thres` - NMS の IoU 閾値
///
/// # Return
/// * 画像ごとの検出結果。閾値を超えるボックスが1つもない画像は空のベクトル
///
/// 画像内ではクラス番号の昇順に並び、同じクラスの中では objectness の降順になります。
pub fn non_max_suppression(
    prediction: ArrayView3<f32>,
    num_classes: usize,
    conf_thres: f32,
    nms_thres: f32,
) -> Result<Vec<Vec<Detection>>> {
    ensure!(num_classes > 0, "num_classes must be positive");
    ensure!(
        prediction.shape()[2] >= 5 + num_classes,
        "prediction must have {} fields per box, got shape {:?}",
        5 + num_classes,
        prediction.shape()
    );

    prediction
        .outer_iter()
        .map(|image_pred| suppress_image(image_pred, num_classes, conf_thres, nms_thres))
        .collect()
}
