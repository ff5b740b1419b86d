//! 正解ボックスをアンカーとグリッドセルに割り当て、学習用のターゲットを作るモジュール
//!
//! 正解ボックス1つにつき、形状の IoU が最大のアンカーと中心を含むセルの組が
//! ただ1つの正例になります。
//!
//! 同じ画像の2つの正解ボックスが同じ (アンカー, セル) に割り当てられた場合、
//! 後のボックスが前のボックスのターゲットを上書きします。ボックスは入力順に処理されるので
//! 結果は決定的です。`tcls` は 1 を立てるだけなので、前のボックスのクラスも残ります。

use anyhow::{ensure, Result};
use log::{debug, trace};
use ndarray::{
    array, s, Array2, Array4, Array5, ArrayView1, ArrayView3, ArrayView4, ArrayView5, Axis,
};

use crate::bbox::BoxFormat;
use crate::iou::bbox_iou;

/// `ln` の引数に加えるイプシロン
pub const LOG_EPS: f32 = 1e-16;

/// 予測が正解とみなされる IoU と objectness の下限 (どちらも超える必要がある)
const CORRECT_IOU: f32 = 0.5;
const CORRECT_CONF: f32 = 0.5;

/// グリッド単位のアンカーボックスの大きさ
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Anchor {
    /// 幅
    pub width: f32,
    /// 高さ
    pub height: f32,
}

impl Anchor {
    pub fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }
}

/// ターゲット作成のパラメータ
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetConfig {
    /// クラス数
    pub num_classes: usize,
    /// グリッドの一辺のセル数
    pub grid_size: usize,
    /// 形状の IoU がこれを超えるアンカーは objectness の損失から外す
    pub ignore_thres: f32,
    /// 入力画像の一辺の画素数
    pub img_dim: usize,
}

impl TargetConfig {
    /// 1セルあたりの画素数
    pub fn stride(&self) -> f32 {
        self.img_dim as f32 / self.grid_size as f32
    }

    /// 画素単位のアンカー `(幅, 高さ)` をグリッド単位に変換します。
    ///
    /// # Args
    /// * `anchors` - 画素単位のアンカー
    ///
    /// # Return
    /// * グリッド単位の `Anchor` のベクトル
    pub fn scale_anchors(&self, anchors: &[(f32, f32)]) -> Vec<Anchor> {
        let stride = self.stride();
        anchors
            .iter()
            .map(|&(w, h)| Anchor::new(w / stride, h / stride))
            .collect()
    }
}

/// (バッチ, アンカー, 行, 列) ごとのモデルの現在の予測
pub struct Predictions<'a> {
    /// (B, A, G, G, 4) の中心点形式のボックス (グリッド単位)
    pub boxes: ArrayView5<'a, f32>,
    /// (B, A, G, G) の objectness
    pub conf: ArrayView4<'a, f32>,
    /// (B, A, G, G, C) のクラス確率
    pub cls: ArrayView5<'a, f32>,
}

/// 損失計算に渡すターゲット一式
///
/// どの配列も `[バッチ, アンカー, 行 (gj), 列 (gi)]` で参照します。
#[derive(Debug, Clone, PartialEq)]
pub struct TargetTensors {
    /// 正例の位置
    pub mask: Array4<bool>,
    /// objectness の損失に含める位置
    pub conf_mask: Array4<bool>,
    /// セル内の中心のx方向オフセット
    pub tx: Array4<f32>,
    /// セル内の中心のy方向オフセット
    pub ty: Array4<f32>,
    /// アンカーに対する幅の対数比
    pub tw: Array4<f32>,
    /// アンカーに対する高さの対数比
    pub th: Array4<f32>,
    /// 正例で 1
    pub tconf: Array4<u8>,
    /// 正例のクラスに 1 (最後の軸がクラス)
    pub tcls: Array5<u8>,
}

impl TargetTensors {
    /// 初期状態のターゲットを確保します。
    ///
    /// `conf_mask` だけは全て true、それ以外は全て 0 (false) です。
    pub fn new(n_batch: usize, n_anchors: usize, grid_size: usize, num_classes: usize) -> Self {
        let dim = (n_batch, n_anchors, grid_size, grid_size);
        Self {
            mask: Array4::from_elem(dim, false),
            conf_mask: Array4::from_elem(dim, true),
            tx: Array4::zeros(dim),
            ty: Array4::zeros(dim),
            tw: Array4::zeros(dim),
            th: Array4::zeros(dim),
            tconf: Array4::zeros(dim),
            tcls: Array5::zeros((n_batch, n_anchors, grid_size, grid_size, num_classes)),
        }
    }

    /// 確保済みのバッファを初期状態に戻します。
    pub fn reset(&mut self) {
        self.mask.fill(false);
        self.conf_mask.fill(true);
        self.tx.fill(0.);
        self.ty.fill(0.);
        self.tw.fill(0.);
        self.th.fill(0.);
        self.tconf.fill(0);
        self.tcls.fill(0);
    }
}

/// 正解ボックスの数と、そのうち現在の予測が正しく当てている数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TargetCounts {
    pub n_gt: usize,
    pub n_correct: usize,
}

/// 最大値の最初のインデックス
fn argmax(values: ArrayView1<f32>) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best, best_v), (i, &v)| {
            if v > best_v {
                (i, v)
            } else {
                (best, best_v)
            }
        })
        .0
}

fn check_shapes(
    out: &TargetTensors,
    pred: &Predictions,
    target: &ArrayView3<f32>,
    anchors: &[Anchor],
    config: &TargetConfig,
) -> Result<()> {
    let n_b = target.shape()[0];
    let n_a = anchors.len();
    let n_g = config.grid_size;
    let n_c = config.num_classes;

    ensure!(n_a > 0, "at least one anchor is required");
    ensure!(n_g > 0, "grid_size must be positive");
    ensure!(n_c > 0, "num_classes must be positive");
    ensure!(
        target.shape()[2] >= 5,
        "target rows must be (class, cx, cy, w, h), got shape {:?}",
        target.shape()
    );
    ensure!(
        pred.boxes.shape() == [n_b, n_a, n_g, n_g, 4],
        "pred boxes shape {:?}, expected {:?}",
        pred.boxes.shape(),
        [n_b, n_a, n_g, n_g, 4]
    );
    ensure!(
        pred.conf.shape() == [n_b, n_a, n_g, n_g],
        "pred conf shape {:?}, expected {:?}",
        pred.conf.shape(),
        [n_b, n_a, n_g, n_g]
    );
    ensure!(
        pred.cls.shape() == [n_b, n_a, n_g, n_g, n_c],
        "pred cls shape {:?}, expected {:?}",
        pred.cls.shape(),
        [n_b, n_a, n_g, n_g, n_c]
    );
    ensure!(
        out.tcls.shape() == [n_b, n_a, n_g, n_g, n_c]
            && [
                out.mask.shape(),
                out.conf_mask.shape(),
                out.tx.shape(),
                out.ty.shape(),
                out.tw.shape(),
                out.th.shape(),
                out.tconf.shape(),
            ]
            .iter()
            .all(|s| *s == [n_b, n_a, n_g, n_g]),
        "target buffers do not match {:?}",
        [n_b, n_a, n_g, n_g, n_c]
    );
    Ok(())
}

/// 正解ボックス1行の中心とクラスが範囲内かを調べます。
fn check_row(b: usize, t: usize, row: ArrayView1<f32>, config: &TargetConfig) -> Result<()> {
    let n_gf = config.grid_size as f32;
    let (gx, gy) = (row[1] * n_gf, row[2] * n_gf);
    let (gi_f, gj_f) = (gx.floor(), gy.floor());
    ensure!(
        gi_f >= 0. && gi_f < n_gf && gj_f >= 0. && gj_f < n_gf,
        "ground truth {} of image {} has center ({}, {}) outside the {}x{} grid",
        t,
        b,
        gx,
        gy,
        config.grid_size,
        config.grid_size
    );
    ensure!(
        row[0] >= 0. && row[0] < config.num_classes as f32,
        "ground truth {} of image {} has class {} outside 0..{}",
        t,
        b,
        row[0],
        config.num_classes
    );
    Ok(())
}

/// 正解ボックスから学習用ターゲットを作り、呼び出し側のバッファに書き込みます。
///
/// # Args
/// * `out` - 書き込み先。[`TargetTensors::new`] か [`TargetTensors::reset`] 直後の状態であること
/// * `pred` - モデルの現在の予測
/// * `target` - (B, T, 5) の正解。各行は `(クラス, cx, cy, w, h)` で座標は [0, 1) に正規化済み。
///   全要素が 0 の行はパディングとして読み飛ばす
/// * `anchors` - グリッド単位のアンカー
/// * `config` - パラメータ
///
/// # Return
/// * 正解ボックスの数と正しく予測されている数
///
/// エラーを返したときは `out` に何も書き込まれていません。
pub fn build_targets_into(
    out: &mut TargetTensors,
    pred: &Predictions,
    target: ArrayView3<f32>,
    anchors: &[Anchor],
    config: &TargetConfig,
) -> Result<TargetCounts> {
    check_shapes(out, pred, &target, anchors, config)?;

    let n_g = config.grid_size;
    let n_gf = n_g as f32;
    trace!(
        "build_targets: grid {}x{}, stride {}, {} anchors",
        n_g,
        n_g,
        config.stride(),
        anchors.len()
    );

    // 原点に置いたアンカーの形状 (0, 0, w, h)
    let anchor_shapes = Array2::from_shape_fn((anchors.len(), 4), |(i, j)| match j {
        2 => anchors[i].width,
        3 => anchors[i].height,
        _ => 0.,
    });

    // 書き込みを始める前に全ての行を検査する
    for (b, image_target) in target.outer_iter().enumerate() {
        for (t, row) in image_target.rows().into_iter().enumerate() {
            if row.sum() != 0. {
                check_row(b, t, row, config)?;
            }
        }
    }

    let mut counts = TargetCounts::default();
    for (b, image_target) in target.outer_iter().enumerate() {
        for (t, row) in image_target.rows().into_iter().enumerate() {
            if row.sum() == 0. {
                continue;
            }
            counts.n_gt += 1;

            // グリッド単位に変換
            let gx = row[1] * n_gf;
            let gy = row[2] * n_gf;
            let gw = row[3] * n_gf;
            let gh = row[4] * n_gf;

            let (gi_f, gj_f) = (gx.floor(), gy.floor());
            let (gi, gj) = (gi_f as usize, gj_f as usize);
            let target_label = row[0] as usize;

            // 位置を無視した形状だけの IoU
            let gt_shape = array![[0., 0., gw, gh]];
            let anch_ious = bbox_iou(gt_shape.view(), anchor_shapes.view(), BoxFormat::Corners)?;

            for (a, &iou) in anch_ious.iter().enumerate() {
                if iou > config.ignore_thres {
                    out.conf_mask[[b, a, gj, gi]] = false;
                }
            }

            let best_n = argmax(anch_ious.view());
            let cell = [b, best_n, gj, gi];

            if out.mask[cell] {
                debug!(
                    "ground truth {} of image {} overwrites the target at anchor {}, cell ({}, {})",
                    t, b, best_n, gj, gi
                );
            }

            out.mask[cell] = true;
            out.conf_mask[cell] = true;

            out.tx[cell] = gx - gi_f;
            out.ty[cell] = gy - gj_f;
            out.tw[cell] = (gw / anchors[best_n].width + LOG_EPS).ln();
            out.th[cell] = (gh / anchors[best_n].height + LOG_EPS).ln();

            out.tcls[[b, best_n, gj, gi, target_label]] = 1;
            out.tconf[cell] = 1;

            // 割り当てたセルの現在の予測との比較
            let gt_box = array![[gx, gy, gw, gh]];
            let pred_box = pred.boxes.slice(s![b, best_n, gj, gi, ..]).insert_axis(Axis(0));
            let iou = bbox_iou(gt_box.view(), pred_box, BoxFormat::Center)?[0];
            let pred_label = argmax(pred.cls.slice(s![b, best_n, gj, gi, ..]));
            let score = pred.conf[cell];
            if iou > CORRECT_IOU && pred_label == target_label && score > CORRECT_CONF {
                counts.n_correct += 1;
            }
        }
    }

    debug!(
        "build_targets: {} ground truth boxes, {} predicted correctly",
        counts.n_gt, counts.n_correct
    );
    Ok(counts)
}

/// 新しいバッファを確保して [`build_targets_into`] を実行します。
pub fn build_targets(
    pred: &Predictions,
    target: ArrayView3<f32>,
    anchors: &[Anchor],
    config: &TargetConfig,
) -> Result<(TargetCounts, TargetTensors)> {
    let mut out = TargetTensors::new(
        target.shape()[0],
        anchors.len(),
        config.grid_size,
        config.num_classes,
    );
    let counts = build_targets_into(&mut out, pred, target, anchors, config)?;
    Ok((counts, out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array3;

    const NG: usize = 13;
    const NC: usize = 4;

    fn anchors() -> Vec<Anchor> {
        vec![Anchor::new(1., 1.), Anchor::new(3., 2.), Anchor::new(5., 5.)]
    }

    fn config(ignore_thres: f32) -> TargetConfig {
        TargetConfig {
            num_classes: NC,
            grid_size: NG,
            ignore_thres,
            img_dim: 416,
        }
    }

    struct PredBuffers {
        boxes: Array5<f32>,
        conf: Array4<f32>,
        cls: Array5<f32>,
    }

    impl PredBuffers {
        fn zeros(n_batch: usize) -> Self {
            Self {
                boxes: Array5::zeros((n_batch, 3, NG, NG, 4)),
                conf: Array4::zeros((n_batch, 3, NG, NG)),
                cls: Array5::zeros((n_batch, 3, NG, NG, NC)),
            }
        }

        fn view(&self) -> Predictions<'_> {
            Predictions {
                boxes: self.boxes.view(),
                conf: self.conf.view(),
                cls: self.cls.view(),
            }
        }
    }

    fn targets(rows: &[[f32; 5]]) -> Array3<f32> {
        let mut t = Array3::zeros((1, rows.len() + 2, 5));
        for (i, r) in rows.iter().enumerate() {
            for (j, &v) in r.iter().enumerate() {
                t[[0, i, j]] = v;
            }
        }
        t
    }

    #[test]
    fn box_matching_an_anchor_gets_a_single_positive() {
        let pred = PredBuffers::zeros(1);
        // 中心 (6.5, 3.9), 大きさ 3x2 のボックス
        let target = targets(&[[2., 0.5, 0.3, 3. / 13., 2. / 13.]]);

        let (counts, out) =
            build_targets(&pred.view(), target.view(), &anchors(), &config(0.5)).unwrap();
        assert_eq!(counts, TargetCounts { n_gt: 1, n_correct: 0 });

        let positives: Vec<_> = out
            .mask
            .indexed_iter()
            .filter(|(_, m)| **m)
            .map(|(idx, _)| idx)
            .collect();
        assert_eq!(positives, vec![(0, 1, 3, 6)]);

        let cell = [0, 1, 3, 6];
        assert_abs_diff_eq!(out.tx[cell], 0.5, epsilon = 1e-5);
        assert_abs_diff_eq!(out.ty[cell], 0.9, epsilon = 1e-5);
        assert_abs_diff_eq!(out.tw[cell], 0., epsilon = 1e-5);
        assert_abs_diff_eq!(out.th[cell], 0., epsilon = 1e-5);
        assert_eq!(out.tconf[cell], 1);
        assert_eq!(out.tconf.sum(), 1);
        assert_eq!(out.tcls[[0, 1, 3, 6, 2]], 1);
        assert_eq!(out.tcls.sum(), 1);
        assert!(out.conf_mask.iter().all(|&m| m));
    }

    #[test]
    fn similar_anchors_are_ignored_but_positive_is_kept() {
        let pred = PredBuffers::zeros(1);
        let target = targets(&[[0., 0.5, 0.3, 3. / 13., 2. / 13.]]);

        // 他のアンカーとの形状 IoU はどちらも 1/3
        let (_, out) =
            build_targets(&pred.view(), target.view(), &anchors(), &config(0.3)).unwrap();
        assert!(!out.conf_mask[[0, 0, 3, 6]]);
        assert!(!out.conf_mask[[0, 2, 3, 6]]);
        assert!(out.conf_mask[[0, 1, 3, 6]]);
        assert_eq!(out.conf_mask.iter().filter(|&&m| !m).count(), 2);
    }

    #[test]
    fn padding_rows_are_skipped() {
        let pred = PredBuffers::zeros(2);
        let mut target = Array3::zeros((2, 4, 5));
        target[[1, 2, 0]] = 1.;
        target[[1, 2, 1]] = 0.1;
        target[[1, 2, 2]] = 0.9;
        target[[1, 2, 3]] = 0.05;
        target[[1, 2, 4]] = 0.05;

        let (counts, out) =
            build_targets(&pred.view(), target.view(), &anchors(), &config(0.5)).unwrap();
        assert_eq!(counts.n_gt, 1);
        assert_eq!(out.mask.iter().filter(|&&m| m).count(), 1);
        assert!(out.mask.index_axis(Axis(0), 0).iter().all(|&m| !m));
    }

    #[test]
    fn matching_prediction_is_counted_correct() {
        let mut pred = PredBuffers::zeros(1);
        let target = targets(&[[3., 0.5, 0.3, 3. / 13., 2. / 13.]]);
        pred.boxes
            .slice_mut(s![0, 1, 3, 6, ..])
            .assign(&array![6.5, 3.9, 3., 2.]);
        pred.conf[[0, 1, 3, 6]] = 0.9;
        pred.cls[[0, 1, 3, 6, 3]] = 0.8;

        let (counts, _) =
            build_targets(&pred.view(), target.view(), &anchors(), &config(0.5)).unwrap();
        assert_eq!(counts, TargetCounts { n_gt: 1, n_correct: 1 });

        // objectness が低いと正解にならない
        pred.conf[[0, 1, 3, 6]] = 0.4;
        let (counts, _) =
            build_targets(&pred.view(), target.view(), &anchors(), &config(0.5)).unwrap();
        assert_eq!(counts.n_correct, 0);

        // クラスが違うと正解にならない
        pred.conf[[0, 1, 3, 6]] = 0.9;
        pred.cls[[0, 1, 3, 6, 0]] = 0.95;
        let (counts, _) =
            build_targets(&pred.view(), target.view(), &anchors(), &config(0.5)).unwrap();
        assert_eq!(counts.n_correct, 0);
    }

    #[test]
    fn later_box_overwrites_same_cell() {
        let pred = PredBuffers::zeros(1);
        let target = targets(&[
            [0., 0.5, 0.3, 3. / 13., 2. / 13.],
            [1., 0.52, 0.305, 3.1 / 13., 2. / 13.],
        ]);

        let (counts, out) =
            build_targets(&pred.view(), target.view(), &anchors(), &config(0.5)).unwrap();
        assert_eq!(counts.n_gt, 2);
        assert_eq!(out.mask.iter().filter(|&&m| m).count(), 1);

        let cell = [0, 1, 3, 6];
        assert_abs_diff_eq!(out.tx[cell], 0.52 * 13. - 6., epsilon = 1e-4);
        assert_abs_diff_eq!(out.tw[cell], (3.1f32 / 3.).ln(), epsilon = 1e-4);
        // 両方のクラスが立ったまま残る
        assert_eq!(out.tcls[[0, 1, 3, 6, 0]], 1);
        assert_eq!(out.tcls[[0, 1, 3, 6, 1]], 1);
    }

    #[test]
    fn caller_buffers_can_be_reused() {
        let pred = PredBuffers::zeros(1);
        let target = targets(&[[2., 0.5, 0.3, 3. / 13., 2. / 13.]]);
        let mut out = TargetTensors::new(1, 3, NG, NC);

        let first =
            build_targets_into(&mut out, &pred.view(), target.view(), &anchors(), &config(0.3))
                .unwrap();
        let snapshot = out.clone();
        out.reset();
        assert_eq!(out, TargetTensors::new(1, 3, NG, NC));

        let second =
            build_targets_into(&mut out, &pred.view(), target.view(), &anchors(), &config(0.3))
                .unwrap();
        assert_eq!(first, second);
        assert_eq!(out, snapshot);
    }

    #[test]
    fn malformed_input_is_rejected() {
        let pred = PredBuffers::zeros(1);

        // 中心がグリッドの外
        let target = targets(&[[0., 1.0, 0.5, 0.1, 0.1]]);
        assert!(build_targets(&pred.view(), target.view(), &anchors(), &config(0.5)).is_err());

        // クラスが範囲外
        let target = targets(&[[NC as f32, 0.5, 0.5, 0.1, 0.1]]);
        assert!(build_targets(&pred.view(), target.view(), &anchors(), &config(0.5)).is_err());

        // アンカー数と予測の形が合わない
        let target = targets(&[[0., 0.5, 0.5, 0.1, 0.1]]);
        assert!(build_targets(&pred.view(), target.view(), &anchors()[..2], &config(0.5)).is_err());

        // バッチ数が合わない
        let target = Array3::zeros((2, 1, 5));
        assert!(build_targets(&pred.view(), target.view(), &anchors(), &config(0.5)).is_err());

        // 列が足りない
        let target = Array3::zeros((1, 1, 4));
        assert!(build_targets(&pred.view(), target.view(), &anchors(), &config(0.5)).is_err());

        // バッファの形が合わない
        let target = targets(&[[0., 0.5, 0.5, 0.1, 0.1]]);
        let mut out = TargetTensors::new(1, 3, NG, NC + 1);
        let result =
            build_targets_into(&mut out, &pred.view(), target.view(), &anchors(), &config(0.5));
        assert!(result.is_err());
    }

    #[test]
    fn failed_call_leaves_buffer_untouched() {
        let pred = PredBuffers::zeros(1);
        // 1行目は正しく、2行目のクラスが範囲外
        let target = targets(&[
            [1., 0.5, 0.3, 3. / 13., 2. / 13.],
            [NC as f32 + 3., 0.2, 0.2, 0.1, 0.1],
        ]);
        let mut out = TargetTensors::new(1, 3, NG, NC);

        let result =
            build_targets_into(&mut out, &pred.view(), target.view(), &anchors(), &config(0.3));
        assert!(result.is_err());
        assert_eq!(out, TargetTensors::new(1, 3, NG, NC));

        // 中心がグリッドの外の場合も同じ
        let target = targets(&[
            [1., 0.5, 0.3, 3. / 13., 2. / 13.],
            [0., 0.5, 1.2, 0.1, 0.1],
        ]);
        let result =
            build_targets_into(&mut out, &pred.view(), target.view(), &anchors(), &config(0.3));
        assert!(result.is_err());
        assert_eq!(out, TargetTensors::new(1, 3, NG, NC));
    }

    #[test]
    fn anchors_are_scaled_by_stride() {
        let cfg = config(0.5);
        assert_eq!(cfg.stride(), 32.);
        let scaled = cfg.scale_anchors(&[(116., 90.), (32., 64.)]);
        assert_eq!(scaled, vec![Anchor::new(3.625, 2.8125), Anchor::new(1., 2.)]);
    }
}
