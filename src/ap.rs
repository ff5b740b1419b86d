//! 適合率・再現率曲線から Average Precision (AP) を計算するモジュール

use anyhow::{ensure, Result};
use log::debug;

/// PASCAL VOC (py-faster-rcnn) の補間方式で AP を計算します。
///
/// # Args
/// * `recall` - 再現率の列
/// * `precision` - 適合率の列 (`recall` と同じ長さ)
///
/// # Return
/// * AP
///
/// 両端に番兵を追加し、適合率を右から累積最大で包絡させてから、
/// 再現率が変化する点ごとに (Δ再現率 × 適合率) を足し合わせます。
/// 再現率が単調増加であることは仮定しません。
pub fn compute_ap(recall: &[f64], precision: &[f64]) -> Result<f64> {
    ensure!(
        recall.len() == precision.len(),
        "recall and precision lengths differ: {} vs {}",
        recall.len(),
        precision.len()
    );

    let mrec: Vec<f64> = std::iter::once(0.)
        .chain(recall.iter().copied())
        .chain(std::iter::once(1.))
        .collect();
    let mut mpre: Vec<f64> = std::iter::once(0.)
        .chain(precision.iter().copied())
        .chain(std::iter::once(0.))
        .collect();

    // 適合率の包絡線
    for i in (1..mpre.len()).rev() {
        mpre[i - 1] = mpre[i - 1].max(mpre[i]);
    }

    let ap = (0..mrec.len() - 1)
        .filter(|&i| mrec[i + 1] != mrec[i])
        .map(|i| (mrec[i + 1] - mrec[i]) * mpre[i + 1])
        .sum();
    Ok(ap)
}

/// 信頼度の降順に並べた検出結果に対する適合率・再現率曲線
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrecisionRecall {
    pub recall: Vec<f64>,
    pub precision: Vec<f64>,
}

impl PrecisionRecall {
    /// 検出結果ごとの (信頼度, 正解かどうか) から曲線を作ります。
    ///
    /// # Args
    /// * `matches` - 1クラス分の検出結果。順不同でよい
    /// * `n_gt` - そのクラスの正解ボックスの数
    ///
    /// # Return
    /// * 信頼度の降順に累積した曲線。`n_gt` が 0 なら空
    pub fn from_matches(matches: &[(f64, bool)], n_gt: usize) -> Self {
        if n_gt == 0 {
            return Self::default();
        }

        let mut sorted = matches.to_vec();
        sorted.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut tp = 0usize;
        let (recall, precision) = sorted
            .iter()
            .enumerate()
            .map(|(i, &(_, is_tp))| {
                if is_tp {
                    tp += 1;
                }
                (tp as f64 / n_gt as f64, tp as f64 / (i + 1) as f64)
            })
            .unzip();
        Self { recall, precision }
    }

    /// この曲線の AP
    pub fn average_precision(&self) -> Result<f64> {
        let ap = compute_ap(&self.recall, &self.precision)?;
        debug!("ap: {:.4} over {} detections", ap, self.recall.len());
        Ok(ap)
    }
}
