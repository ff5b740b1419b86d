//! # YOLOv3 学習・推論用ユーティリティ
//!
//! このクレートは、YOLOv3 形式の1段階物体検出モデルの学習と推論で使う数値処理をまとめたものです。
//!
//! ## 主な機能
//!
//! 1. **IoU**: 対角点形式・中心点形式のボックス集合の IoU を計算します。
//! 2. **NMS**: 推論結果を objectness で絞り込み、クラスごとに重複した検出を取り除きます。
//! 3. **ターゲット作成**: 正解ボックスをアンカーとグリッドセルに割り当て、損失計算用のターゲットを作ります。
//! 4. **評価**: 適合率・再現率曲線から AP を計算します。
//!
//! ## Example
//! ```
//! use ndarray::array;
//! use yolo_v3_utils::nms::non_max_suppression;
//!
//! // (画像数, ボックス数, 5 + クラス数)
//! let prediction = array![[[50., 50., 20., 20., 0.9, 0.2, 0.8]]];
//! let detections = non_max_suppression(prediction.view(), 2, 0.5, 0.4)?;
//! assert_eq!(detections[0][0].class, 1);
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod ap;
pub mod bbox;
pub mod detection_result;
pub mod iou;
pub mod labels;
pub mod nms;
pub mod targets;

pub use crate::bbox::{BBox, BoxFormat, CenterBox};
pub use crate::detection_result::Detection;
