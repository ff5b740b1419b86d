use anyhow::Result;
use ndarray::Array3;

use yolo_v3_utils::ap::PrecisionRecall;
use yolo_v3_utils::iou::iou_inclusive;
use yolo_v3_utils::nms::NmsConfig;
use yolo_v3_utils::BBox;

fn main() -> Result<()> {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Debug)
        .init();

    // 1枚の画像に 3 クラス分の予測を並べる
    let num_classes = 3;
    let mut prediction = Array3::<f32>::zeros((1, 6, 5 + num_classes));
    #[rustfmt::skip]
    let rows = [
        [100., 100., 50., 80., 0.95, 0.9, 0.1, 0.0],
        [104., 98.,  52., 78., 0.80, 0.8, 0.1, 0.1],
        [300., 200., 40., 40., 0.70, 0.1, 0.7, 0.2],
        [302., 205., 40., 38., 0.40, 0.1, 0.8, 0.1],
        [200., 300., 60., 30., 0.60, 0.0, 0.1, 0.9],
        [220., 300., 60., 30., 0.55, 0.1, 0.0, 0.9],
    ];
    for (i, r) in rows.iter().enumerate() {
        for (j, &v) in r.iter().enumerate() {
            prediction[[0, i, j]] = v;
        }
    }

    let config = NmsConfig::new(num_classes);
    let detections = config.run(prediction.view())?;
    for d in &detections[0] {
        println!("{:?}", d);
    }

    // 正解ボックスと IoU 0.5 以上で重なれば正解とする
    let ground_truth = [
        (0, BBox::new(75., 60., 125., 140.)),
        (1, BBox::new(280., 180., 320., 220.)),
        (2, BBox::new(170., 285., 230., 315.)),
    ];
    let matches: Vec<(f64, bool)> = detections[0]
        .iter()
        .map(|d| {
            let hit = ground_truth
                .iter()
                .any(|(c, gt)| *c == d.class && iou_inclusive(gt, &d.bbox()) >= 0.5);
            (d.object_conf as f64, hit)
        })
        .collect();

    let ap = PrecisionRecall::from_matches(&matches, ground_truth.len()).average_precision()?;
    println!("AP: {:.4}", ap);

    Ok(())
}
