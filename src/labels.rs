//! クラス名ファイルの読み込みとラベルの one-hot 化

use std::path::Path;

use anyhow::{ensure, Context, Result};
use log::info;
use ndarray::Array2;

/// 改行区切りのクラス名ファイルを読み込みます。
///
/// # Args
/// * `path` - クラス名ファイルのパス
///
/// # Return
/// * 行番号をクラス番号とするクラス名のベクトル
///
/// 最後の要素 (末尾の改行のあとの空文字列) は捨てます。
pub fn load_classes<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read class names: {}", path.display()))?;

    let mut names: Vec<String> = text.split('\n').map(str::to_owned).collect();
    names.pop();
    info!("{} classes loaded from {}", names.len(), path.display());
    Ok(names)
}

/// クラス番号を one-hot の行列に変換します。
///
/// # Args
/// * `labels` - クラス番号
/// * `num_classes` - クラス数
///
/// # Return
/// * (ラベル数, クラス数) の行列
pub fn to_categorical(labels: &[usize], num_classes: usize) -> Result<Array2<u8>> {
    let mut out = Array2::zeros((labels.len(), num_classes));
    for (i, &label) in labels.iter().enumerate() {
        ensure!(label < num_classes, "label {} outside 0..{}", label, num_classes);
        out[[i, label]] = 1;
    }
    Ok(out)
}
