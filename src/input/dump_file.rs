// 该文件是 Shanan （山南西风） 项目的一部分。
// src/input/dump_file.rs - 导出张量文件输入
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::{
  fs::File,
  io::BufReader,
  path::{Path, PathBuf},
};

use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  input::{DatasetItem, GroundTruth},
  model::RawTensor,
};

#[derive(Error, Debug)]
pub enum DumpInputError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("导出文件解析失败 {path}: {source}")]
  ParseError {
    path: PathBuf,
    source: serde_json::Error,
  },
  #[error("导出文件写入失败 {path}: {source}")]
  WriteError {
    path: PathBuf,
    source: serde_json::Error,
  },
  #[error("URI 路径无法解码: {0}")]
  InvalidPath(String),
  #[error("张量形状 {shape:?} 与数据长度 {len} 不匹配")]
  ShapeError { shape: Vec<usize>, len: usize },
}

/// 单个输出张量的导出格式
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DumpTensor {
  pub shape: Vec<usize>,
  pub data: Vec<f32>,
}

impl DumpTensor {
  pub fn into_tensor(self) -> Result<RawTensor, DumpInputError> {
    let len = self.data.len();
    ArrayD::from_shape_vec(IxDyn(&self.shape), self.data).map_err(|_| DumpInputError::ShapeError {
      shape: self.shape.clone(),
      len,
    })
  }
}

impl From<&RawTensor> for DumpTensor {
  fn from(tensor: &RawTensor) -> Self {
    Self {
      shape: tensor.shape().to_vec(),
      data: tensor.iter().copied().collect(),
    }
  }
}

/// 一张图像的导出文件内容
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DumpRecord {
  pub image_id: String,
  /// [高, 宽]
  pub original_shape: [usize; 2],
  pub outputs: Vec<DumpTensor>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub ground_truth: Option<Vec<GroundTruth>>,
}

impl DumpRecord {
  pub fn from_item(item: &DatasetItem<Vec<RawTensor>>) -> Self {
    Self {
      image_id: item.image_id.clone(),
      original_shape: [item.original_shape.0, item.original_shape.1],
      outputs: item.image.iter().map(DumpTensor::from).collect(),
      ground_truth: item.ground_truth.clone(),
    }
  }

  pub fn read<P: AsRef<Path>>(path: P) -> Result<Self, DumpInputError> {
    let path = path.as_ref();
    let reader = BufReader::new(File::open(path)?);
    serde_json::from_reader(reader).map_err(|source| DumpInputError::ParseError {
      path: path.to_path_buf(),
      source,
    })
  }

  pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<(), DumpInputError> {
    let path = path.as_ref();
    let file = File::create(path)?;
    serde_json::to_writer(file, self).map_err(|source| DumpInputError::WriteError {
      path: path.to_path_buf(),
      source,
    })
  }

  pub fn into_item(self) -> Result<DatasetItem<Vec<RawTensor>>, DumpInputError> {
    let outputs = self
      .outputs
      .into_iter()
      .map(DumpTensor::into_tensor)
      .collect::<Result<Vec<_>, _>>()?;
    Ok(DatasetItem {
      image: outputs,
      original_shape: (self.original_shape[0], self.original_shape[1]),
      image_id: self.image_id,
      ground_truth: self.ground_truth,
    })
  }
}

/// 回放模型的输入：读取成功的输出张量，或者无法读取的文件
///
/// 无法读取的文件仍作为一项交给工作线程，由聚合端计为缺失结果。
#[derive(Debug, Clone)]
pub enum DumpPayload {
  Outputs(Vec<RawTensor>),
  Unreadable { path: PathBuf, reason: String },
}

impl From<Vec<RawTensor>> for DumpPayload {
  fn from(outputs: Vec<RawTensor>) -> Self {
    Self::Outputs(outputs)
  }
}

/// `dump:///path/to/dir` 或 `dump:///path/to/file.json`
///
/// 目录中的 `*.json` 文件按文件名排序，迭代时才逐个读取。
/// 每个文件恰好产生一项，无法读取的文件产生 [`DumpPayload::Unreadable`]。
#[derive(Debug, Clone)]
pub struct DumpDirInput {
  files: Vec<PathBuf>,
}

impl FromUrlWithScheme for DumpDirInput {
  const SCHEME: &'static str = "dump";
}

impl FromUrl for DumpDirInput {
  type Error = DumpInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(DumpInputError::SchemeMismatch(url.scheme().to_string()));
    }
    let path = urlencoding::decode(url.path())
      .map_err(|e| DumpInputError::InvalidPath(format!("{}: {}", url.path(), e)))?;
    Self::open(&*path)
  }
}

impl DumpDirInput {
  pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DumpInputError> {
    let path = path.as_ref();
    let files = if path.is_dir() {
      let mut files = std::fs::read_dir(path)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()?;
      files.retain(|p| p.extension().is_some_and(|ext| ext == "json"));
      files.sort();
      files
    } else {
      // 单个文件在此处检查是否存在
      File::open(path)?;
      vec![path.to_path_buf()]
    };
    info!("导出数据集 {}: 共 {} 个文件", path.display(), files.len());
    Ok(Self { files })
  }

  pub fn len(&self) -> usize {
    self.files.len()
  }

  pub fn is_empty(&self) -> bool {
    self.files.is_empty()
  }
}

impl IntoIterator for DumpDirInput {
  type Item = DatasetItem<DumpPayload>;
  type IntoIter = DumpDirIter;

  fn into_iter(self) -> Self::IntoIter {
    DumpDirIter {
      files: self.files.into_iter(),
    }
  }
}

pub struct DumpDirIter {
  files: std::vec::IntoIter<PathBuf>,
}

impl Iterator for DumpDirIter {
  type Item = DatasetItem<DumpPayload>;

  fn next(&mut self) -> Option<Self::Item> {
    let path = self.files.next()?;
    let item = match DumpRecord::read(&path).and_then(DumpRecord::into_item) {
      Ok(item) => {
        debug!("读取导出文件 {}", path.display());
        DatasetItem {
          image: DumpPayload::Outputs(item.image),
          original_shape: item.original_shape,
          image_id: item.image_id,
          ground_truth: item.ground_truth,
        }
      }
      Err(e) => {
        error!("导出文件无法读取 {}: {}", path.display(), e);
        let image_id = path
          .file_stem()
          .map(|stem| stem.to_string_lossy().into_owned())
          .unwrap_or_default();
        DatasetItem::new(
          DumpPayload::Unreadable {
            path,
            reason: e.to_string(),
          },
          (0, 0),
          image_id,
        )
      }
    };
    Some(item)
  }

  fn size_hint(&self) -> (usize, Option<usize>) {
    self.files.size_hint()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn record(id: &str) -> DumpRecord {
    DumpRecord {
      image_id: id.to_string(),
      original_shape: [480, 640],
      outputs: vec![DumpTensor {
        shape: vec![1, 1, 1, 1, 6],
        data: vec![0.0, 0.0, 0.0, 0.0, 1.0, 2.0],
      }],
      ground_truth: None,
    }
  }

  #[test]
  fn reads_files_in_name_order() {
    let dir = tempfile::tempdir().unwrap();
    record("b").write(dir.path().join("0002.json")).unwrap();
    record("a").write(dir.path().join("0001.json")).unwrap();
    std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

    let url = Url::from_directory_path(dir.path())
      .unwrap()
      .to_string()
      .replacen("file", "dump", 1);
    let input = DumpDirInput::from_url(&Url::parse(&url).unwrap()).unwrap();
    assert_eq!(input.len(), 2);

    let items: Vec<_> = input.into_iter().collect();
    assert_eq!(items[0].image_id, "a");
    assert_eq!(items[1].image_id, "b");
    assert_eq!(items[0].original_shape, (480, 640));
    let DumpPayload::Outputs(outputs) = &items[0].image else {
      panic!("first file should be readable");
    };
    assert_eq!(outputs[0].shape(), &[1, 1, 1, 1, 6]);
    assert_eq!(outputs[0][IxDyn(&[0, 0, 0, 0, 5])], 2.0);
  }

  #[test]
  fn files_are_read_lazily() {
    let dir = tempfile::tempdir().unwrap();
    record("a").write(dir.path().join("a.json")).unwrap();
    record("b").write(dir.path().join("b.json")).unwrap();

    let mut iter = DumpDirInput::open(dir.path()).unwrap().into_iter();
    // 打开之后才写坏的文件在迭代到它时才暴露
    std::fs::write(dir.path().join("b.json"), "{ broken").unwrap();
    assert_eq!(iter.next().unwrap().image_id, "a");
    let broken = iter.next().unwrap();
    assert_eq!(broken.image_id, "b");
    assert!(matches!(broken.image, DumpPayload::Unreadable { .. }));
    assert!(iter.next().is_none());
  }

  #[test]
  fn percent_encoded_paths_are_decoded() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("验证 集");
    std::fs::create_dir(&data).unwrap();
    record("a").write(data.join("a.json")).unwrap();

    let url = Url::from_directory_path(&data)
      .unwrap()
      .to_string()
      .replacen("file", "dump", 1);
    let url = Url::parse(&url).unwrap();
    assert!(url.path().contains("%20"));
    let input = DumpDirInput::from_url(&url).unwrap();
    assert_eq!(input.len(), 1);
  }

  #[cfg(target_os = "linux")]
  #[test]
  fn write_failure_is_reported_as_write_error() {
    let err = record("full").write("/dev/full").unwrap_err();
    assert!(matches!(err, DumpInputError::WriteError { .. }), "{err}");
  }

  #[test]
  fn rejects_other_schemes() {
    let url = Url::parse("file:///tmp").unwrap();
    assert!(matches!(
      DumpDirInput::from_url(&url),
      Err(DumpInputError::SchemeMismatch(_))
    ));
  }

  #[test]
  fn shape_must_match_data_length() {
    let tensor = DumpTensor {
      shape: vec![1, 2, 3],
      data: vec![0.0; 5],
    };
    assert!(matches!(
      tensor.into_tensor(),
      Err(DumpInputError::ShapeError { len: 5, .. })
    ));
  }

  #[test]
  fn ground_truth_is_carried() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gt.json");
    let mut rec = record("gt");
    rec.ground_truth = Some(vec![GroundTruth {
      class_id: 2,
      bbox: [1.0, 2.0, 3.0, 4.0],
    }]);
    rec.write(&path).unwrap();

    let item = DumpDirInput::open(&path)
      .unwrap()
      .into_iter()
      .next()
      .unwrap();
    assert_eq!(item.ground_truth.unwrap()[0].class_id, 2);
  }
}
