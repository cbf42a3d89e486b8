// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/recorder.rs - 检测结果记录与报告
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
  io::{BufWriter, Write},
  path::Path,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::{model::DetectItem, output::MetricAccumulator};

#[derive(Error, Debug)]
pub enum RecorderError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("JSON 序列化错误: {0}")]
  JsonError(#[from] serde_json::Error),
  #[error("指标名数量 {names} 与指标值数量 {values} 不一致")]
  LengthMismatch { names: usize, values: usize },
}

/// COCO 检测结果格式，`bbox` 为 `[x, y, w, h]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CocoDetection {
  pub image_id: String,
  pub category_id: usize,
  pub bbox: [f32; 4],
  pub score: f32,
}

/// 统计检测数量并记录全部检测框，供外部 mAP 工具使用
#[derive(Debug, Default)]
pub struct DetectionRecorder {
  class_names: Vec<String>,
  category_ids: Option<Vec<usize>>,
  images: usize,
  per_class: Vec<usize>,
  score_sum: f64,
  detections: Vec<CocoDetection>,
}

impl DetectionRecorder {
  pub fn new(class_names: Vec<String>) -> Self {
    Self {
      per_class: vec![0; class_names.len()],
      class_names,
      ..Default::default()
    }
  }

  /// 类别编号到数据集 category_id 的映射，未覆盖的编号原样输出
  pub fn with_category_ids(mut self, category_ids: Vec<usize>) -> Self {
    self.category_ids = Some(category_ids);
    self
  }

  pub fn images(&self) -> usize {
    self.images
  }

  pub fn detections(&self) -> &[CocoDetection] {
    &self.detections
  }

  pub fn write_json<P: AsRef<Path>>(&self, path: P) -> Result<(), RecorderError> {
    let path = path.as_ref();
    let writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer(writer, &self.detections)?;
    info!(
      "已写入 {} 个检测结果到 {}",
      self.detections.len(),
      path.display()
    );
    Ok(())
  }

  fn category_id(&self, class_id: usize) -> usize {
    self
      .category_ids
      .as_ref()
      .and_then(|ids| ids.get(class_id).copied())
      .unwrap_or(class_id)
  }
}

impl MetricAccumulator for DetectionRecorder {
  fn update(&mut self, boxes: &[DetectItem], image_id: &str) {
    self.images += 1;
    for b in boxes {
      if b.class_id >= self.per_class.len() {
        warn!("类别编号 {} 超出类别名称范围", b.class_id);
        self.per_class.resize(b.class_id + 1, 0);
      }
      self.per_class[b.class_id] += 1;
      self.score_sum += f64::from(b.score);
      self.detections.push(CocoDetection {
        image_id: image_id.to_string(),
        category_id: self.category_id(b.class_id),
        bbox: [b.bbox[0], b.bbox[1], b.width(), b.height()],
        score: b.score,
      });
    }
  }

  fn get(&self) -> (Vec<String>, Vec<String>) {
    let total = self.detections.len();
    let mean_score = if total == 0 {
      0.0
    } else {
      self.score_sum / total as f64
    };

    let mut names = vec![
      "images".to_string(),
      "detections".to_string(),
      "mean_score".to_string(),
    ];
    let mut values = vec![
      self.images.to_string(),
      total.to_string(),
      format!("{:.6}", mean_score),
    ];
    for (class_id, &count) in self.per_class.iter().enumerate() {
      if count == 0 {
        continue;
      }
      let name = self
        .class_names
        .get(class_id)
        .map(|n| n.replace(' ', "_"))
        .unwrap_or_else(|| format!("class_{}", class_id));
      names.push(format!("detections/{}", name));
      values.push(count.to_string());
    }
    (names, values)
  }
}

/// 每行一个 `名称 值`
pub fn write_report<P: AsRef<Path>>(
  path: P,
  names: &[String],
  values: &[String],
) -> Result<(), RecorderError> {
  if names.len() != values.len() {
    return Err(RecorderError::LengthMismatch {
      names: names.len(),
      values: values.len(),
    });
  }
  let path = path.as_ref();
  if let Some(parent) = path.parent()
    && !parent.as_os_str().is_empty()
  {
    std::fs::create_dir_all(parent)?;
  }
  let mut writer = BufWriter::new(File::create(path)?);
  for (name, value) in names.iter().zip(values) {
    writeln!(writer, "{} {}", name, value)?;
  }
  writer.flush()?;
  info!("评测报告已写入 {}", path.display());
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn counts_detections_per_class() {
    let mut recorder =
      DetectionRecorder::new(vec!["person".into(), "traffic light".into(), "car".into()]);
    recorder.update(
      &[
        DetectItem::new(0, 0.5, [0.0, 0.0, 10.0, 20.0]),
        DetectItem::new(1, 1.0, [5.0, 5.0, 6.0, 6.0]),
      ],
      "img-1",
    );
    recorder.update(&[], "img-2");

    let (names, values) = recorder.get();
    assert_eq!(
      names,
      vec![
        "images",
        "detections",
        "mean_score",
        "detections/person",
        "detections/traffic_light"
      ]
    );
    assert_eq!(values, vec!["2", "2", "0.750000", "1", "1"]);
    assert_eq!(recorder.detections()[0].bbox, [0.0, 0.0, 10.0, 20.0]);
  }

  #[test]
  fn maps_category_ids() {
    let mut recorder = DetectionRecorder::new(vec!["a".into(), "b".into()]).with_category_ids(vec![1, 2]);
    recorder.update(&[DetectItem::new(1, 0.9, [0.0, 0.0, 1.0, 1.0])], "x");
    recorder.update(&[DetectItem::new(7, 0.9, [0.0, 0.0, 1.0, 1.0])], "y");
    assert_eq!(recorder.detections()[0].category_id, 2);
    assert_eq!(recorder.detections()[1].category_id, 7);
    assert!(recorder.get().0.contains(&"detections/class_7".to_string()));
  }

  #[test]
  fn writes_report_and_json() {
    let dir = tempfile::tempdir().unwrap();
    let mut recorder = DetectionRecorder::new(vec!["a".into()]);
    recorder.update(&[DetectItem::new(0, 0.25, [1.0, 2.0, 4.0, 6.0])], "img");

    let (names, values) = recorder.get();
    let report = dir.path().join("out/report.txt");
    write_report(&report, &names, &values).unwrap();
    let text = std::fs::read_to_string(&report).unwrap();
    assert_eq!(
      text,
      "images 1\ndetections 1\nmean_score 0.250000\ndetections/a 1\n"
    );

    let json = dir.path().join("detections.json");
    recorder.write_json(&json).unwrap();
    let parsed: Vec<CocoDetection> =
      serde_json::from_str(&std::fs::read_to_string(&json).unwrap()).unwrap();
    assert_eq!(parsed[0].bbox, [1.0, 2.0, 3.0, 4.0]);
    assert_eq!(parsed[0].image_id, "img");
  }

  #[test]
  fn report_rejects_length_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
      write_report(dir.path().join("r.txt"), &["a".into()], &[]),
      Err(RecorderError::LengthMismatch { names: 1, values: 0 })
    ));
  }
}
