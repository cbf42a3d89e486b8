// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output.rs - 评测结果输出
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

use crate::model::DetectItem;

/// 指标累加器，由聚合线程独占，按结果到达顺序调用 `update`
pub trait MetricAccumulator {
  fn update(&mut self, boxes: &[DetectItem], image_id: &str);

  /// 返回 (指标名, 指标值)，两者一一对应
  fn get(&self) -> (Vec<String>, Vec<String>);
}

impl<T: MetricAccumulator + ?Sized> MetricAccumulator for &mut T {
  fn update(&mut self, boxes: &[DetectItem], image_id: &str) {
    (**self).update(boxes, image_id);
  }

  fn get(&self) -> (Vec<String>, Vec<String>) {
    (**self).get()
  }
}

mod recorder;
pub use self::recorder::{CocoDetection, DetectionRecorder, RecorderError, write_report};
