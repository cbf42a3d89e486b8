// 该文件是 Shanan （山南西风） 项目的一部分。
// src/input.rs - 评测数据集输入
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

use serde::{Deserialize, Serialize};

mod dump_file;
pub use self::dump_file::{DumpDirInput, DumpInputError, DumpPayload, DumpRecord, DumpTensor};

/// 标注框，仅随数据项携带，不参与后处理
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GroundTruth {
  pub class_id: usize,
  pub bbox: [f32; 4],
}

/// 数据集中的一项：模型输入加上坐标还原所需的原始尺寸
#[derive(Debug, Clone)]
pub struct DatasetItem<F> {
  pub image: F,
  /// (高, 宽)
  pub original_shape: (usize, usize),
  pub image_id: String,
  pub ground_truth: Option<Vec<GroundTruth>>,
}

impl<F> DatasetItem<F> {
  pub fn new(image: F, original_shape: (usize, usize), image_id: impl Into<String>) -> Self {
    Self {
      image,
      original_shape,
      image_id: image_id.into(),
      ground_truth: None,
    }
  }

  pub fn with_ground_truth(mut self, ground_truth: Vec<GroundTruth>) -> Self {
    self.ground_truth = Some(ground_truth);
    self
  }
}
