// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model.rs - 推理模型接口与检测结果
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

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

/// 单个检测尺度的原始输出，规范形状为 `(1, A, H, W, 5 + C)`
pub type RawTensor = ArrayD<f32>;

/// 推理引擎。每个实例只被一个工作线程持有
pub trait Model {
  type Input;
  type Error;

  /// 每个检测尺度返回一个原始输出张量
  fn infer(&self, input: &Self::Input) -> Result<Vec<RawTensor>, Self::Error>;
}

/// 按需创建推理会话，评测时每个工作线程各自构建一个
pub trait ModelBuilder {
  type Model: Model;
  type Error;

  fn build(&self) -> Result<Self::Model, Self::Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectItem {
  pub class_id: usize,
  pub score: f32,
  pub bbox: [f32; 4], // [x_min, y_min, x_max, y_max]
}

impl DetectItem {
  pub fn new(class_id: usize, score: f32, bbox: [f32; 4]) -> Self {
    Self {
      class_id,
      score,
      bbox,
    }
  }

  pub fn width(&self) -> f32 {
    self.bbox[2] - self.bbox[0]
  }

  pub fn height(&self) -> f32 {
    self.bbox[3] - self.bbox[1]
  }

  pub fn area(&self) -> f32 {
    self.width() * self.height()
  }

  /// 交并比，分母以 `f32::MIN_POSITIVE` 为下限
  pub fn iou(&self, other: &DetectItem) -> f32 {
    let left = self.bbox[0].max(other.bbox[0]);
    let top = self.bbox[1].max(other.bbox[1]);
    let right = self.bbox[2].min(other.bbox[2]);
    let bottom = self.bbox[3].min(other.bbox[3]);

    let intersection = (right - left).max(0.0) * (bottom - top).max(0.0);
    let union = self.area() + other.area() - intersection;
    intersection / union.max(f32::MIN_POSITIVE)
  }
}

/// 网格解码得到的候选框，位于网络输入空间，中心点加宽高表示
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
  pub cx: f32,
  pub cy: f32,
  pub w: f32,
  pub h: f32,
  pub score: f32,
  pub class_id: usize,
}

impl Candidate {
  pub fn corners(&self) -> [f32; 4] {
    [
      self.cx - self.w * 0.5,
      self.cy - self.h * 0.5,
      self.cx + self.w * 0.5,
      self.cy + self.h * 0.5,
    ]
  }
}

mod replay;
pub use self::replay::{ReplayError, ReplayModel, ReplayModelBuilder};
