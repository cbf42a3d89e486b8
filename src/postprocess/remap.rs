// 该文件是 Shanan （山南西风） 项目的一部分。
// src/postprocess/remap.rs - 坐标还原到原始图像
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

use tracing::debug;

use crate::{
  config::ConfigurationError,
  model::{Candidate, DetectItem},
};

/// 保持长宽比缩放并居中填充的变换参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
  pub ratio: f32,
  pub pad_x: f32,
  pub pad_y: f32,
  pub original_height: f32,
  pub original_width: f32,
}

impl Letterbox {
  /// 尺寸均为 (高, 宽)
  pub fn new(
    original_shape: (usize, usize),
    input_shape: (usize, usize),
  ) -> Result<Self, ConfigurationError> {
    let (org_h, org_w) = original_shape;
    let (input_h, input_w) = input_shape;
    if org_h == 0 || org_w == 0 {
      return Err(ConfigurationError::InvalidOriginalShape {
        height: org_h,
        width: org_w,
      });
    }
    if input_h == 0 || input_w == 0 {
      return Err(ConfigurationError::InvalidInputShape {
        height: input_h,
        width: input_w,
      });
    }

    let (org_h, org_w) = (org_h as f32, org_w as f32);
    let (input_h, input_w) = (input_h as f32, input_w as f32);
    let ratio = f32::min(input_h / org_h, input_w / org_w);

    Ok(Self {
      ratio,
      pad_x: (input_w - ratio * org_w) / 2.0,
      pad_y: (input_h - ratio * org_h) / 2.0,
      original_height: org_h,
      original_width: org_w,
    })
  }

  /// 原始图像坐标 -> 网络输入坐标
  pub fn forward(&self, x: f32, y: f32) -> (f32, f32) {
    (x * self.ratio + self.pad_x, y * self.ratio + self.pad_y)
  }

  /// 网络输入坐标 -> 原始图像坐标
  pub fn inverse(&self, x: f32, y: f32) -> (f32, f32) {
    ((x - self.pad_x) / self.ratio, (y - self.pad_y) / self.ratio)
  }
}

#[derive(Debug, Clone, Copy)]
pub struct CoordinateRemapper {
  min_scale: f32,
  max_scale: f32,
}

impl Default for CoordinateRemapper {
  fn default() -> Self {
    Self {
      min_scale: 0.0,
      max_scale: f32::INFINITY,
    }
  }
}

impl CoordinateRemapper {
  /// 有效框满足 `min_scale <= sqrt(面积) < max_scale`
  pub fn with_valid_scale(min_scale: f32, max_scale: Option<f32>) -> Self {
    Self {
      min_scale,
      max_scale: max_scale.unwrap_or(f32::INFINITY),
    }
  }

  pub fn remap(
    &self,
    candidates: &[Candidate],
    original_shape: (usize, usize),
    input_shape: (usize, usize),
  ) -> Result<Vec<DetectItem>, ConfigurationError> {
    let letterbox = Letterbox::new(original_shape, input_shape)?;
    let items: Vec<DetectItem> = candidates
      .iter()
      .filter_map(|c| self.remap_one(c, &letterbox))
      .collect();
    debug!(
      "坐标还原: {} 个候选框中 {} 个有效",
      candidates.len(),
      items.len()
    );
    Ok(items)
  }

  /// 退化框或尺度无效（含 NaN）的框返回 `None`
  pub fn remap_one(&self, candidate: &Candidate, letterbox: &Letterbox) -> Option<DetectItem> {
    let [x1, y1, x2, y2] = candidate.corners();
    let (x1, y1) = letterbox.inverse(x1, y1);
    let (x2, y2) = letterbox.inverse(x2, y2);

    // NaN 需要保留到尺度检查，不能用 f32::max/min 裁剪
    let x1 = clip_lower(x1, 0.0);
    let y1 = clip_lower(y1, 0.0);
    let x2 = clip_upper(x2, letterbox.original_width - 1.0);
    let y2 = clip_upper(y2, letterbox.original_height - 1.0);

    if x1 > x2 || y1 > y2 {
      return None;
    }

    let scale = ((x2 - x1) * (y2 - y1)).sqrt();
    if !(self.min_scale <= scale && scale < self.max_scale) {
      return None;
    }

    Some(DetectItem::new(
      candidate.class_id,
      candidate.score,
      [x1, y1, x2, y2],
    ))
  }
}

fn clip_lower(v: f32, lower: f32) -> f32 {
  if v < lower { lower } else { v }
}

fn clip_upper(v: f32, upper: f32) -> f32 {
  if v > upper { upper } else { v }
}
