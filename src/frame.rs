// 该文件是 Shanan （山南西风） 项目的一部分。
// src/frame.rs - HWC 图像张量定义
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

use ndarray::{Array3, ArrayView3};

const COLOR_CHANNELS: usize = 3;

/// 交给推理引擎时声明的颜色空间
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorSpace {
  #[default]
  Rgb,
  Bgr,
  Yuv444,
}

/// 预处理后的输入图像，排布为 (高, 宽, 通道)
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
  data: Array3<u8>,
  color: ColorSpace,
}

impl ImageTensor {
  pub fn with_shape(height: usize, width: usize, color: ColorSpace) -> Self {
    Self {
      data: Array3::zeros((height, width, COLOR_CHANNELS)),
      color,
    }
  }

  /// 通道数必须为 3，否则返回 `None`
  pub fn from_hwc(data: Array3<u8>, color: ColorSpace) -> Option<Self> {
    if data.dim().2 != COLOR_CHANNELS {
      return None;
    }
    Some(Self { data, color })
  }

  pub fn height(&self) -> usize {
    self.data.dim().0
  }

  pub fn width(&self) -> usize {
    self.data.dim().1
  }

  pub fn channels(&self) -> usize {
    COLOR_CHANNELS
  }

  pub fn color(&self) -> ColorSpace {
    self.color
  }

  pub fn as_hwc(&self) -> ArrayView3<'_, u8> {
    self.data.view()
  }

  /// 交换 R 与 B 通道，YUV 图像保持不变
  pub fn swap_rb(mut self) -> Self {
    let target = match self.color {
      ColorSpace::Rgb => ColorSpace::Bgr,
      ColorSpace::Bgr => ColorSpace::Rgb,
      ColorSpace::Yuv444 => return self,
    };
    for mut pixel in self.data.rows_mut() {
      pixel.swap(0, 2);
    }
    self.color = target;
    self
  }

  /// 转为 (通道, 高, 宽) 排布的连续数据
  pub fn to_chw(&self) -> Array3<u8> {
    self
      .data
      .view()
      .permuted_axes([2, 0, 1])
      .as_standard_layout()
      .into_owned()
  }
}
