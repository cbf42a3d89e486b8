// 该文件是 Shanan （山南西风） 项目的一部分。
// src/postprocess/decode.rs - 网格输出解码
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

use std::borrow::Cow;

use ndarray::{IxDyn, Ix5, s};
use tracing::{debug, error};

use crate::{
  config::{AnchorSet, ConfigurationError, DecoderVariant, TensorLayout},
  model::{Candidate, RawTensor},
};

/// 将单个尺度的原始输出解码为网络输入空间中的候选框
#[derive(Debug, Clone, Copy)]
pub struct GridDecoder {
  variant: DecoderVariant,
  layout: TensorLayout,
  num_classes: usize,
}

impl GridDecoder {
  pub fn new(variant: DecoderVariant, num_classes: usize) -> Self {
    Self {
      variant,
      layout: TensorLayout::Canonical,
      num_classes,
    }
  }

  pub fn with_layout(mut self, layout: TensorLayout) -> Self {
    self.layout = layout;
    self
  }

  pub fn variant(&self) -> DecoderVariant {
    self.variant
  }

  /// 输出顺序为锚框、行、列，与规范张量的展开顺序一致。不做分数过滤。
  pub fn decode(
    &self,
    tensor: &RawTensor,
    anchor_set: &AnchorSet,
  ) -> Result<Vec<Candidate>, ConfigurationError> {
    if anchor_set.is_empty() {
      return Err(ConfigurationError::EmptyAnchorSet { scale: 0 });
    }

    let canonical = canonicalize(tensor, self.layout, anchor_set.len(), self.num_classes)?;
    let view = canonical
      .view()
      .into_dimensionality::<Ix5>()
      .map_err(|_| ConfigurationError::TensorRank {
        expected: 5,
        found: canonical.ndim(),
      })?;
    let (_, num_anchors, grid_h, grid_w, _) = view.dim();
    let stride = anchor_set.stride;

    let mut candidates = Vec::with_capacity(num_anchors * grid_h * grid_w);
    for (a, &[anchor_w, anchor_h]) in anchor_set.anchors.iter().enumerate() {
      for row in 0..grid_h {
        for col in 0..grid_w {
          let cell = view.slice(s![0usize, a, row, col, ..]);

          // x 对应列，y 对应行
          let (grid_x, grid_y) = (col as f32, row as f32);
          let (cx, cy, w, h) = match self.variant {
            DecoderVariant::Legacy => (
              (sigmoid(cell[0]) + grid_x) * stride,
              (sigmoid(cell[1]) + grid_y) * stride,
              cell[2].exp() * anchor_w * stride,
              cell[3].exp() * anchor_h * stride,
            ),
            DecoderVariant::AnchorFree => (
              (sigmoid(cell[0]) * 2.0 - 0.5 + grid_x) * stride,
              (sigmoid(cell[1]) * 2.0 - 0.5 + grid_y) * stride,
              (sigmoid(cell[2]) * 2.0).powi(2) * anchor_w,
              (sigmoid(cell[3]) * 2.0).powi(2) * anchor_h,
            ),
          };

          let mut class_id = 0usize;
          let mut max_logit = cell[5];
          for c in 1..self.num_classes {
            let logit = cell[5 + c];
            if logit > max_logit {
              max_logit = logit;
              class_id = c;
            }
          }

          candidates.push(Candidate {
            cx,
            cy,
            w,
            h,
            score: sigmoid(cell[4]) * sigmoid(max_logit),
            class_id,
          });
        }
      }
    }

    debug!(
      "尺度 stride={} 网格 {}x{} 解码得到 {} 个候选框",
      stride,
      grid_h,
      grid_w,
      candidates.len()
    );
    Ok(candidates)
  }
}

/// 把不同排布的输出统一为 `(1, A, H, W, 5 + C)`
pub fn canonicalize(
  tensor: &RawTensor,
  layout: TensorLayout,
  num_anchors: usize,
  num_classes: usize,
) -> Result<Cow<'_, RawTensor>, ConfigurationError> {
  let channels = 5 + num_classes;
  let shape = tensor.shape();

  match layout {
    TensorLayout::Canonical => {
      check_rank(shape, 5)?;
      check_batch(shape)?;
      if shape[1] != num_anchors {
        error!("输出张量锚框维度不匹配: {:?}", shape);
        return Err(ConfigurationError::TensorAnchorMismatch {
          expected: num_anchors,
          found: shape[1],
        });
      }
      if shape[4] != channels {
        error!("输出张量通道数不匹配: {:?}", shape);
        return Err(ConfigurationError::ChannelMismatch {
          expected: channels,
          found: shape[4],
        });
      }
      Ok(Cow::Borrowed(tensor))
    }
    TensorLayout::PackedNhwc => {
      check_rank(shape, 4)?;
      check_batch(shape)?;
      unpack_nhwc(tensor, shape[1], shape[2], shape[3], num_anchors, channels).map(Cow::Owned)
    }
    TensorLayout::PackedNchw => {
      check_rank(shape, 4)?;
      check_batch(shape)?;
      let nhwc = tensor.view().permuted_axes(IxDyn(&[0, 2, 3, 1]));
      unpack_nhwc(
        &nhwc.to_owned(),
        shape[2],
        shape[3],
        shape[1],
        num_anchors,
        channels,
      )
      .map(Cow::Owned)
    }
  }
}

/// `(1, H, W, A * (5 + C))` -> `(1, A, H, W, 5 + C)`
fn unpack_nhwc(
  tensor: &RawTensor,
  grid_h: usize,
  grid_w: usize,
  packed: usize,
  num_anchors: usize,
  channels: usize,
) -> Result<RawTensor, ConfigurationError> {
  if packed != num_anchors * channels {
    error!(
      "打包通道数 {} 不等于 锚框数 {} x (5 + 类别数) {}",
      packed, num_anchors, channels
    );
    return Err(ConfigurationError::ChannelMismatch {
      expected: num_anchors * channels,
      found: packed,
    });
  }

  let reshaped = tensor
    .to_shape(IxDyn(&[1, grid_h, grid_w, num_anchors, channels]))
    .map_err(|_| ConfigurationError::ChannelMismatch {
      expected: num_anchors * channels,
      found: packed,
    })?;
  Ok(
    reshaped
      .permuted_axes(IxDyn(&[0, 3, 1, 2, 4]))
      .as_standard_layout()
      .into_owned(),
  )
}

fn check_rank(shape: &[usize], expected: usize) -> Result<(), ConfigurationError> {
  if shape.len() != expected {
    error!("输出张量维度不匹配: {:?}", shape);
    return Err(ConfigurationError::TensorRank {
      expected,
      found: shape.len(),
    });
  }
  Ok(())
}

fn check_batch(shape: &[usize]) -> Result<(), ConfigurationError> {
  if shape[0] != 1 {
    return Err(ConfigurationError::BatchSize { found: shape[0] });
  }
  Ok(())
}

pub fn sigmoid(x: f32) -> f32 {
  1.0 / (1.0 + (-x).exp())
}

#[cfg(test)]
mod tests {
  use super::*;
  use ndarray::ArrayD;

  fn zeros(anchors: usize, h: usize, w: usize, classes: usize) -> RawTensor {
    ArrayD::zeros(IxDyn(&[1, anchors, h, w, 5 + classes]))
  }

  #[test]
  fn all_zero_tensor_gives_quarter_score_at_cell_centers() {
    let tensor = zeros(2, 3, 4, 2);
    let anchors = AnchorSet::new(vec![[1.0, 2.0], [3.0, 4.0]], 8.0);
    let decoder = GridDecoder::new(DecoderVariant::Legacy, 2);
    let candidates = decoder.decode(&tensor, &anchors).unwrap();
    assert_eq!(candidates.len(), 2 * 3 * 4);

    for (i, c) in candidates.iter().enumerate() {
      let a = i / 12;
      let row = (i % 12) / 4;
      let col = i % 4;
      assert_eq!(c.score, 0.25);
      assert_eq!(c.class_id, 0);
      assert_eq!(c.cx, (col as f32 + 0.5) * 8.0);
      assert_eq!(c.cy, (row as f32 + 0.5) * 8.0);
      assert_eq!(c.w, anchors.anchors[a][0] * 8.0);
      assert_eq!(c.h, anchors.anchors[a][1] * 8.0);
    }
  }

  #[test]
  fn anchor_free_sizes_are_not_scaled_by_stride() {
    let tensor = zeros(1, 1, 1, 1);
    let anchors = AnchorSet::new(vec![[10.0, 20.0]], 16.0);
    let decoder = GridDecoder::new(DecoderVariant::AnchorFree, 1);
    let c = decoder.decode(&tensor, &anchors).unwrap()[0];
    // σ(0) * 2 - 0.5 = 0.5
    assert_eq!(c.cx, 8.0);
    assert_eq!(c.cy, 8.0);
    // (σ(0) * 2)² = 1
    assert_eq!(c.w, 10.0);
    assert_eq!(c.h, 20.0);
  }

  #[test]
  fn column_maps_to_x_and_row_to_y() {
    let tensor = zeros(1, 2, 3, 1);
    let anchors = AnchorSet::new(vec![[1.0, 1.0]], 10.0);
    let decoder = GridDecoder::new(DecoderVariant::Legacy, 1);
    let candidates = decoder.decode(&tensor, &anchors).unwrap();
    // row 1, col 2
    let c = candidates[5];
    assert_eq!(c.cx, 25.0);
    assert_eq!(c.cy, 15.0);
  }

  #[test]
  fn each_cell_reads_its_own_channels() {
    let mut tensor = zeros(2, 2, 2, 1);
    for a in 0..2 {
      for row in 0..2 {
        for col in 0..2 {
          tensor[IxDyn(&[0, a, row, col, 4])] = (a * 4 + row * 2 + col) as f32 - 4.0;
        }
      }
    }
    let anchors = AnchorSet::new(vec![[1.0, 1.0], [2.0, 2.0]], 8.0);
    let candidates = GridDecoder::new(DecoderVariant::Legacy, 1)
      .decode(&tensor, &anchors)
      .unwrap();
    for (i, c) in candidates.iter().enumerate() {
      let expected = sigmoid(i as f32 - 4.0) * sigmoid(0.0);
      assert!((c.score - expected).abs() < 1e-7, "candidate {i}");
    }
  }

  #[test]
  fn picks_best_class_and_applies_sigmoid_to_score() {
    let mut tensor = zeros(1, 1, 1, 3);
    tensor[IxDyn(&[0, 0, 0, 0, 4])] = 2.0;
    tensor[IxDyn(&[0, 0, 0, 0, 6])] = 1.5;
    tensor[IxDyn(&[0, 0, 0, 0, 7])] = -1.0;
    let anchors = AnchorSet::new(vec![[1.0, 1.0]], 8.0);
    let c = GridDecoder::new(DecoderVariant::Legacy, 3)
      .decode(&tensor, &anchors)
      .unwrap()[0];
    assert_eq!(c.class_id, 1);
    assert!((c.score - sigmoid(2.0) * sigmoid(1.5)).abs() < 1e-7);
  }

  #[test]
  fn equal_class_logits_resolve_to_first() {
    let tensor = zeros(1, 1, 1, 4);
    let anchors = AnchorSet::new(vec![[1.0, 1.0]], 8.0);
    let c = GridDecoder::new(DecoderVariant::AnchorFree, 4)
      .decode(&tensor, &anchors)
      .unwrap()[0];
    assert_eq!(c.class_id, 0);
  }

  #[test]
  fn rejects_wrong_channel_count() {
    let tensor = zeros(1, 2, 2, 3);
    let anchors = AnchorSet::new(vec![[1.0, 1.0]], 8.0);
    let err = GridDecoder::new(DecoderVariant::Legacy, 2)
      .decode(&tensor, &anchors)
      .unwrap_err();
    assert_eq!(
      err,
      ConfigurationError::ChannelMismatch {
        expected: 7,
        found: 8
      }
    );
  }

  #[test]
  fn rejects_wrong_rank_and_anchor_count() {
    let anchors = AnchorSet::new(vec![[1.0, 1.0], [2.0, 2.0]], 8.0);
    let decoder = GridDecoder::new(DecoderVariant::Legacy, 1);

    let flat = ArrayD::<f32>::zeros(IxDyn(&[1, 2, 2, 6]));
    assert!(matches!(
      decoder.decode(&flat, &anchors),
      Err(ConfigurationError::TensorRank {
        expected: 5,
        found: 4
      })
    ));

    let one_anchor = zeros(1, 2, 2, 1);
    assert!(matches!(
      decoder.decode(&one_anchor, &anchors),
      Err(ConfigurationError::TensorAnchorMismatch {
        expected: 2,
        found: 1
      })
    ));
  }

  #[test]
  fn packed_layouts_match_canonical() {
    let (anchors_n, h, w, classes) = (2, 3, 2, 2);
    let channels = 5 + classes;
    let canonical = ArrayD::from_shape_fn(IxDyn(&[1, anchors_n, h, w, channels]), |idx| {
      (idx[1] * 1000 + idx[2] * 100 + idx[3] * 10 + idx[4]) as f32 * 0.01 - 3.0
    });

    // (1, H, W, A * C)
    let nhwc = ArrayD::from_shape_fn(IxDyn(&[1, h, w, anchors_n * channels]), |idx| {
      let (a, k) = (idx[3] / channels, idx[3] % channels);
      canonical[IxDyn(&[0, a, idx[1], idx[2], k])]
    });
    // (1, A * C, H, W)
    let nchw = ArrayD::from_shape_fn(IxDyn(&[1, anchors_n * channels, h, w]), |idx| {
      let (a, k) = (idx[1] / channels, idx[1] % channels);
      canonical[IxDyn(&[0, a, idx[2], idx[3], k])]
    });

    let anchors = AnchorSet::new(vec![[1.0, 2.0], [3.0, 4.0]], 8.0);
    let decoder = GridDecoder::new(DecoderVariant::AnchorFree, classes);
    let expected = decoder.decode(&canonical, &anchors).unwrap();
    let from_nhwc = decoder
      .with_layout(TensorLayout::PackedNhwc)
      .decode(&nhwc, &anchors)
      .unwrap();
    let from_nchw = decoder
      .with_layout(TensorLayout::PackedNchw)
      .decode(&nchw, &anchors)
      .unwrap();
    assert_eq!(expected, from_nhwc);
    assert_eq!(expected, from_nchw);
  }
}
