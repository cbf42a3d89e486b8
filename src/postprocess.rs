// 该文件是 Shanan （山南西风） 项目的一部分。
// src/postprocess.rs - 检测后处理流水线
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

mod decode;
mod filter;
mod nms;
mod remap;

pub use self::decode::{GridDecoder, canonicalize, sigmoid};
pub use self::filter::ScoreFilter;
pub use self::nms::{nms, top_k};
pub use self::remap::{CoordinateRemapper, Letterbox};

use tracing::debug;

use crate::{
  config::{AnchorSet, ConfigurationError, DetectionConfig},
  model::{DetectItem, RawTensor},
};

/// 把一张图像的全部尺度输出处理为最终检测框：
/// 解码 -> 坐标还原 -> 分数过滤 -> 按类别 NMS
#[derive(Debug, Clone)]
pub struct PostProcessor {
  config: DetectionConfig,
  anchor_sets: Vec<AnchorSet>,
  decoder: GridDecoder,
  remapper: CoordinateRemapper,
  filter: ScoreFilter,
}

impl PostProcessor {
  pub fn new(config: DetectionConfig) -> Result<Self, ConfigurationError> {
    let anchor_sets = config.anchor_sets()?;
    let decoder = GridDecoder::new(config.variant, config.num_classes).with_layout(config.layout);
    let remapper = CoordinateRemapper::with_valid_scale(config.min_box_scale, config.max_box_scale);
    let filter = ScoreFilter::new(config.score_threshold);
    Ok(Self {
      config,
      anchor_sets,
      decoder,
      remapper,
      filter,
    })
  }

  pub fn with_score_threshold(mut self, threshold: f32) -> Result<Self, ConfigurationError> {
    if !(0.0..=1.0).contains(&threshold) {
      return Err(ConfigurationError::InvalidParameter {
        name: "score_threshold",
        value: threshold,
      });
    }
    self.config.score_threshold = threshold;
    self.filter = ScoreFilter::new(threshold);
    Ok(self)
  }

  pub fn config(&self) -> &DetectionConfig {
    &self.config
  }

  pub fn anchor_sets(&self) -> &[AnchorSet] {
    &self.anchor_sets
  }

  /// `original_shape` 为 (高, 宽)，必须是缩放填充之前的尺寸
  pub fn process(
    &self,
    outputs: &[RawTensor],
    original_shape: (usize, usize),
  ) -> Result<Vec<DetectItem>, ConfigurationError> {
    if outputs.len() != self.anchor_sets.len() {
      return Err(ConfigurationError::OutputCountMismatch {
        expected: self.anchor_sets.len(),
        found: outputs.len(),
      });
    }

    let mut candidates = Vec::new();
    for (tensor, anchor_set) in outputs.iter().zip(&self.anchor_sets) {
      candidates.extend(self.decoder.decode(tensor, anchor_set)?);
    }

    let input_shape = (self.config.input_height(), self.config.input_width());
    let remapped = self
      .remapper
      .remap(&candidates, original_shape, input_shape)?;
    let scored = self.filter.apply(remapped);
    let scored_count = scored.len();

    let mut kept = nms(
      &scored,
      self.config.iou_threshold,
      self.config.nms_method,
      self.config.soft_nms_sigma,
    );
    if let Some(k) = self.config.max_detections {
      kept = top_k(kept, k);
    }

    debug!(
      "后处理: 候选 {} / 过滤后 {} / 最终 {}",
      candidates.len(),
      scored_count,
      kept.len()
    );
    Ok(kept)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::{DecoderVariant, NmsMethod};
  use ndarray::{ArrayD, IxDyn};

  fn single_scale_config() -> DetectionConfig {
    DetectionConfig {
      strides: vec![8.0],
      anchors_table: vec![vec![[10.0, 10.0]]],
      num_classes: 1,
      class_names: vec!["object".to_string()],
      input_shape: [16, 16],
      variant: DecoderVariant::AnchorFree,
      score_threshold: 0.5,
      ..DetectionConfig::yolov5()
    }
  }

  #[test]
  fn single_confident_cell_survives() {
    // 2x2 网格，(0, 0) 处目标度 +10，其余 -10
    let mut tensor = ArrayD::<f32>::zeros(IxDyn(&[1, 1, 2, 2, 6]));
    for row in 0..2 {
      for col in 0..2 {
        let obj = if (row, col) == (0, 0) { 10.0 } else { -10.0 };
        tensor[IxDyn(&[0, 0, row, col, 4])] = obj;
        tensor[IxDyn(&[0, 0, row, col, 5])] = 10.0;
      }
    }
    let processor = PostProcessor::new(single_scale_config()).unwrap();

    let decoded = GridDecoder::new(DecoderVariant::AnchorFree, 1)
      .decode(&tensor, &processor.anchor_sets()[0])
      .unwrap();
    let confident: Vec<_> = decoded.iter().filter(|c| c.score > 0.5).collect();
    assert_eq!(confident.len(), 1);
    assert!((confident[0].cx - 4.0).abs() < 1e-4);
    assert!((confident[0].cy - 4.0).abs() < 1e-4);

    // 原图与输入同尺寸，还原只做裁剪
    let boxes = processor.process(&[tensor], (16, 16)).unwrap();
    assert_eq!(boxes.len(), 1);
    let b = boxes[0];
    let cx = (b.bbox[0] + b.bbox[2]) / 2.0;
    let cy = (b.bbox[1] + b.bbox[3]) / 2.0;
    // 左上角被裁剪到 0，中心略有偏移
    assert!(cx > 3.0 && cx < 6.0, "cx = {cx}");
    assert!(cy > 3.0 && cy < 6.0, "cy = {cy}");
    assert!(b.score > 0.99);
  }

  #[test]
  fn output_count_must_match_scales() {
    let processor = PostProcessor::new(DetectionConfig::yolov5()).unwrap();
    assert!(matches!(
      processor.process(&[], (480, 640)),
      Err(ConfigurationError::OutputCountMismatch {
        expected: 3,
        found: 0
      })
    ));
  }

  #[test]
  fn max_detections_caps_output() {
    let mut config = single_scale_config();
    config.score_threshold = 0.1;
    config.nms_method = NmsMethod::Nms;
    config.max_detections = Some(2);
    config.input_shape = [64, 64];
    config.anchors_table = vec![vec![[2.0, 2.0]]];
    // 4x4 网格上互不重叠的框全部高分
    let mut tensor = ArrayD::<f32>::zeros(IxDyn(&[1, 1, 4, 4, 6]));
    for row in 0..4 {
      for col in 0..4 {
        tensor[IxDyn(&[0, 0, row, col, 4])] = 5.0 + (row * 4 + col) as f32 * 0.1;
        tensor[IxDyn(&[0, 0, row, col, 5])] = 5.0;
      }
    }
    let processor = PostProcessor::new(config).unwrap();
    let boxes = processor.process(&[tensor], (64, 64)).unwrap();
    assert_eq!(boxes.len(), 2);
    assert!(boxes[0].score >= boxes[1].score);
  }

  #[test]
  fn score_threshold_can_be_overridden() {
    let processor = PostProcessor::new(DetectionConfig::yolov5())
      .unwrap()
      .with_score_threshold(0.3)
      .unwrap();
    assert_eq!(processor.config().score_threshold, 0.3);
    assert!(
      PostProcessor::new(DetectionConfig::yolov5())
        .unwrap()
        .with_score_threshold(1.5)
        .is_err()
    );
  }
}
