// 该文件是 Shanan （山南西风） 项目的一部分。
// src/config.rs - 检测后处理配置
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

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// 单张可视化推理使用的分数阈值
pub const VISUAL_SCORE_THRESHOLD: f32 = 0.3;
/// 全数据集评测使用的分数阈值，需要足够宽松以便 NMS 与指标看到完整的分数分布
pub const EVAL_SCORE_THRESHOLD: f32 = 0.001;
pub const DEFAULT_IOU_THRESHOLD: f32 = 0.65;
pub const DEFAULT_SOFT_NMS_SIGMA: f32 = 0.3;

/// COCO 数据集类别名称
pub const COCO_CLASSES: [&str; 80] = [
  "person",
  "bicycle",
  "car",
  "motorcycle",
  "airplane",
  "bus",
  "train",
  "truck",
  "boat",
  "traffic light",
  "fire hydrant",
  "stop sign",
  "parking meter",
  "bench",
  "bird",
  "cat",
  "dog",
  "horse",
  "sheep",
  "cow",
  "elephant",
  "bear",
  "zebra",
  "giraffe",
  "backpack",
  "umbrella",
  "handbag",
  "tie",
  "suitcase",
  "frisbee",
  "skis",
  "snowboard",
  "sports ball",
  "kite",
  "baseball bat",
  "baseball glove",
  "skateboard",
  "surfboard",
  "tennis racket",
  "bottle",
  "wine glass",
  "cup",
  "fork",
  "knife",
  "spoon",
  "bowl",
  "banana",
  "apple",
  "sandwich",
  "orange",
  "broccoli",
  "carrot",
  "hot dog",
  "pizza",
  "donut",
  "cake",
  "chair",
  "couch",
  "potted plant",
  "bed",
  "dining table",
  "toilet",
  "tv",
  "laptop",
  "mouse",
  "remote",
  "keyboard",
  "cell phone",
  "microwave",
  "oven",
  "toaster",
  "sink",
  "refrigerator",
  "book",
  "clock",
  "vase",
  "scissors",
  "teddy bear",
  "hair drier",
  "toothbrush",
];

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
  #[error("配置中没有任何检测尺度")]
  NoScales,
  #[error("步长数量 {strides} 与锚框组数量 {anchor_sets} 不一致")]
  StrideCountMismatch { strides: usize, anchor_sets: usize },
  #[error("第 {scale} 个尺度的锚框为空")]
  EmptyAnchorSet { scale: usize },
  #[error("第 {scale} 个尺度的锚框数量为 {found}，其他尺度为 {expected}")]
  AnchorCountMismatch {
    scale: usize,
    expected: usize,
    found: usize,
  },
  #[error("第 {scale} 个尺度的步长无效: {stride}")]
  InvalidStride { scale: usize, stride: f32 },
  #[error("类别数量不能为 0")]
  NoClasses,
  #[error("类别名称数量 {found} 与类别数量 {expected} 不一致")]
  ClassNameCountMismatch { expected: usize, found: usize },
  #[error("输入尺寸无效: {height}x{width}")]
  InvalidInputShape { height: usize, width: usize },
  #[error("原始图像尺寸无效: {height}x{width}")]
  InvalidOriginalShape { height: usize, width: usize },
  #[error("参数 {name} 的取值无效: {value}")]
  InvalidParameter { name: &'static str, value: f32 },
  #[error("工作线程数量不能为 0")]
  NoWorkers,
  #[error("输出张量维度为 {found}，期望 {expected}")]
  TensorRank { expected: usize, found: usize },
  #[error("输出张量批大小为 {found}，仅支持 1")]
  BatchSize { found: usize },
  #[error("输出张量锚框维度为 {found}，配置为 {expected}")]
  TensorAnchorMismatch { expected: usize, found: usize },
  #[error("输出张量通道数为 {found}，期望 5 + 类别数 = {expected}")]
  ChannelMismatch { expected: usize, found: usize },
  #[error("模型输出数量为 {found}，配置的尺度数量为 {expected}")]
  OutputCountMismatch { expected: usize, found: usize },
  #[error("配置文件读取失败: {0}")]
  Io(String),
  #[error("配置文件解析失败: {0}")]
  Parse(String),
}

impl From<std::io::Error> for ConfigurationError {
  fn from(err: std::io::Error) -> Self {
    ConfigurationError::Io(err.to_string())
  }
}

impl From<serde_json::Error> for ConfigurationError {
  fn from(err: serde_json::Error) -> Self {
    ConfigurationError::Parse(err.to_string())
  }
}

/// 网格解码公式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecoderVariant {
  /// `(σ(d) + idx) * stride`，尺寸为 `exp(d) * anchor * stride`
  Legacy,
  /// `(σ(d) * 2 - 0.5 + idx) * stride`，尺寸为 `(σ(d) * 2)² * anchor`
  AnchorFree,
}

/// 推理引擎输出张量的排布方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TensorLayout {
  /// `(1, A, H, W, 5 + C)`
  #[default]
  Canonical,
  /// `(1, H, W, A * (5 + C))`
  PackedNhwc,
  /// `(1, A * (5 + C), H, W)`
  PackedNchw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum NmsMethod {
  #[default]
  #[serde(rename = "nms")]
  Nms,
  #[serde(rename = "soft-nms")]
  SoftNms,
}

/// 单个检测尺度的锚框与步长
#[derive(Debug, Clone, PartialEq)]
pub struct AnchorSet {
  /// (宽, 高)
  pub anchors: Vec<[f32; 2]>,
  pub stride: f32,
}

impl AnchorSet {
  pub fn new(anchors: Vec<[f32; 2]>, stride: f32) -> Self {
    Self { anchors, stride }
  }

  pub fn len(&self) -> usize {
    self.anchors.len()
  }

  pub fn is_empty(&self) -> bool {
    self.anchors.is_empty()
  }
}

/// 检测后处理配置，加载一次后在评测期间保持不变
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
  pub strides: Vec<f32>,
  pub anchors_table: Vec<Vec<[f32; 2]>>,
  pub num_classes: usize,
  /// 可以为空；非空时数量必须等于 `num_classes`
  pub class_names: Vec<String>,
  /// [高, 宽]
  pub input_shape: [usize; 2],
  pub variant: DecoderVariant,
  pub layout: TensorLayout,
  pub score_threshold: f32,
  pub iou_threshold: f32,
  pub nms_method: NmsMethod,
  pub soft_nms_sigma: f32,
  /// NMS 之后最多保留的检测框数量
  pub max_detections: Option<usize>,
  /// 有效框尺度 `sqrt(面积)` 的下界（含）
  pub min_box_scale: f32,
  /// 有效框尺度的上界（不含），缺省表示无上界
  pub max_box_scale: Option<f32>,
}

impl Default for DetectionConfig {
  fn default() -> Self {
    Self::yolov5()
  }
}

impl DetectionConfig {
  /// YOLOv5 默认配置，锚框以像素为单位
  pub fn yolov5() -> Self {
    Self {
      strides: vec![8.0, 16.0, 32.0],
      anchors_table: vec![
        vec![[10.0, 13.0], [16.0, 30.0], [33.0, 23.0]],
        vec![[30.0, 61.0], [62.0, 45.0], [59.0, 119.0]],
        vec![[116.0, 90.0], [156.0, 198.0], [373.0, 326.0]],
      ],
      num_classes: COCO_CLASSES.len(),
      class_names: COCO_CLASSES.iter().map(|s| s.to_string()).collect(),
      input_shape: [672, 672],
      variant: DecoderVariant::AnchorFree,
      layout: TensorLayout::Canonical,
      score_threshold: EVAL_SCORE_THRESHOLD,
      iou_threshold: DEFAULT_IOU_THRESHOLD,
      nms_method: NmsMethod::Nms,
      soft_nms_sigma: DEFAULT_SOFT_NMS_SIGMA,
      max_detections: None,
      min_box_scale: 0.0,
      max_box_scale: None,
    }
  }

  /// YOLOv3 默认配置，锚框以网格为单位（解码时乘以步长）
  pub fn yolov3() -> Self {
    Self {
      anchors_table: vec![
        vec![[1.25, 1.625], [2.0, 3.75], [4.125, 2.875]],
        vec![[1.875, 3.8125], [3.875, 2.8125], [3.6875, 7.4375]],
        vec![[3.625, 2.8125], [4.875, 6.1875], [11.65625, 10.1875]],
      ],
      input_shape: [416, 416],
      variant: DecoderVariant::Legacy,
      layout: TensorLayout::PackedNchw,
      ..Self::yolov5()
    }
  }

  pub fn from_json_str(s: &str) -> Result<Self, ConfigurationError> {
    let config: DetectionConfig = serde_json::from_str(s)?;
    config.validate()?;
    Ok(config)
  }

  pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigurationError> {
    let path = path.as_ref();
    info!("加载检测配置: {}", path.display());
    let content = std::fs::read_to_string(path)?;
    Self::from_json_str(&content)
  }

  pub fn num_anchors(&self) -> usize {
    self.anchors_table.first().map(Vec::len).unwrap_or(0)
  }

  pub fn input_height(&self) -> usize {
    self.input_shape[0]
  }

  pub fn input_width(&self) -> usize {
    self.input_shape[1]
  }

  pub fn class_name(&self, class_id: usize) -> Option<&str> {
    self.class_names.get(class_id).map(String::as_str)
  }

  /// 按尺度组合锚框与步长
  pub fn anchor_sets(&self) -> Result<Vec<AnchorSet>, ConfigurationError> {
    self.validate()?;
    Ok(
      self
        .anchors_table
        .iter()
        .zip(&self.strides)
        .map(|(anchors, &stride)| AnchorSet::new(anchors.clone(), stride))
        .collect(),
    )
  }

  pub fn validate(&self) -> Result<(), ConfigurationError> {
    if self.anchors_table.is_empty() {
      return Err(ConfigurationError::NoScales);
    }
    if self.strides.len() != self.anchors_table.len() {
      return Err(ConfigurationError::StrideCountMismatch {
        strides: self.strides.len(),
        anchor_sets: self.anchors_table.len(),
      });
    }

    let expected = self.num_anchors();
    for (scale, (anchors, &stride)) in self.anchors_table.iter().zip(&self.strides).enumerate() {
      if anchors.is_empty() {
        return Err(ConfigurationError::EmptyAnchorSet { scale });
      }
      if anchors.len() != expected {
        return Err(ConfigurationError::AnchorCountMismatch {
          scale,
          expected,
          found: anchors.len(),
        });
      }
      if !(stride.is_finite() && stride > 0.0) {
        return Err(ConfigurationError::InvalidStride { scale, stride });
      }
    }

    if self.num_classes == 0 {
      return Err(ConfigurationError::NoClasses);
    }
    if !self.class_names.is_empty() && self.class_names.len() != self.num_classes {
      return Err(ConfigurationError::ClassNameCountMismatch {
        expected: self.num_classes,
        found: self.class_names.len(),
      });
    }

    let [height, width] = self.input_shape;
    if height == 0 || width == 0 {
      return Err(ConfigurationError::InvalidInputShape { height, width });
    }

    if !(0.0..=1.0).contains(&self.score_threshold) {
      return Err(ConfigurationError::InvalidParameter {
        name: "score_threshold",
        value: self.score_threshold,
      });
    }
    if !(0.0..=1.0).contains(&self.iou_threshold) {
      return Err(ConfigurationError::InvalidParameter {
        name: "iou_threshold",
        value: self.iou_threshold,
      });
    }
    if !(self.soft_nms_sigma.is_finite() && self.soft_nms_sigma > 0.0) {
      return Err(ConfigurationError::InvalidParameter {
        name: "soft_nms_sigma",
        value: self.soft_nms_sigma,
      });
    }
    if !(self.min_box_scale >= 0.0) {
      return Err(ConfigurationError::InvalidParameter {
        name: "min_box_scale",
        value: self.min_box_scale,
      });
    }
    if let Some(max) = self.max_box_scale
      && !(max > self.min_box_scale)
    {
      return Err(ConfigurationError::InvalidParameter {
        name: "max_box_scale",
        value: max,
      });
    }

    debug!(
      "配置校验通过: {} 个尺度, 每尺度 {} 个锚框, {} 个类别",
      self.anchors_table.len(),
      expected,
      self.num_classes
    );
    Ok(())
  }
}
