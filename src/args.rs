// 该文件是 Shanan （山南西风） 项目的一部分。
// src/args.rs - 评测程序参数配置
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

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use url::Url;

use shanan_eval::config::NmsMethod;

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum NmsMethodArg {
  Nms,
  SoftNms,
}

impl From<NmsMethodArg> for NmsMethod {
  fn from(arg: NmsMethodArg) -> Self {
    match arg {
      NmsMethodArg::Nms => NmsMethod::Nms,
      NmsMethodArg::SoftNms => NmsMethod::SoftNms,
    }
  }
}

/// Shanan 检测评测参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 检测配置文件 (JSON)，缺省使用 YOLOv5 COCO 配置
  #[arg(long, value_name = "FILE")]
  pub config: Option<PathBuf>,

  /// 数据集来源，例如 dump:///data/val
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,

  /// 评测报告路径，每行一个 `名称 值`
  #[arg(long, value_name = "FILE")]
  pub output: PathBuf,

  /// COCO 格式检测结果输出路径
  #[arg(long, value_name = "FILE")]
  pub detections: Option<PathBuf>,

  /// 工作线程数量，缺省为 CPU 核数减 2（至少 2）
  #[arg(short = 'n', long, env = "PARALLEL_PROCESS_NUM", value_name = "COUNT")]
  pub workers: Option<usize>,

  /// 需要收集的结果数量，缺省为数据集大小
  #[arg(long, value_name = "COUNT")]
  pub num_valid: Option<usize>,

  /// 置信度阈值 (0.0 - 1.0)，缺省使用配置文件中的值
  #[arg(long, value_name = "THRESHOLD")]
  pub score_threshold: Option<f32>,

  /// NMS IOU 阈值 (0.0 - 1.0)
  #[arg(long, value_name = "THRESHOLD")]
  pub iou_threshold: Option<f32>,

  /// 抑制方式
  #[arg(long, value_enum)]
  pub nms_method: Option<NmsMethodArg>,

  /// 单线程顺序评测，用于调试
  #[arg(long)]
  pub sequential: bool,
}
