// 该文件是 Shanan （山南西风） 项目的一部分。
// src/bin/simple_oneshot.rs - 单张图像检测结果查看
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

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use url::Url;

use shanan_eval::{
  FromUrl,
  config::{DetectionConfig, VISUAL_SCORE_THRESHOLD},
  input::DumpDirInput,
  model::ReplayModelBuilder,
  output::DetectionRecorder,
  postprocess::PostProcessor,
  task::{OneShotTask, Task},
};

/// 单张图像检测参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 检测配置文件 (JSON)
  #[arg(long, value_name = "FILE")]
  pub config: Option<PathBuf>,
  /// 输入来源，例如 dump:///data/val/000001.json
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 置信度阈值
  #[arg(long, default_value_t = VISUAL_SCORE_THRESHOLD, value_name = "THRESHOLD")]
  pub score_threshold: f32,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("输入来源: {}", args.input);

  let config = match &args.config {
    Some(path) => DetectionConfig::from_json_file(path)
      .with_context(|| format!("无法加载检测配置 {}", path.display()))?,
    None => DetectionConfig::yolov5(),
  };
  let postprocessor = PostProcessor::new(config)?.with_score_threshold(args.score_threshold)?;
  let class_names = postprocessor.config().class_names.clone();

  let input = DumpDirInput::from_url(&args.input)?;
  let builder = ReplayModelBuilder;
  let mut recorder = DetectionRecorder::new(class_names.clone());

  let result = OneShotTask::new(postprocessor).run_task(input, builder, &mut recorder)?;

  println!("{}: 检测到 {} 个目标", result.image_id, result.boxes.len());
  for item in &result.boxes {
    let name = class_names
      .get(item.class_id)
      .map(String::as_str)
      .unwrap_or("unknown");
    println!(
      "  - {}: {:.2}% at ({:.0}, {:.0}, {:.0}x{:.0})",
      name,
      item.score * 100.0,
      item.bbox[0],
      item.bbox[1],
      item.width(),
      item.height()
    );
  }

  Ok(())
}
