// 该文件是 Shanan （山南西风） 项目的一部分。
// src/main.rs - 检测评测主程序
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

mod args;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use shanan_eval::{
  FromUrl,
  config::DetectionConfig,
  input::DumpDirInput,
  model::ReplayModelBuilder,
  output::{DetectionRecorder, MetricAccumulator, write_report},
  postprocess::PostProcessor,
  task::{EvaluationHarness, SequentialTask, Task, default_workers},
};

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let args = args::Args::parse();

  info!("输入来源: {}", args.input);
  info!("报告路径: {}", args.output.display());

  let mut config = match &args.config {
    Some(path) => DetectionConfig::from_json_file(path)
      .with_context(|| format!("无法加载检测配置 {}", path.display()))?,
    None => DetectionConfig::yolov5(),
  };
  if let Some(threshold) = args.score_threshold {
    config.score_threshold = threshold;
  }
  if let Some(threshold) = args.iou_threshold {
    config.iou_threshold = threshold;
  }
  if let Some(method) = args.nms_method {
    config.nms_method = method.into();
  }
  info!(
    "置信度阈值: {}, NMS 阈值: {}, 抑制方式: {:?}",
    config.score_threshold, config.iou_threshold, config.nms_method
  );

  let postprocessor = PostProcessor::new(config).context("检测配置无效")?;
  let dataset = DumpDirInput::from_url(&args.input).context("无法打开数据集")?;
  let num_valid = args.num_valid.unwrap_or(dataset.len());
  let builder = ReplayModelBuilder;
  let mut recorder = DetectionRecorder::new(postprocessor.config().class_names.clone());

  let (interrupt_tx, interrupt_rx) = crossbeam_channel::bounded(1);
  ctrlc::set_handler(move || {
    info!("收到中断信号，准备退出...");
    let _ = interrupt_tx.try_send(());
  })
  .context("无法设置 Ctrl-C 处理函数")?;

  let report = if args.sequential {
    SequentialTask::new(postprocessor)
      .with_num_valid(Some(num_valid))
      .with_interrupt(interrupt_rx)
      .run_task(dataset, builder, &mut recorder)?
  } else {
    let workers = args.workers.unwrap_or_else(default_workers);
    EvaluationHarness::new(postprocessor, workers, num_valid)?
      .with_interrupt(interrupt_rx)
      .run_task(dataset, builder, &mut recorder)?
  };

  let (mut names, mut values) = recorder.get();
  names.push("missing".to_string());
  values.push(report.missing.to_string());
  write_report(&args.output, &names, &values)?;

  if let Some(path) = &args.detections {
    recorder.write_json(path)?;
  }

  info!(
    "评测完成: {} 张图像，{} 个失败，耗时 {:.2?}",
    report.received, report.missing, report.elapsed
  );
  Ok(())
}
