// 该文件是 Shanan （山南西风） 项目的一部分。
// src/task.rs - 评测任务
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

use std::{
  fmt,
  sync::{Arc, Mutex, MutexGuard},
  time::{Duration, Instant},
};

use anyhow::Context;
use crossbeam_channel::Receiver;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::{
  config::ConfigurationError,
  input::DatasetItem,
  model::{DetectItem, Model, ModelBuilder},
  output::MetricAccumulator,
  postprocess::PostProcessor,
};

mod harness;
pub use self::harness::{EvaluationHarness, default_workers};

pub trait Task<I, M, O>: Sized {
  type Output;
  type Error;
  fn run_task(self, input: I, model: M, output: O) -> Result<Self::Output, Self::Error>;
}

#[derive(Error, Debug)]
pub enum EvalError {
  #[error("配置错误: {0}")]
  Configuration(#[from] ConfigurationError),
  #[error("{worker} 启动失败: {message}")]
  StartupFailure { worker: String, message: String },
  #[error("{worker} 处理 {image_id} 失败: {message}")]
  Worker {
    worker: String,
    image_id: String,
    message: String,
  },
  #[error("数据集已耗尽: 期望 {expected} 个结果，只收到 {received} 个")]
  Exhausted { expected: usize, received: usize },
  #[error("收到中断信号，已收到 {received} 个结果")]
  Interrupted { received: usize },
  #[error("评测任务已经启动过")]
  AlreadyStarted,
  #[error("无法创建线程: {0}")]
  Spawn(#[from] std::io::Error),
}

/// 一张图像的最终检测结果
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationResult {
  pub image_id: String,
  pub boxes: Vec<DetectItem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvalReport {
  /// 计入 `num_valid` 的结果数量，包括失败项
  pub received: usize,
  /// 处理失败、未进入指标的数量
  pub missing: usize,
  pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HarnessState {
  #[default]
  Idle,
  Running,
  Draining,
  Terminated,
}

/// 可跨线程查询的任务状态
#[derive(Debug, Clone, Default)]
pub struct HarnessStatus(Arc<Mutex<HarnessState>>);

impl HarnessStatus {
  pub fn get(&self) -> HarnessState {
    *self.lock()
  }

  fn set(&self, state: HarnessState) {
    *self.lock() = state;
  }

  /// 仅 Idle 状态可以启动
  fn start(&self) -> bool {
    let mut state = self.lock();
    if *state != HarnessState::Idle {
      return false;
    }
    *state = HarnessState::Running;
    true
  }

  fn lock(&self) -> MutexGuard<'_, HarnessState> {
    self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
  Startup,
  Infer,
  PostProcess,
}

impl fmt::Display for FailureStage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let stage = match self {
      FailureStage::Startup => "启动",
      FailureStage::Infer => "推理",
      FailureStage::PostProcess => "后处理",
    };
    f.write_str(stage)
  }
}

#[derive(Debug)]
pub struct WorkerFailure {
  pub worker: String,
  pub image_id: Option<String>,
  pub stage: FailureStage,
  pub error: anyhow::Error,
}

impl WorkerFailure {
  /// 启动失败与配置错误会让整个评测终止
  pub fn is_fatal(&self) -> bool {
    self.stage == FailureStage::Startup || self.error.downcast_ref::<ConfigurationError>().is_some()
  }

  fn log(&self) {
    error!(
      "{} {}失败 (图像 {}): {:#}",
      self.worker,
      self.stage,
      self.image_id.as_deref().unwrap_or("-"),
      self.error
    );
  }

  fn into_eval_error(self) -> EvalError {
    if self.stage == FailureStage::Startup {
      return EvalError::StartupFailure {
        worker: self.worker,
        message: format!("{:#}", self.error),
      };
    }
    match self.error.downcast::<ConfigurationError>() {
      Ok(e) => EvalError::Configuration(e),
      Err(error) => EvalError::Worker {
        worker: self.worker,
        image_id: self.image_id.unwrap_or_default(),
        message: format!("{:#}", error),
      },
    }
  }
}

fn build_model<B>(builder: &B, worker: &str) -> Result<B::Model, WorkerFailure>
where
  B: ModelBuilder,
  B::Error: std::error::Error + Send + Sync + 'static,
{
  builder.build().map_err(|e| WorkerFailure {
    worker: worker.to_string(),
    image_id: None,
    stage: FailureStage::Startup,
    error: anyhow::Error::new(e).context("模型构建失败"),
  })
}

fn evaluate_item<M>(
  model: &M,
  postprocessor: &PostProcessor,
  item: &DatasetItem<M::Input>,
  worker: &str,
) -> Result<EvaluationResult, WorkerFailure>
where
  M: Model,
  M::Error: std::error::Error + Send + Sync + 'static,
{
  let failure = |stage, error| WorkerFailure {
    worker: worker.to_string(),
    image_id: Some(item.image_id.clone()),
    stage,
    error,
  };

  let outputs = model
    .infer(&item.image)
    .context("推理引擎返回错误")
    .map_err(|e| failure(FailureStage::Infer, e))?;
  let boxes = postprocessor
    .process(&outputs, item.original_shape)
    .context("输出张量无法解码")
    .map_err(|e| failure(FailureStage::PostProcess, e))?;

  Ok(EvaluationResult {
    image_id: item.image_id.clone(),
    boxes,
  })
}

fn log_progress(received: usize, num_valid: usize) {
  if received % 10 == 0 {
    info!("进度: {} / {}", received, num_valid);
  }
}

/// 单线程逐项评测，失败处理与并行评测一致
pub struct SequentialTask {
  postprocessor: PostProcessor,
  num_valid: Option<usize>,
  interrupt: Option<Receiver<()>>,
}

impl SequentialTask {
  pub fn new(postprocessor: PostProcessor) -> Self {
    Self {
      postprocessor,
      num_valid: None,
      interrupt: None,
    }
  }

  /// 缺省时处理整个数据集
  pub fn with_num_valid(mut self, num_valid: Option<usize>) -> Self {
    self.num_valid = num_valid;
    self
  }

  pub fn with_interrupt(mut self, interrupt: Receiver<()>) -> Self {
    self.interrupt = Some(interrupt);
    self
  }
}

impl<F, I, B, O> Task<I, B, O> for SequentialTask
where
  I: IntoIterator<Item = DatasetItem<F>>,
  B: ModelBuilder,
  B::Error: std::error::Error + Send + Sync + 'static,
  B::Model: Model<Input = F>,
  <B::Model as Model>::Error: std::error::Error + Send + Sync + 'static,
  O: MetricAccumulator,
{
  type Output = EvalReport;
  type Error = EvalError;

  fn run_task(self, input: I, builder: B, mut output: O) -> Result<Self::Output, Self::Error> {
    const WORKER: &str = "main";

    info!("开始顺序评测...");
    let start = Instant::now();
    let model = build_model(&builder, WORKER).map_err(|failure| {
      failure.log();
      failure.into_eval_error()
    })?;

    let target = self.num_valid.unwrap_or(usize::MAX);
    let mut received = 0;
    let mut missing = 0;
    for item in input {
      if received >= target {
        break;
      }
      if let Some(rx) = &self.interrupt
        && rx.try_recv().is_ok()
      {
        warn!("收到中断信号，停止评测");
        return Err(EvalError::Interrupted { received });
      }

      match evaluate_item(&model, &self.postprocessor, &item, WORKER) {
        Ok(result) => output.update(&result.boxes, &result.image_id),
        Err(failure) => {
          failure.log();
          if received == 0 || failure.is_fatal() {
            return Err(failure.into_eval_error());
          }
          missing += 1;
        }
      }
      received += 1;
      log_progress(received, target);
    }

    if let Some(expected) = self.num_valid
      && received < expected
    {
      return Err(EvalError::Exhausted { expected, received });
    }

    let elapsed = start.elapsed();
    info!(
      "顺序评测完成: {} 个结果，{} 个失败，耗时 {:.2?}",
      received, missing, elapsed
    );
    Ok(EvalReport {
      received,
      missing,
      elapsed,
    })
  }
}

/// 只处理数据集中的第一项并返回其检测结果
pub struct OneShotTask {
  postprocessor: PostProcessor,
}

impl OneShotTask {
  pub fn new(postprocessor: PostProcessor) -> Self {
    Self { postprocessor }
  }
}

impl<F, I, B, O> Task<I, B, O> for OneShotTask
where
  I: IntoIterator<Item = DatasetItem<F>>,
  B: ModelBuilder,
  B::Error: std::error::Error + Send + Sync + 'static,
  B::Model: Model<Input = F>,
  <B::Model as Model>::Error: std::error::Error + Send + Sync + 'static,
  O: MetricAccumulator,
{
  type Output = EvaluationResult;
  type Error = EvalError;

  fn run_task(self, input: I, builder: B, mut output: O) -> Result<Self::Output, Self::Error> {
    const WORKER: &str = "main";

    info!("开始任务...");
    let item = input
      .into_iter()
      .next()
      .ok_or(EvalError::Exhausted {
        expected: 1,
        received: 0,
      })?;
    let model = build_model(&builder, WORKER).map_err(WorkerFailure::into_eval_error)?;

    info!("输入获取成功，开始推理...");
    let now = Instant::now();
    let result = evaluate_item(&model, &self.postprocessor, &item, WORKER).map_err(|failure| {
      failure.log();
      failure.into_eval_error()
    })?;
    info!(
      "推理完成，检测到 {} 个目标，耗时: {:.2?}",
      result.boxes.len(),
      now.elapsed()
    );

    output.update(&result.boxes, &result.image_id);
    Ok(result)
  }
}
