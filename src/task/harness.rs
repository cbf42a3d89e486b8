// 该文件是 Shanan （山南西风） 项目的一部分。
// src/task/harness.rs - 并行评测
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
  sync::Arc,
  thread::{self, JoinHandle},
  time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender, bounded, never, select};
use tracing::{debug, error, info, warn};

use crate::{
  config::ConfigurationError,
  input::DatasetItem,
  model::{Model, ModelBuilder},
  output::MetricAccumulator,
  postprocess::PostProcessor,
  task::{
    EvalError, EvalReport, EvaluationResult, HarnessState, HarnessStatus, Task, WorkerFailure,
    build_model, evaluate_item, log_progress,
  },
};

const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// 缺省工作线程数：CPU 核数减 2，至少为 2
pub fn default_workers() -> usize {
  num_cpus::get().saturating_sub(2).max(2)
}

enum Job<F> {
  Item(DatasetItem<F>),
  Stop,
}

enum WorkerMessage {
  Done(EvaluationResult),
  Failed(WorkerFailure),
}

/// 生产者 -> 有界任务队列 -> N 个工作线程 -> 有界结果队列 -> 聚合
///
/// 聚合线程（调用者所在线程）按到达顺序消费恰好 `num_valid` 个结果后
/// 强制关闭生产者与工作线程，因此数据集可以是无限的。
/// 两个队列的容量都等于工作线程数，内存占用与数据集大小无关。
#[derive(Debug, Clone)]
pub struct EvaluationHarness {
  postprocessor: Arc<PostProcessor>,
  workers: usize,
  num_valid: usize,
  shutdown_grace: Duration,
  interrupt: Option<Receiver<()>>,
  status: HarnessStatus,
}

impl EvaluationHarness {
  pub fn new(
    postprocessor: PostProcessor,
    workers: usize,
    num_valid: usize,
  ) -> Result<Self, ConfigurationError> {
    if workers == 0 {
      return Err(ConfigurationError::NoWorkers);
    }
    Ok(Self {
      postprocessor: Arc::new(postprocessor),
      workers,
      num_valid,
      shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
      interrupt: None,
      status: HarnessStatus::default(),
    })
  }

  /// 关闭时等待线程退出的最长时间，超时的线程被放弃
  pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
    self.shutdown_grace = grace;
    self
  }

  /// 收到消息后提前结束评测
  pub fn with_interrupt(mut self, interrupt: Receiver<()>) -> Self {
    self.interrupt = Some(interrupt);
    self
  }

  pub fn status(&self) -> HarnessStatus {
    self.status.clone()
  }

  pub fn workers(&self) -> usize {
    self.workers
  }

  pub fn num_valid(&self) -> usize {
    self.num_valid
  }

  fn aggregate<O: MetricAccumulator>(
    &self,
    results: &Receiver<WorkerMessage>,
    output: &mut O,
  ) -> Result<(usize, usize), EvalError> {
    let no_interrupt = never::<()>();
    let mut interrupt_open = self.interrupt.is_some();
    let mut received = 0;
    let mut missing = 0;

    while received < self.num_valid {
      let interrupt = match &self.interrupt {
        Some(rx) if interrupt_open => rx,
        _ => &no_interrupt,
      };

      let event = select! {
        recv(results) -> message => Ok(message),
        recv(interrupt) -> signal => Err(signal.is_ok()),
      };
      let message = match event {
        Ok(Ok(message)) => message,
        Ok(Err(_)) => {
          error!(
            "所有工作线程均已退出，只收到 {} / {} 个结果",
            received, self.num_valid
          );
          return Err(EvalError::Exhausted {
            expected: self.num_valid,
            received,
          });
        }
        Err(true) => {
          warn!("收到中断信号，停止评测");
          return Err(EvalError::Interrupted { received });
        }
        Err(false) => {
          // 中断发送端已关闭，之后不再监听
          interrupt_open = false;
          continue;
        }
      };

      match message {
        WorkerMessage::Done(result) => {
          debug!("{}: {} 个检测框", result.image_id, result.boxes.len());
          output.update(&result.boxes, &result.image_id);
        }
        WorkerMessage::Failed(failure) => {
          failure.log();
          if received == 0 || failure.is_fatal() {
            return Err(failure.into_eval_error());
          }
          missing += 1;
        }
      }
      received += 1;
      log_progress(received, self.num_valid);
    }

    Ok((received, missing))
  }

  fn join_all(&self, handles: Vec<JoinHandle<()>>) {
    let deadline = Instant::now() + self.shutdown_grace;
    let mut pending = handles;

    loop {
      let (finished, running): (Vec<_>, Vec<_>) =
        pending.into_iter().partition(|h| h.is_finished());
      for handle in finished {
        let name = thread_name(&handle);
        if handle.join().is_err() {
          warn!("线程 {} 异常退出", name);
        }
      }
      pending = running;

      if pending.is_empty() {
        break;
      }
      if Instant::now() >= deadline {
        for handle in &pending {
          warn!(
            "线程 {} 未在 {:.2?} 内退出，放弃等待",
            thread_name(handle),
            self.shutdown_grace
          );
        }
        break;
      }
      thread::sleep(JOIN_POLL_INTERVAL);
    }
  }
}

fn thread_name(handle: &JoinHandle<()>) -> String {
  handle.thread().name().unwrap_or("unnamed").to_string()
}

impl<F, I, B, O> Task<I, B, O> for EvaluationHarness
where
  F: Send + 'static,
  I: IntoIterator<Item = DatasetItem<F>>,
  I::IntoIter: Send + 'static,
  B: ModelBuilder + Send + Sync + 'static,
  B::Error: std::error::Error + Send + Sync + 'static,
  B::Model: Model<Input = F>,
  <B::Model as Model>::Error: std::error::Error + Send + Sync + 'static,
  O: MetricAccumulator,
{
  type Output = EvalReport;
  type Error = EvalError;

  fn run_task(self, input: I, builder: B, mut output: O) -> Result<Self::Output, Self::Error> {
    if !self.status.start() {
      return Err(EvalError::AlreadyStarted);
    }
    info!(
      "开始并行评测: {} 个工作线程，目标 {} 个结果",
      self.workers, self.num_valid
    );
    let start = Instant::now();

    let (job_tx, job_rx) = bounded::<Job<F>>(self.workers);
    let (result_tx, result_rx) = bounded::<WorkerMessage>(self.workers);
    // 发送端被丢弃时所有监听者立即返回
    let (shutdown_tx, shutdown_rx) = bounded::<()>(0);

    let builder = Arc::new(builder);
    let mut handles = Vec::with_capacity(self.workers + 1);
    let mut spawn_error = None;

    for i in 0..self.workers {
      let worker = Worker {
        name: format!("worker_{}", i),
        builder: Arc::clone(&builder),
        postprocessor: Arc::clone(&self.postprocessor),
        jobs: job_rx.clone(),
        results: result_tx.clone(),
        shutdown: shutdown_rx.clone(),
      };
      match thread::Builder::new()
        .name(worker.name.clone())
        .spawn(move || worker.run())
      {
        Ok(handle) => handles.push(handle),
        Err(e) => {
          spawn_error = Some(e);
          break;
        }
      }
    }
    drop(job_rx);
    drop(result_tx);

    if spawn_error.is_none() {
      let producer = Producer {
        items: input.into_iter(),
        jobs: job_tx,
        shutdown: shutdown_rx.clone(),
        workers: self.workers,
      };
      match thread::Builder::new()
        .name("producer".to_string())
        .spawn(move || producer.run())
      {
        Ok(handle) => handles.push(handle),
        Err(e) => spawn_error = Some(e),
      }
    }

    let outcome = match spawn_error {
      Some(e) => {
        error!("无法创建线程: {}", e);
        Err(EvalError::Spawn(e))
      }
      None => self.aggregate(&result_rx, &mut output),
    };

    self.status.set(HarnessState::Draining);
    drop(shutdown_tx);
    drop(result_rx);
    self.join_all(handles);
    self.status.set(HarnessState::Terminated);

    let (received, missing) = outcome?;
    let elapsed = start.elapsed();
    info!(
      "并行评测完成: {} 个结果，{} 个失败，耗时 {:.2?}",
      received, missing, elapsed
    );
    Ok(EvalReport {
      received,
      missing,
      elapsed,
    })
  }
}

struct Producer<It, F> {
  items: It,
  jobs: Sender<Job<F>>,
  shutdown: Receiver<()>,
  workers: usize,
}

impl<It, F> Producer<It, F>
where
  It: Iterator<Item = DatasetItem<F>>,
{
  fn run(self) {
    let Producer {
      items,
      jobs,
      shutdown,
      workers,
    } = self;

    let mut produced = 0usize;
    for item in items {
      if !push(&jobs, &shutdown, Job::Item(item)) {
        debug!("生产者停止，已提交 {} 项", produced);
        return;
      }
      produced += 1;
    }

    info!("数据集读取完毕，共 {} 项", produced);
    for _ in 0..workers {
      if !push(&jobs, &shutdown, Job::Stop) {
        return;
      }
    }
  }
}

fn push<F>(jobs: &Sender<Job<F>>, shutdown: &Receiver<()>, job: Job<F>) -> bool {
  select! {
    send(jobs, job) -> sent => sent.is_ok(),
    recv(shutdown) -> _ => false,
  }
}

struct Worker<B, F> {
  name: String,
  builder: Arc<B>,
  postprocessor: Arc<PostProcessor>,
  jobs: Receiver<Job<F>>,
  results: Sender<WorkerMessage>,
  shutdown: Receiver<()>,
}

impl<B, F> Worker<B, F>
where
  B: ModelBuilder,
  B::Error: std::error::Error + Send + Sync + 'static,
  B::Model: Model<Input = F>,
  <B::Model as Model>::Error: std::error::Error + Send + Sync + 'static,
{
  fn run(self) {
    debug!("{} 启动", self.name);
    let model = match build_model(self.builder.as_ref(), &self.name) {
      Ok(model) => model,
      Err(failure) => {
        self.send(WorkerMessage::Failed(failure));
        return;
      }
    };

    loop {
      let job = select! {
        recv(self.jobs) -> job => job.ok(),
        recv(self.shutdown) -> _ => None,
      };
      let item = match job {
        Some(Job::Item(item)) => item,
        Some(Job::Stop) => {
          debug!("{} 收到结束信号", self.name);
          break;
        }
        None => break,
      };

      let message = match evaluate_item(&model, &self.postprocessor, &item, &self.name) {
        Ok(result) => WorkerMessage::Done(result),
        Err(failure) => WorkerMessage::Failed(failure),
      };
      if !self.send(message) {
        break;
      }
    }
    debug!("{} 退出", self.name);
  }

  fn send(&self, message: WorkerMessage) -> bool {
    select! {
      send(self.results, message) -> sent => sent.is_ok(),
      recv(self.shutdown) -> _ => false,
    }
  }
}
