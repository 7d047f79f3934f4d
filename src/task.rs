// 该文件是 Jingmai （静脉追踪） 项目的一部分。
// src/task.rs - 后台任务调度
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

//! # 任务调度
//!
//! 每个任务在独立线程中逐帧执行，状态机为：
//!
//! ```text
//! PENDING -> PROCESSING -> COMPLETED | FAILED | CANCELLED
//! ```
//!
//! 任务提交时取得参数快照，之后对实时参数的修改只影响新任务。状态与进度
//! 通过原子变量读取，查询不会被正在处理的帧阻塞；取消请求在两帧之间检查，
//! 已经产生的结果全部保留。

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::aggregate::{ResultAggregator, TaskReport};
use crate::detect::{Algorithm, SharedModel};
use crate::frame::{Point, Roi};
use crate::input::VideoHandle;
use crate::output::{OutputWrapper, Render};
use crate::settings::{DetectionSettings, InvalidSettingsError, LiveSettings};

pub mod pipeline;
pub mod progress;

pub use self::pipeline::FramePipeline;
pub use self::progress::{FrameTimer, Progress, ProgressSnapshot};

/// ETA 滑动平均的窗口大小
const ETA_WINDOW: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
  fn new() -> Self {
    TaskId(Uuid::new_v4())
  }
}

impl fmt::Display for TaskId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    self.0.fmt(f)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum TaskState {
  Pending = 0,
  Processing = 1,
  Completed = 2,
  Failed = 3,
  Cancelled = 4,
}

impl TaskState {
  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      TaskState::Completed | TaskState::Failed | TaskState::Cancelled
    )
  }

  fn from_u8(value: u8) -> Self {
    match value {
      0 => TaskState::Pending,
      1 => TaskState::Processing,
      2 => TaskState::Completed,
      3 => TaskState::Failed,
      _ => TaskState::Cancelled,
    }
  }
}

/// 对外暴露的错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
  Decode,
  InvalidSettings,
  ModelUnavailable,
  ResourceExhausted,
  TrackerLost,
  /// 内部不变量被破坏或工作线程崩溃
  Internal,
}

/// 任务失败原因或警告，`message` 是固定的说明文字
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskIssue {
  pub kind: ErrorKind,
  pub message: String,
  /// 失败时为最后一个成功处理的帧；警告时为出现问题的帧
  pub frame_index: Option<u64>,
}

impl TaskIssue {
  fn new(kind: ErrorKind, message: &str, frame_index: Option<u64>) -> Self {
    Self {
      kind,
      message: message.to_string(),
      frame_index,
    }
  }
}

#[derive(Error, Debug)]
pub enum TaskError {
  #[error("参数无效: {0}")]
  InvalidSettings(#[from] InvalidSettingsError),
  #[error("任务不存在: {0}")]
  NotFound(TaskId),
  #[error("任务 {0} 尚未结束")]
  NotFinished(TaskId),
  #[error("无法启动任务线程: {0}")]
  Spawn(#[from] std::io::Error),
  #[error("任务线程异常退出: {0}")]
  Panicked(TaskId),
}

/// 提交任务所需的全部输入
pub struct TaskRequest {
  pub video: VideoHandle,
  /// 为 `None` 时使用实时参数的当前快照
  pub settings: Option<DetectionSettings>,
  pub roi: Option<Roi>,
  pub selected_point: Option<Point>,
  /// 深度分割模型；为 `None` 时按参数中的 URL 在任务内加载
  pub model: Option<SharedModel>,
  pub output: Option<OutputWrapper>,
}

impl TaskRequest {
  pub fn new(video: VideoHandle) -> Self {
    Self {
      video,
      settings: None,
      roi: None,
      selected_point: None,
      model: None,
      output: None,
    }
  }

  pub fn with_settings(mut self, settings: DetectionSettings) -> Self {
    self.settings = Some(settings);
    self
  }

  pub fn with_roi(mut self, roi: Roi) -> Self {
    self.roi = Some(roi);
    self
  }

  pub fn with_selected_point(mut self, point: Point) -> Self {
    self.selected_point = Some(point);
    self
  }

  pub fn with_model(mut self, model: SharedModel) -> Self {
    self.model = Some(model);
    self
  }

  pub fn with_output(mut self, output: OutputWrapper) -> Self {
    self.output = Some(output);
    self
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
  pub id: TaskId,
  pub state: TaskState,
  pub video: String,
  pub algorithm: Algorithm,
  pub progress: ProgressSnapshot,
  pub failure: Option<TaskIssue>,
  pub warnings: Vec<TaskIssue>,
  pub created_at: DateTime<Utc>,
  pub started_at: Option<DateTime<Utc>>,
  pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResults {
  pub id: TaskId,
  pub state: TaskState,
  pub algorithm: Algorithm,
  pub settings: DetectionSettings,
  pub report: TaskReport,
}

#[derive(Debug, Default)]
struct TaskMeta {
  started_at: Option<DateTime<Utc>>,
  finished_at: Option<DateTime<Utc>>,
  failure: Option<TaskIssue>,
  warnings: Vec<TaskIssue>,
  report: Option<TaskReport>,
}

struct TaskRecord {
  id: TaskId,
  video: String,
  settings: Arc<DetectionSettings>,
  created_at: DateTime<Utc>,
  state: AtomicU8,
  cancel: AtomicBool,
  progress: Progress,
  meta: Mutex<TaskMeta>,
}

impl TaskRecord {
  fn state(&self) -> TaskState {
    TaskState::from_u8(self.state.load(Ordering::Acquire))
  }

  fn transition(&self, from: TaskState, to: TaskState) -> bool {
    self
      .state
      .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
      .is_ok()
  }

  fn meta(&self) -> std::sync::MutexGuard<'_, TaskMeta> {
    self
      .meta
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  fn warn(&self, issue: TaskIssue) {
    warn!("任务 {} 警告: {:?} {}", self.id, issue.kind, issue.message);
    self.meta().warnings.push(issue);
  }

  fn status(&self) -> TaskStatus {
    let meta = self.meta();
    TaskStatus {
      id: self.id,
      state: self.state(),
      video: self.video.clone(),
      algorithm: self.settings.algorithm,
      progress: self.progress.snapshot(),
      failure: meta.failure.clone(),
      warnings: meta.warnings.clone(),
      created_at: self.created_at,
      started_at: meta.started_at,
      finished_at: meta.finished_at,
    }
  }

  /// 写入结果并进入终止状态；结果先于状态可见
  fn finish(&self, state: TaskState, report: TaskReport, failure: Option<TaskIssue>) {
    {
      let mut meta = self.meta();
      meta.report = Some(report);
      meta.failure = failure;
      meta.finished_at = Some(Utc::now());
    }
    self.state.store(state as u8, Ordering::Release);
    match state {
      TaskState::Failed => error!("任务 {} 失败", self.id),
      _ => info!("任务 {} 结束: {:?}", self.id, state),
    }
  }
}

struct Job {
  video: VideoHandle,
  roi: Option<Roi>,
  selected_point: Option<Point>,
  model: Option<SharedModel>,
  output: Option<OutputWrapper>,
}

enum Outcome {
  Completed,
  Cancelled,
  Failed(TaskIssue),
}

fn run_job(record: Arc<TaskRecord>, job: Job) {
  if record.cancel.load(Ordering::Acquire) {
    record.finish(TaskState::Cancelled, TaskReport::default(), None);
    return;
  }
  if !record.transition(TaskState::Pending, TaskState::Processing) {
    return;
  }
  record.meta().started_at = Some(Utc::now());
  info!("任务 {} 开始处理: {}", record.id, record.video);

  let settings = Arc::clone(&record.settings);
  let mut pipeline = FramePipeline::new(&settings, job.roi, job.selected_point, job.model);
  if let Some(reason) = pipeline.engine().degradation() {
    warn!("检测算法退化为空结果: {}", reason);
    record.warn(TaskIssue::new(
      ErrorKind::ModelUnavailable,
      "segmentation model unavailable, detections are empty",
      None,
    ));
  }

  let mut source = match job.video.open(settings.target_fps) {
    Ok(source) => source,
    Err(e) => {
      error!("任务 {} 无法打开视频: {}", record.id, e);
      let issue = TaskIssue::new(ErrorKind::Decode, "video could not be opened", None);
      record.finish(TaskState::Failed, TaskReport::default(), Some(issue));
      return;
    }
  };
  record.progress.set_total(source.expected_frames().unwrap_or(0));

  let mut aggregator = ResultAggregator::new();
  let mut timer = FrameTimer::new(ETA_WINDOW);
  let started = Instant::now();
  let mut lost_reported = false;

  let outcome = loop {
    if record.cancel.load(Ordering::Acquire) {
      break Outcome::Cancelled;
    }
    let last = aggregator.next_index().checked_sub(1);
    let frame_started = Instant::now();
    let frame = match source.next() {
      None => break Outcome::Completed,
      Some(Ok(frame)) => frame,
      Some(Err(e)) => {
        error!("任务 {} 解码失败: {}", record.id, e);
        break Outcome::Failed(TaskIssue::new(ErrorKind::Decode, "video decoding failed", last));
      }
    };

    let pixels = frame.width() as u64 * frame.height() as u64;
    if pixels > settings.limits.max_frame_pixels {
      error!("帧尺寸 {}x{} 超出限制", frame.width(), frame.height());
      break Outcome::Failed(TaskIssue::new(
        ErrorKind::ResourceExhausted,
        "frame size exceeds the configured limit",
        last,
      ));
    }
    if settings
      .limits
      .max_duration_secs
      .is_some_and(|max| started.elapsed().as_secs_f64() > max)
    {
      error!("任务 {} 超出时间限制", record.id);
      break Outcome::Failed(TaskIssue::new(
        ErrorKind::ResourceExhausted,
        "task exceeded the configured time budget",
        last,
      ));
    }

    let result = pipeline.process(&frame);
    if !lost_reported && result.tracker_state == crate::tracker::TrackerState::Lost {
      lost_reported = true;
      record.warn(TaskIssue::new(
        ErrorKind::TrackerLost,
        "ROI tracking lost, continuing with the last known ROI",
        Some(result.frame_index),
      ));
    }
    if let Some(output) = job.output.as_ref()
      && let Err(e) = output.render_frame(&frame, &result)
    {
      warn!("第 {} 帧输出失败: {}", frame.index, e);
    }

    let regions = result.regions.len() as u32;
    let confidence_sum: f32 = result.regions.iter().map(|r| r.confidence).sum();
    if let Err(e) = aggregator.push(result) {
      error!("任务 {} 结果顺序错误: {}", record.id, e);
      break Outcome::Failed(TaskIssue::new(
        ErrorKind::Internal,
        "frame sequence is inconsistent",
        last,
      ));
    }
    record.progress.record_regions(regions, confidence_sum);
    record.progress.advance();
    timer.record(frame_started.elapsed());
    let (processed, total) = record.progress.counts();
    record.progress.set_eta(timer.eta_secs(processed, total));

    thread::yield_now();
  };

  let tracker = pipeline.tracker();
  let report = aggregator.finish(
    tracker.map(|t| t.state()),
    tracker.map(|t| t.movement_stats().clone()).unwrap_or_default(),
    source.corrupt_frames(),
  );
  if report.corrupt_frames > 0 {
    record.warn(TaskIssue::new(
      ErrorKind::Decode,
      "corrupt frames were skipped",
      None,
    ));
  }
  match outcome {
    Outcome::Completed => {
      record.progress.finish();
      record.finish(TaskState::Completed, report, None);
    }
    Outcome::Cancelled => record.finish(TaskState::Cancelled, report, None),
    Outcome::Failed(issue) => record.finish(TaskState::Failed, report, Some(issue)),
  }
}

/// 工作线程崩溃时任务进入 FAILED，已经写入的结果不保留
fn run_guarded(record: Arc<TaskRecord>, job: Job) {
  let guard = Arc::clone(&record);
  if panic::catch_unwind(AssertUnwindSafe(move || run_job(record, job))).is_err()
    && !guard.state().is_terminal()
  {
    error!("任务 {} 工作线程崩溃", guard.id);
    let last = guard.progress.counts().0.checked_sub(1);
    let issue = TaskIssue::new(ErrorKind::Internal, "task worker crashed", last);
    guard.finish(TaskState::Failed, TaskReport::default(), Some(issue));
  }
}

/// 任务的创建、查询、取消与清理
#[derive(Default)]
pub struct TaskOrchestrator {
  live: LiveSettings,
  tasks: RwLock<HashMap<TaskId, Arc<TaskRecord>>>,
  workers: Mutex<HashMap<TaskId, JoinHandle<()>>>,
}

impl TaskOrchestrator {
  pub fn new(settings: DetectionSettings) -> Result<Self, InvalidSettingsError> {
    Ok(Self {
      live: LiveSettings::new(settings)?,
      tasks: RwLock::new(HashMap::new()),
      workers: Mutex::new(HashMap::new()),
    })
  }

  fn record(&self, id: TaskId) -> Result<Arc<TaskRecord>, TaskError> {
    let tasks = self
      .tasks
      .read()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    tasks.get(&id).cloned().ok_or(TaskError::NotFound(id))
  }

  fn take_worker(&self, id: TaskId) -> Option<JoinHandle<()>> {
    self
      .workers
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .remove(&id)
  }

  /// 校验参数、取得快照并启动后台任务，返回的状态为 PENDING
  pub fn submit(&self, request: TaskRequest) -> Result<TaskStatus, TaskError> {
    let settings = match request.settings {
      Some(settings) => {
        settings.validate()?;
        Arc::new(settings)
      }
      None => self.live.snapshot(),
    };

    let record = Arc::new(TaskRecord {
      id: TaskId::new(),
      video: request.video.describe(),
      settings,
      created_at: Utc::now(),
      state: AtomicU8::new(TaskState::Pending as u8),
      cancel: AtomicBool::new(false),
      progress: Progress::default(),
      meta: Mutex::new(TaskMeta::default()),
    });
    let status = record.status();
    let id = record.id;
    info!(
      "提交任务 {}: {} ({})",
      id, record.video, record.settings.algorithm
    );

    let job = Job {
      video: request.video,
      roi: request.roi,
      selected_point: request.selected_point,
      model: request.model,
      output: request.output,
    };

    self
      .tasks
      .write()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .insert(id, Arc::clone(&record));
    let handle = match thread::Builder::new()
      .name(format!("task-{}", id))
      .spawn(move || run_guarded(record, job))
    {
      Ok(handle) => handle,
      Err(e) => {
        self
          .tasks
          .write()
          .unwrap_or_else(|poisoned| poisoned.into_inner())
          .remove(&id);
        return Err(TaskError::Spawn(e));
      }
    };
    self
      .workers
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .insert(id, handle);

    Ok(status)
  }

  pub fn status(&self, id: TaskId) -> Result<TaskStatus, TaskError> {
    Ok(self.record(id)?.status())
  }

  /// 所有任务的状态，按创建时间排序
  pub fn list(&self) -> Vec<TaskStatus> {
    let tasks = self
      .tasks
      .read()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    let mut statuses: Vec<TaskStatus> = tasks.values().map(|r| r.status()).collect();
    statuses.sort_by_key(|s| s.created_at);
    statuses
  }

  /// 结果只在任务结束后可用；取消与失败的任务返回已处理部分
  pub fn results(&self, id: TaskId) -> Result<TaskResults, TaskError> {
    let record = self.record(id)?;
    let state = record.state();
    if !state.is_terminal() {
      return Err(TaskError::NotFinished(id));
    }
    let report = record.meta().report.clone().unwrap_or_default();
    Ok(TaskResults {
      id,
      state,
      algorithm: record.settings.algorithm,
      settings: DetectionSettings::clone(&record.settings),
      report,
    })
  }

  /// 请求取消，返回请求时的状态
  pub fn cancel(&self, id: TaskId) -> Result<TaskState, TaskError> {
    let record = self.record(id)?;
    let state = record.state();
    if !state.is_terminal() {
      record.cancel.store(true, Ordering::Release);
      info!("请求取消任务 {}", id);
    }
    Ok(state)
  }

  /// 等待任务线程退出
  pub fn wait(&self, id: TaskId) -> Result<TaskStatus, TaskError> {
    let record = self.record(id)?;
    if let Some(handle) = self.take_worker(id)
      && handle.join().is_err()
    {
      return Err(TaskError::Panicked(id));
    }
    Ok(record.status())
  }

  /// 释放任务占用的内存；未结束的任务先取消并等待
  pub fn remove(&self, id: TaskId) -> Result<(), TaskError> {
    self.cancel(id)?;
    let joined = self.wait(id);
    self
      .tasks
      .write()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .remove(&id);
    info!("任务 {} 已清理", id);
    joined.map(|_| ())
  }

  pub fn live_settings(&self) -> Arc<DetectionSettings> {
    self.live.snapshot()
  }

  /// 修改实时参数，只影响之后提交的任务
  pub fn update_live_settings<F>(&self, f: F) -> Result<(), InvalidSettingsError>
  where
    F: FnOnce(&mut DetectionSettings),
  {
    self.live.update(f)
  }

  pub fn replace_live_settings(&self, settings: DetectionSettings) -> Result<(), InvalidSettingsError> {
    self.live.replace(settings)
  }
}

impl Drop for TaskOrchestrator {
  fn drop(&mut self) {
    let tasks = self
      .tasks
      .read()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    for record in tasks.values() {
      record.cancel.store(true, Ordering::Release);
    }
    drop(tasks);
    let workers: Vec<JoinHandle<()>> = self
      .workers
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .drain()
      .map(|(_, handle)| handle)
      .collect();
    for handle in workers {
      let _ = handle.join();
    }
  }
}
