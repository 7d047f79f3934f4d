// 该文件是 Jingmai （静脉追踪） 项目的一部分。
// tests/task_lifecycle.rs - 任务状态机、进度与取消
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

mod common;

use std::thread;
use std::time::Duration;

use image::RgbImage;

use jingmai::aggregate::DetectionResult;
use jingmai::detect::Algorithm;
use jingmai::input::{MemoryVideo, VideoHandle};
use jingmai::settings::DetectionSettings;
use jingmai::task::{ErrorKind, TaskError, TaskId, TaskOrchestrator, TaskRequest, TaskState};

fn memory(video: MemoryVideo) -> TaskRequest {
  TaskRequest::new(VideoHandle::Memory(video))
}

fn run_to_end(orchestrator: &TaskOrchestrator, request: TaskRequest) -> TaskId {
  let id = orchestrator.submit(request).unwrap().id;
  orchestrator.wait(id).unwrap();
  id
}

/// 去掉耗时后比较，耗时每次运行都不同
fn comparable(result: &DetectionResult) -> impl PartialEq + std::fmt::Debug + '_ {
  (
    result.frame_index,
    result.timestamp_ms,
    &result.regions,
    result.roi,
    result.tracker_state,
    &result.error,
  )
}

#[test]
fn results_are_complete_and_ordered() {
  let orchestrator = TaskOrchestrator::default();
  let video = MemoryVideo::new(common::textured_frames(12), 8.0);
  let id = run_to_end(&orchestrator, memory(video));

  let status = orchestrator.status(id).unwrap();
  assert_eq!(status.state, TaskState::Completed);
  assert_eq!(status.progress.processed, 12);
  assert_eq!(status.progress.total, 12);
  assert_eq!(status.progress.percentage, 100.0);

  let report = orchestrator.results(id).unwrap().report;
  assert_eq!(report.results.len(), 12);
  for (i, result) in report.results.iter().enumerate() {
    assert_eq!(result.frame_index, i as u64);
  }
  assert_eq!(report.summary.frames, 12);
}

#[test]
fn source_is_sampled_down_to_the_target_rate() {
  let orchestrator = TaskOrchestrator::default();
  let video = MemoryVideo::new(common::textured_frames(12), 24.0);
  let id = run_to_end(&orchestrator, memory(video));

  let report = orchestrator.results(id).unwrap().report;
  let timestamps: Vec<u64> = report.results.iter().map(|r| r.timestamp_ms).collect();
  assert_eq!(timestamps, vec![0, 125, 250, 375]);
}

#[test]
fn under_reported_frame_count_still_completes() {
  let orchestrator = TaskOrchestrator::default();
  for reported in [Some(3), None] {
    let video = MemoryVideo::new(common::textured_frames(6), 8.0)
      .with_reported_frame_count(reported);
    let id = run_to_end(&orchestrator, memory(video));
    let status = orchestrator.status(id).unwrap();
    assert_eq!(status.state, TaskState::Completed);
    assert_eq!(status.progress.processed, 6);
    assert_eq!(status.progress.total, 6);
    assert_eq!(orchestrator.results(id).unwrap().report.results.len(), 6);
  }
}

#[test]
fn progress_is_monotonic_while_polling() {
  let orchestrator = TaskOrchestrator::default();
  let video = MemoryVideo::new(common::textured_frames(20), 8.0)
    .with_frame_delay(Duration::from_millis(5));
  let id = orchestrator.submit(memory(video)).unwrap().id;

  let mut last = 0;
  loop {
    let status = orchestrator.status(id).unwrap();
    let progress = status.progress;
    assert!(progress.processed >= last, "进度回退: {} -> {}", last, progress.processed);
    assert!(progress.processed <= progress.total);
    assert!((0.0..=100.0).contains(&progress.percentage));
    last = progress.processed;
    if status.state.is_terminal() {
      break;
    }
    thread::sleep(Duration::from_millis(2));
  }
  assert_eq!(last, 20);
}

#[test]
fn results_are_unavailable_until_the_task_ends() {
  let orchestrator = TaskOrchestrator::default();
  let video = MemoryVideo::new(common::textured_frames(10), 8.0)
    .with_frame_delay(Duration::from_millis(30));
  let id = orchestrator.submit(memory(video)).unwrap().id;
  assert!(matches!(orchestrator.results(id), Err(TaskError::NotFinished(_))));
  orchestrator.wait(id).unwrap();
  assert!(orchestrator.results(id).is_ok());
}

#[test]
fn cancelled_task_keeps_a_prefix_of_the_full_run() {
  let orchestrator = TaskOrchestrator::default();
  let frames = common::textured_frames(30);

  let full_id = run_to_end(&orchestrator, memory(MemoryVideo::new(frames.clone(), 8.0)));
  let full = orchestrator.results(full_id).unwrap().report.results;
  assert_eq!(full.len(), 30);

  let slow = MemoryVideo::new(frames, 8.0).with_frame_delay(Duration::from_millis(20));
  let id = orchestrator.submit(memory(slow)).unwrap().id;
  while orchestrator.status(id).unwrap().progress.processed < 3 {
    thread::sleep(Duration::from_millis(5));
  }
  assert_eq!(orchestrator.cancel(id).unwrap(), TaskState::Processing);
  let status = orchestrator.wait(id).unwrap();
  assert_eq!(status.state, TaskState::Cancelled);
  assert!(status.failure.is_none());

  let partial = orchestrator.results(id).unwrap().report.results;
  assert!(partial.len() >= 3 && partial.len() < 30);
  for (a, b) in partial.iter().zip(full.iter()) {
    assert_eq!(comparable(a), comparable(b));
  }

  // 结束后的取消不改变状态
  assert_eq!(orchestrator.cancel(id).unwrap(), TaskState::Cancelled);
  assert_eq!(orchestrator.status(id).unwrap().state, TaskState::Cancelled);
}

#[test]
fn running_task_keeps_its_settings_snapshot() {
  let orchestrator = TaskOrchestrator::default();
  let video = MemoryVideo::new(common::textured_frames(10), 8.0)
    .with_frame_delay(Duration::from_millis(20));
  let id = orchestrator.submit(memory(video)).unwrap().id;
  let before = orchestrator.live_settings();

  orchestrator
    .update_live_settings(|s| {
      s.algorithm = Algorithm::ThresholdMorphology;
      s.preprocess.blur_kernel = 9;
    })
    .unwrap();
  assert_eq!(orchestrator.live_settings().algorithm, Algorithm::ThresholdMorphology);

  orchestrator.wait(id).unwrap();
  let results = orchestrator.results(id).unwrap();
  assert_eq!(results.settings, *before);
  assert_eq!(results.algorithm, before.algorithm);
  assert!(results.report.results.iter().all(|r| r.algorithm == before.algorithm));

  let next = run_to_end(&orchestrator, memory(MemoryVideo::new(common::textured_frames(2), 8.0)));
  assert_eq!(
    orchestrator.results(next).unwrap().algorithm,
    Algorithm::ThresholdMorphology
  );
}

#[test]
fn invalid_settings_are_rejected_without_creating_a_task() {
  let orchestrator = TaskOrchestrator::default();
  let mut settings = DetectionSettings::default();
  settings.preprocess.blur_kernel = 4;
  let submitted = orchestrator
    .submit(memory(MemoryVideo::new(common::textured_frames(2), 8.0)).with_settings(settings));
  assert!(matches!(submitted, Err(TaskError::InvalidSettings(_))));
  assert!(orchestrator.list().is_empty());

  assert!(
    orchestrator
      .update_live_settings(|s| s.preprocess.clahe_clip_limit = 100.0)
      .is_err()
  );
  assert_eq!(*orchestrator.live_settings(), DetectionSettings::default());
}

#[test]
fn decode_failure_keeps_processed_frames() {
  let orchestrator = TaskOrchestrator::default();
  let video = MemoryVideo::new(common::textured_frames(10), 8.0).with_failure_at(4);
  let id = run_to_end(&orchestrator, memory(video));

  let status = orchestrator.status(id).unwrap();
  assert_eq!(status.state, TaskState::Failed);
  let failure = status.failure.unwrap();
  assert_eq!(failure.kind, ErrorKind::Decode);
  assert_eq!(failure.frame_index, Some(3));
  assert_eq!(orchestrator.results(id).unwrap().report.results.len(), 4);
}

#[test]
fn unopenable_video_fails_before_any_frame() {
  let orchestrator = TaskOrchestrator::default();
  let video = MemoryVideo::new(common::textured_frames(3), 8.0).with_open_failure();
  let id = run_to_end(&orchestrator, memory(video));

  let status = orchestrator.status(id).unwrap();
  assert_eq!(status.state, TaskState::Failed);
  let failure = status.failure.unwrap();
  assert_eq!(failure.kind, ErrorKind::Decode);
  assert_eq!(failure.frame_index, None);
  assert!(orchestrator.results(id).unwrap().report.results.is_empty());
}

#[test]
fn corrupt_frames_are_skipped_and_counted() {
  let orchestrator = TaskOrchestrator::default();
  let video = MemoryVideo::new(common::textured_frames(8), 8.0)
    .with_corrupt_frame(2)
    .with_corrupt_frame(5);
  let id = run_to_end(&orchestrator, memory(video));

  let status = orchestrator.status(id).unwrap();
  assert_eq!(status.state, TaskState::Completed);
  assert!(status.warnings.iter().any(|w| w.kind == ErrorKind::Decode));
  let report = orchestrator.results(id).unwrap().report;
  assert_eq!(report.corrupt_frames, 2);
  assert_eq!(report.results.len(), 6);
  for (i, result) in report.results.iter().enumerate() {
    assert_eq!(result.frame_index, i as u64);
  }
}

#[test]
fn oversized_frames_exhaust_resources() {
  let orchestrator = TaskOrchestrator::default();
  let mut settings = DetectionSettings::default();
  settings.limits.max_frame_pixels = 100;
  let video = MemoryVideo::new(vec![RgbImage::new(32, 24); 3], 8.0);
  let id = run_to_end(&orchestrator, memory(video).with_settings(settings));

  let status = orchestrator.status(id).unwrap();
  assert_eq!(status.state, TaskState::Failed);
  let failure = status.failure.unwrap();
  assert_eq!(failure.kind, ErrorKind::ResourceExhausted);
  assert_eq!(failure.frame_index, None);
}

#[test]
fn concurrent_tasks_do_not_interfere() {
  let orchestrator = TaskOrchestrator::default();
  let (blob, _) = common::moving_blob(6);
  let ids: Vec<TaskId> = (0..4)
    .map(|i| {
      let video = if i % 2 == 0 {
        MemoryVideo::new(blob.clone(), 8.0)
      } else {
        MemoryVideo::new(common::textured_frames(6 + i), 8.0)
      };
      orchestrator.submit(memory(video)).unwrap().id
    })
    .collect();

  let statuses = orchestrator.list();
  assert_eq!(statuses.len(), 4);
  for (i, id) in ids.iter().enumerate() {
    let status = orchestrator.wait(*id).unwrap();
    assert_eq!(status.state, TaskState::Completed);
    let expected = if i % 2 == 0 { 6 } else { 6 + i };
    assert_eq!(orchestrator.results(*id).unwrap().report.results.len(), expected);
  }

  let first = orchestrator.results(ids[0]).unwrap().report.results;
  let third = orchestrator.results(ids[2]).unwrap().report.results;
  for (a, b) in first.iter().zip(third.iter()) {
    assert_eq!(comparable(a), comparable(b));
  }
}
