// 该文件是 Jingmai （静脉追踪） 项目的一部分。
// tests/pipeline_scenarios.rs - 合成视频上的端到端检测
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

use image::{GrayImage, Luma, RgbImage};
use imageproc::drawing::draw_filled_circle_mut;

use jingmai::detect::components::{label, largest_component};
use jingmai::detect::{Algorithm, DetectionEngine, Detector};
use jingmai::frame::{Frame, NormalizedFrame, Point, Roi};
use jingmai::input::{MemoryVideo, VideoHandle};
use jingmai::preprocess::Preprocessor;
use jingmai::settings::DetectionSettings;
use jingmai::task::{TaskOrchestrator, TaskRequest, TaskState};

#[test]
fn moving_blob_is_detected_in_most_frames() {
  let (images, truth) = common::moving_blob(10);
  let orchestrator = TaskOrchestrator::default();
  let settings = DetectionSettings {
    algorithm: Algorithm::EdgeHoughEllipse,
    ..DetectionSettings::default()
  };
  let id = orchestrator
    .submit(TaskRequest::new(VideoHandle::Memory(MemoryVideo::new(images, 8.0))).with_settings(settings))
    .unwrap()
    .id;
  let status = orchestrator.wait(id).unwrap();
  assert_eq!(status.state, TaskState::Completed);

  let results = orchestrator.results(id).unwrap().report.results;
  assert_eq!(results.len(), 10);
  let good = results
    .iter()
    .zip(truth.iter())
    .filter(|(result, center)| {
      result.regions.len() == 1
        && result.regions[0].center.distance(center) <= 3.0
        && result.regions[0].confidence > 0.5
    })
    .count();
  assert!(good >= 8, "only {} of 10 frames matched", good);
}

#[test]
fn black_frame_yields_no_regions_for_every_algorithm() {
  let frame = Frame::new(0, 0, RgbImage::new(common::WIDTH, common::HEIGHT));
  for algorithm in Algorithm::ALL {
    let mut settings = DetectionSettings {
      algorithm,
      ..DetectionSettings::default()
    };
    settings.threshold.largest_component = true;
    let normalized = Preprocessor::new(settings.preprocess.clone()).process(&frame, None);
    let engine = DetectionEngine::new(&settings, None, None);
    let regions = engine.detect(&normalized, frame.full_roi()).unwrap();
    assert!(regions.is_empty(), "{} found {} regions", algorithm, regions.len());
  }
}

#[test]
fn black_video_completes_with_empty_results() {
  let orchestrator = TaskOrchestrator::default();
  let mut settings = DetectionSettings {
    algorithm: Algorithm::ThresholdMorphology,
    ..DetectionSettings::default()
  };
  settings.threshold.largest_component = true;
  let video = MemoryVideo::new(vec![RgbImage::new(64, 48); 4], 8.0);
  let id = orchestrator
    .submit(TaskRequest::new(VideoHandle::Memory(video)).with_settings(settings))
    .unwrap()
    .id;
  assert_eq!(orchestrator.wait(id).unwrap().state, TaskState::Completed);
  let report = orchestrator.results(id).unwrap().report;
  assert_eq!(report.results.len(), 4);
  assert!(
    report
      .results
      .iter()
      .all(|r| r.regions.is_empty() && r.error.is_none())
  );
  assert_eq!(report.summary.regions_found, 0);
}

#[test]
fn largest_component_keeps_exactly_the_biggest_and_is_idempotent() {
  let mut mask = GrayImage::new(120, 80);
  // 带孔的环形，面积最大
  draw_filled_circle_mut(&mut mask, (30, 40), 20, Luma([255]));
  draw_filled_circle_mut(&mut mask, (30, 40), 8, Luma([0]));
  // 两个对角相接的小块
  for (x, y) in [(70u32, 10u32), (71, 11)] {
    mask.put_pixel(x, y, Luma([255]));
  }
  draw_filled_circle_mut(&mut mask, (95, 50), 10, Luma([255]));

  let labeling = label(&mask);
  let biggest = labeling.largest().unwrap().clone();
  assert_eq!(labeling.components().len(), 3);

  let output = largest_component(&mask).unwrap();
  for (x, y, p) in output.enumerate_pixels() {
    let in_biggest = labeling.label_at(Point::new(x as f32, y as f32)) == Some(biggest.label);
    assert_eq!(p.0[0] == 255, in_biggest, "pixel ({}, {})", x, y);
  }
  assert_eq!(largest_component(&output).unwrap(), output);
}

#[test]
fn threshold_largest_component_reports_one_region() {
  let mut gray = GrayImage::from_pixel(common::WIDTH, common::HEIGHT, Luma([10]));
  draw_filled_circle_mut(&mut gray, (45, 60), 18, Luma([100]));
  draw_filled_circle_mut(&mut gray, (115, 60), 10, Luma([100]));
  let normalized = NormalizedFrame {
    index: 0,
    timestamp_ms: 0,
    gray,
    region: Roi::full(common::WIDTH, common::HEIGHT),
  };

  let mut settings = DetectionSettings {
    algorithm: Algorithm::ThresholdMorphology,
    ..DetectionSettings::default()
  };
  settings.threshold.largest_component = true;
  let engine = DetectionEngine::new(&settings, None, None);
  let regions = engine.detect(&normalized, normalized.region).unwrap();
  assert_eq!(regions.len(), 1);
  assert!(regions[0].center.distance(&Point::new(45.0, 60.0)) < 2.0);

  settings.threshold.largest_component = false;
  let engine = DetectionEngine::new(&settings, None, None);
  assert_eq!(engine.detect(&normalized, normalized.region).unwrap().len(), 2);
}
