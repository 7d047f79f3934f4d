// 该文件是 Jingmai （静脉追踪） 项目的一部分。
// src/task/pipeline.rs - 单帧处理流水线
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

use std::time::Instant;

use tracing::{debug, warn};

use crate::aggregate::DetectionResult;
use crate::detect::{DetectionEngine, DetectionError, Detector, SharedModel};
use crate::filter::{FilterContext, RegionFilter};
use crate::frame::{Frame, Point, Roi};
use crate::preprocess::Preprocessor;
use crate::settings::{DetectionSettings, TrackerSettings};
use crate::tracker::{RoiTracker, TrackerState};

/// 对外只给出固定的说明，内部错误写入日志
fn annotate(error: &DetectionError) -> &'static str {
  match error {
    DetectionError::Model(_) => "segmentation model inference failed",
    DetectionError::EmptyRegion { .. } => "search region is empty",
  }
}

/// 预处理 → 检测 → 过滤 → 跟踪
///
/// 每个任务构造自己的实例，内部状态只有跟踪器。
pub struct FramePipeline {
  preprocessor: Preprocessor,
  engine: DetectionEngine,
  filter: RegionFilter,
  tracker_settings: TrackerSettings,
  tracker: Option<RoiTracker>,
  seed: Option<Roi>,
  selected_point: Option<Point>,
}

impl FramePipeline {
  pub fn new(
    settings: &DetectionSettings,
    seed: Option<Roi>,
    selected_point: Option<Point>,
    model: Option<SharedModel>,
  ) -> Self {
    Self {
      preprocessor: Preprocessor::new(settings.preprocess.clone()),
      engine: DetectionEngine::new(settings, selected_point, model),
      filter: RegionFilter::new(settings.filter.clone()),
      tracker_settings: settings.tracker.clone(),
      tracker: None,
      seed,
      selected_point,
    }
  }

  pub fn engine(&self) -> &DetectionEngine {
    &self.engine
  }

  pub fn tracker(&self) -> Option<&RoiTracker> {
    self.tracker.as_ref()
  }

  /// 跟踪器在第一帧到来、帧尺寸已知时创建
  fn tracker_for(&mut self, frame: &Frame) -> &mut RoiTracker {
    let seed = self.seed;
    let settings = &self.tracker_settings;
    self.tracker.get_or_insert_with(|| {
      let mut tracker = RoiTracker::new(settings.clone(), frame.width(), frame.height());
      if let Some(roi) = seed {
        tracker.seed(roi);
      }
      tracker
    })
  }

  pub fn process(&mut self, frame: &Frame) -> DetectionResult {
    let started = Instant::now();
    let roi = self.tracker_for(frame).roi();
    let normalized = self.preprocessor.process(frame, Some(roi));

    let (mut regions, error) = match self.engine.detect(&normalized, roi) {
      Ok(candidates) => {
        let ctx = FilterContext {
          roi,
          frame_height: frame.height(),
          selected_point: self.selected_point,
        };
        (self.filter.filter(candidates, &ctx), None)
      }
      Err(e) => {
        warn!("第 {} 帧检测失败: {}", frame.index, e);
        (Vec::new(), Some(annotate(&e).to_string()))
      }
    };

    let tracker = self.tracker_for(frame);
    let was_lost = tracker.state() == TrackerState::Lost;
    tracker.update(regions.first().map(|r| r.center), 1.0);
    let tracker_state = tracker.state();
    let factor = tracker.confidence_factor();
    if !was_lost && tracker_state == TrackerState::Lost {
      warn!("第 {} 帧 ROI 跟踪丢失", frame.index);
    }
    if factor < 1.0 {
      for region in regions.iter_mut() {
        region.confidence *= factor;
      }
    }

    let confidence = regions.iter().map(|r| r.confidence).fold(0.0, f32::max);
    let algorithm = self.engine.algorithm();
    let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
    debug!(
      "第 {} 帧: {} 个区域，置信度 {:.2}，耗时 {:.2} ms",
      frame.index,
      regions.len(),
      confidence,
      duration_ms
    );

    DetectionResult {
      frame_index: frame.index,
      timestamp_ms: frame.timestamp_ms,
      regions,
      confidence,
      duration_ms,
      algorithm,
      version: algorithm.version().to_string(),
      roi,
      tracker_state,
      error,
    }
  }
}
