// 该文件是 Jingmai （静脉追踪） 项目的一部分。
// src/aggregate.rs - 逐帧结果汇总
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

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::detect::{Algorithm, VeinRegion};
use crate::frame::{Point, Roi};
use crate::tracker::{MovementStats, TrackerState};

/// 单帧的检测与跟踪结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
  pub frame_index: u64,
  pub timestamp_ms: u64,
  /// 按排序规则排列，第一个为最佳区域
  pub regions: Vec<VeinRegion>,
  /// 取各区域置信度的最大值，无区域时为 0
  pub confidence: f32,
  pub duration_ms: f64,
  pub algorithm: Algorithm,
  pub version: String,
  /// 本帧使用的搜索 ROI
  pub roi: Roi,
  pub tracker_state: TrackerState,
  /// 本帧检测失败时的说明，此时 `regions` 为空
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

impl DetectionResult {
  pub fn best(&self) -> Option<&VeinRegion> {
    self.regions.first()
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionSummary {
  pub frames: u64,
  pub regions_found: u64,
  pub frames_with_detection: u64,
  pub frames_with_errors: u64,
  pub mean_confidence: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryReport {
  /// 每帧 ROI 中心
  pub centers: Vec<Point>,
  pub final_roi: Option<Roi>,
  pub final_state: Option<TrackerState>,
  pub movement: MovementStats,
}

/// 任务结束（完成、取消或失败）时的完整结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
  pub results: Vec<DetectionResult>,
  pub summary: DetectionSummary,
  pub trajectory: TrajectoryReport,
  pub corrupt_frames: u64,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AggregateError {
  #[error("帧顺序错误: 期望第 {expected} 帧，收到第 {actual} 帧")]
  OutOfOrder { expected: u64, actual: u64 },
}

#[derive(Debug, Default)]
pub struct ResultAggregator {
  results: Vec<DetectionResult>,
  centers: Vec<Point>,
  regions_found: u64,
  frames_with_detection: u64,
  frames_with_errors: u64,
  confidence_sum: f64,
}

impl ResultAggregator {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn len(&self) -> usize {
    self.results.len()
  }

  pub fn is_empty(&self) -> bool {
    self.results.is_empty()
  }

  /// 下一个应当追加的帧序号
  pub fn next_index(&self) -> u64 {
    self.results.len() as u64
  }

  /// 追加一帧结果，帧序号必须连续递增
  pub fn push(&mut self, result: DetectionResult) -> Result<(), AggregateError> {
    let expected = self.next_index();
    if result.frame_index != expected {
      return Err(AggregateError::OutOfOrder {
        expected,
        actual: result.frame_index,
      });
    }
    self.regions_found += result.regions.len() as u64;
    if !result.regions.is_empty() {
      self.frames_with_detection += 1;
    }
    if result.error.is_some() {
      self.frames_with_errors += 1;
    }
    self.confidence_sum += result
      .regions
      .iter()
      .map(|r| r.confidence as f64)
      .sum::<f64>();
    self.centers.push(result.roi.center());
    self.results.push(result);
    Ok(())
  }

  pub fn summary(&self) -> DetectionSummary {
    let mean_confidence = if self.regions_found == 0 {
      0.0
    } else {
      (self.confidence_sum / self.regions_found as f64) as f32
    };
    DetectionSummary {
      frames: self.results.len() as u64,
      regions_found: self.regions_found,
      frames_with_detection: self.frames_with_detection,
      frames_with_errors: self.frames_with_errors,
      mean_confidence,
    }
  }

  pub fn finish(
    self,
    final_state: Option<TrackerState>,
    movement: MovementStats,
    corrupt_frames: u64,
  ) -> TaskReport {
    let summary = self.summary();
    let final_roi = self.results.last().map(|r| r.roi);
    TaskReport {
      results: self.results,
      summary,
      trajectory: TrajectoryReport {
        centers: self.centers,
        final_roi,
        final_state,
        movement,
      },
      corrupt_frames,
    }
  }
}
