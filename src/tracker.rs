// 该文件是 Jingmai （静脉追踪） 项目的一部分。
// src/tracker.rs - ROI 跟踪
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

//! # ROI 跟踪
//!
//! 每个任务拥有一个 [`RoiTracker`]。最佳区域的中心作为量测输入匀速模型
//! 卡尔曼滤波，输出的 ROI 中心是滤波后的估计值。
//!
//! 状态迁移：
//!
//! ```text
//! UNINITIALIZED --量测/种子--> TRACKING <--> DRIFTING
//!                                  \            /
//!                                   +--> LOST <-+   (终止)
//! ```
//!
//! 偏离预测超过 `lost_threshold` 的量测视为误检，与漏检一样只做预测；
//! 连续 `lost_frames` 帧没有有效量测才进入 LOST。

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::frame::{Point, Roi};
use crate::settings::TrackerSettings;

mod kalman;

pub use self::kalman::{Kalman1D, Kalman2D};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrackerState {
  Uninitialized,
  Tracking,
  Drifting,
  Lost,
}

/// ROI 单步位移分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Movement {
  Stable,
  Drift,
  Jump,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MovementStats {
  pub total_movements: u64,
  pub stable_frames: u64,
  pub drift_frames: u64,
  pub jump_frames: u64,
  pub stability_rate: f32,
  pub drift_rate: f32,
}

impl MovementStats {
  fn record(&mut self, movement: Movement) {
    self.total_movements += 1;
    match movement {
      Movement::Stable => self.stable_frames += 1,
      Movement::Drift => self.drift_frames += 1,
      Movement::Jump => self.jump_frames += 1,
    }
    let total = self.total_movements as f32;
    self.stability_rate = self.stable_frames as f32 / total;
    self.drift_rate = self.drift_frames as f32 / total;
  }
}

pub struct RoiTracker {
  settings: TrackerSettings,
  frame_width: u32,
  frame_height: u32,
  roi_width: u32,
  roi_height: u32,
  state: TrackerState,
  filter: Option<Kalman2D>,
  roi: Roi,
  history: VecDeque<Point>,
  deviation_streak: u32,
  miss_streak: u32,
  stats: MovementStats,
}

impl RoiTracker {
  /// 未初始化时 ROI 覆盖整帧
  pub fn new(settings: TrackerSettings, frame_width: u32, frame_height: u32) -> Self {
    let roi_width = settings.roi_width;
    let roi_height = settings.roi_height;
    Self {
      settings,
      frame_width,
      frame_height,
      roi_width,
      roi_height,
      state: TrackerState::Uninitialized,
      filter: None,
      roi: Roi::full(frame_width, frame_height),
      history: VecDeque::new(),
      deviation_streak: 0,
      miss_streak: 0,
      stats: MovementStats::default(),
    }
  }

  /// 以用户给定的矩形初始化，矩形尺寸作为之后 ROI 的尺寸
  pub fn seed(&mut self, roi: Roi) {
    let roi = roi.clamp_to(self.frame_width, self.frame_height);
    self.roi_width = roi.width;
    self.roi_height = roi.height;
    self.roi = roi;
    self.filter = Some(Kalman2D::new(
      roi.center(),
      self.settings.process_noise,
      self.settings.measurement_noise,
    ));
    self.state = TrackerState::Tracking;
    self.deviation_streak = 0;
    self.miss_streak = 0;
    info!(
      "ROI 跟踪初始化: ({}, {}) {}x{}",
      roi.x, roi.y, roi.width, roi.height
    );
  }

  pub fn state(&self) -> TrackerState {
    self.state
  }

  pub fn roi(&self) -> Roi {
    self.roi
  }

  pub fn velocity(&self) -> Option<Point> {
    self.filter.as_ref().map(Kalman2D::velocity)
  }

  /// 最近被采纳的量测点（最旧的在前）
  pub fn history(&self) -> impl Iterator<Item = &Point> {
    self.history.iter()
  }

  pub fn movement_stats(&self) -> &MovementStats {
    &self.stats
  }

  /// 丢失状态下结果置信度需要乘以的系数
  pub fn confidence_factor(&self) -> f32 {
    if self.state == TrackerState::Lost {
      self.settings.lost_penalty
    } else {
      1.0
    }
  }

  /// 按当前速度外推 `frames` 帧之后的中心；未初始化或已丢失时为 `None`
  pub fn predict_ahead(&self, frames: u32) -> Option<Point> {
    if self.state == TrackerState::Lost {
      return None;
    }
    self
      .filter
      .as_ref()
      .map(|filter| filter.extrapolate(frames as f32))
  }

  fn centered(&self, center: Point) -> Roi {
    Roi::centered_at(
      center,
      self.roi_width,
      self.roi_height,
      self.frame_width,
      self.frame_height,
    )
  }

  fn remember(&mut self, measurement: Point) {
    self.history.push_back(measurement);
    while self.history.len() > self.settings.history.max(1) {
      self.history.pop_front();
    }
  }

  fn classify(&self, distance: f32) -> Movement {
    if distance < self.settings.stable_movement {
      Movement::Stable
    } else if distance < self.settings.drift_movement {
      Movement::Drift
    } else {
      Movement::Jump
    }
  }

  /// 将 ROI 移向滤波估计值，单步位移不超过 `max_step`
  fn emit(&mut self, target: Point) {
    let previous = self.roi.center();
    let distance = previous.distance(&target);
    let limited = if distance > self.settings.max_step && distance > 0.0 {
      let scale = self.settings.max_step / distance;
      Point::new(
        previous.x + (target.x - previous.x) * scale,
        previous.y + (target.y - previous.y) * scale,
      )
    } else {
      target
    };
    let roi = self.centered(limited);
    let moved = previous.distance(&roi.center());
    self.stats.record(self.classify(moved));
    self.roi = roi;
  }

  fn mark_lost(&mut self, reason: &str) {
    if self.state != TrackerState::Lost {
      warn!("ROI 跟踪丢失: {}，之后沿用最后的 ROI", reason);
    }
    self.state = TrackerState::Lost;
  }

  /// 吸收一帧的量测（可能没有），返回下一帧的搜索 ROI
  ///
  /// `dt` 以采样帧为单位。
  pub fn update(&mut self, measurement: Option<Point>, dt: f32) -> Roi {
    if self.state == TrackerState::Lost {
      return self.roi;
    }
    let Some(filter) = self.filter.as_mut() else {
      if let Some(m) = measurement {
        self.filter = Some(Kalman2D::new(
          m,
          self.settings.process_noise,
          self.settings.measurement_noise,
        ));
        self.state = TrackerState::Tracking;
        self.roi = self.centered(m);
        self.remember(m);
        info!("ROI 跟踪由首个量测初始化: ({:.1}, {:.1})", m.x, m.y);
      }
      return self.roi;
    };

    let predicted = filter.predict(dt);
    // 超出丢失阈值的量测视为误检，按没有量测处理
    let gated = measurement.and_then(|m| {
      let deviation = m.distance(&predicted);
      if deviation > self.settings.lost_threshold {
        debug!(
          "量测 ({:.1}, {:.1}) 偏离预测 {:.1} px，忽略",
          m.x, m.y, deviation
        );
        None
      } else {
        Some((m, deviation))
      }
    });
    match gated {
      Some((m, deviation)) => {
        self.miss_streak = 0;
        filter.correct(m);
        if deviation > self.settings.drift_threshold {
          self.deviation_streak += 1;
          if self.deviation_streak >= self.settings.lost_frames {
            self.mark_lost(&format!("连续 {} 帧偏离预测", self.deviation_streak));
            return self.roi;
          }
          if self.deviation_streak >= self.settings.drift_frames {
            if self.state != TrackerState::Drifting {
              debug!("ROI 漂移: 连续 {} 帧偏离预测", self.deviation_streak);
            }
            self.state = TrackerState::Drifting;
          }
        } else {
          self.deviation_streak = 0;
          self.state = TrackerState::Tracking;
        }
      }
      None => {
        self.miss_streak += 1;
        if self.miss_streak >= self.settings.lost_frames {
          self.mark_lost(&format!("连续 {} 帧没有有效量测", self.miss_streak));
          return self.roi;
        }
        if self.miss_streak >= self.settings.drift_frames {
          self.state = TrackerState::Drifting;
        }
      }
    }

    let estimate = filter.position();
    if let Some((m, _)) = gated {
      self.remember(m);
    }
    self.emit(estimate);
    self.roi
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn tracker() -> RoiTracker {
    RoiTracker::new(TrackerSettings::default(), 640, 480)
  }

  #[test]
  fn static_measurement_converges() {
    let mut t = tracker();
    let target = Point::new(300.0, 220.0);
    for _ in 0..40 {
      let roi = t.update(Some(target), 1.0);
      assert!(roi.is_within(640, 480));
    }
    assert_eq!(t.state(), TrackerState::Tracking);
    assert!(t.roi().center().distance(&target) <= 1.0);
  }

  #[test]
  fn roi_is_translated_not_resized_at_border() {
    let mut t = tracker();
    for _ in 0..20 {
      let roi = t.update(Some(Point::new(630.0, 10.0)), 1.0);
      assert!(roi.is_within(640, 480));
      assert_eq!((roi.width, roi.height), (200, 200));
    }
    assert_eq!((t.roi().x, t.roi().y), (440, 0));
  }

  #[test]
  fn coasting_below_lost_threshold_keeps_tracking_state() {
    let mut t = tracker();
    t.seed(Roi::new(100, 100, 200, 200));
    for _ in 0..5 {
      t.update(Some(Point::new(200.0, 200.0)), 1.0);
    }
    for k in 0..9 {
      t.update(None, 1.0);
      let state = t.state();
      assert!(
        matches!(state, TrackerState::Tracking | TrackerState::Drifting),
        "after {} misses: {:?}",
        k + 1,
        state
      );
    }
    assert_eq!(t.state(), TrackerState::Drifting);
  }

  #[test]
  fn drift_then_recover() {
    let mut t = tracker();
    t.seed(Roi::new(100, 100, 200, 200));
    for _ in 0..10 {
      t.update(Some(Point::new(200.0, 200.0)), 1.0);
    }
    // 在两侧来回跳动，保持偏离在漂移与丢失阈值之间
    for i in 0..3 {
      let offset = if i % 2 == 0 { 25.0 } else { -25.0 };
      t.update(Some(Point::new(200.0 + offset, 200.0)), 1.0);
    }
    assert_eq!(t.state(), TrackerState::Drifting);
    for _ in 0..20 {
      t.update(Some(Point::new(200.0, 200.0)), 1.0);
    }
    assert_eq!(t.state(), TrackerState::Tracking);
  }

  #[test]
  fn single_outlier_is_ignored() {
    let mut t = tracker();
    t.seed(Roi::new(100, 100, 200, 200));
    for _ in 0..10 {
      t.update(Some(Point::new(200.0, 200.0)), 1.0);
    }
    let before = t.roi();
    // 仍在 ROI 内，但偏离预测超过丢失阈值
    t.update(Some(Point::new(270.0, 200.0)), 1.0);
    assert_eq!(t.state(), TrackerState::Tracking);
    assert!(t.roi().center().distance(&before.center()) <= 1.0);
    for _ in 0..50 {
      t.update(Some(Point::new(200.0, 200.0)), 1.0);
    }
    assert_eq!(t.state(), TrackerState::Tracking);
    assert!(t.roi().center().distance(&Point::new(200.0, 200.0)) <= 1.0);
    assert_eq!(t.confidence_factor(), 1.0);
  }

  #[test]
  fn repeated_outliers_are_lost_and_terminal() {
    let mut t = tracker();
    t.seed(Roi::new(100, 100, 200, 200));
    for _ in 0..5 {
      t.update(Some(Point::new(200.0, 200.0)), 1.0);
    }
    let lost_frames = TrackerSettings::default().lost_frames;
    for k in 1..lost_frames {
      t.update(Some(Point::new(500.0, 400.0)), 1.0);
      assert_ne!(t.state(), TrackerState::Lost, "after {} outliers", k);
    }
    assert_eq!(t.state(), TrackerState::Drifting);
    t.update(Some(Point::new(500.0, 400.0)), 1.0);
    assert_eq!(t.state(), TrackerState::Lost);

    let before = t.roi();
    assert_eq!(t.update(Some(Point::new(200.0, 200.0)), 1.0), before);
    assert_eq!(t.state(), TrackerState::Lost);
    assert_eq!(t.confidence_factor(), 0.5);
  }

  #[test]
  fn predict_ahead_extrapolates_constant_velocity() {
    let mut t = tracker();
    assert_eq!(t.predict_ahead(3), None);

    t.seed(Roi::new(100, 100, 200, 200));
    for i in 1..=30 {
      t.update(Some(Point::new(200.0 + 2.0 * i as f32, 200.0)), 1.0);
    }
    let velocity = t.velocity().unwrap();
    assert!((velocity.x - 2.0).abs() < 0.3, "velocity {:?}", velocity);
    assert!(velocity.y.abs() < 0.3);

    let now = t.predict_ahead(0).unwrap();
    let ahead = t.predict_ahead(5).unwrap();
    assert!((ahead.x - now.x - 5.0 * velocity.x).abs() < 1e-3);
    assert!((ahead.y - now.y - 5.0 * velocity.y).abs() < 1e-3);
    assert!((now.x - 260.0).abs() < 3.0, "estimate {:?}", now);

    for _ in 0..TrackerSettings::default().lost_frames {
      t.update(None, 1.0);
    }
    assert_eq!(t.state(), TrackerState::Lost);
    assert_eq!(t.predict_ahead(3), None);
  }

  #[test]
  fn history_keeps_the_most_recent_measurements() {
    let mut t = tracker();
    t.seed(Roi::new(100, 100, 200, 200));
    for i in 0..15 {
      t.update(Some(Point::new(200.0 + i as f32, 200.0)), 1.0);
    }
    t.update(None, 1.0);
    let recent: Vec<f32> = t.history().map(|p| p.x).collect();
    let expected: Vec<f32> = (5..15).map(|i| 200.0 + i as f32).collect();
    assert_eq!(recent, expected);
  }

  #[test]
  fn step_is_limited() {
    let settings = TrackerSettings {
      max_step: 5.0,
      lost_threshold: 1000.0,
      drift_threshold: 500.0,
      ..TrackerSettings::default()
    };
    let mut t = RoiTracker::new(settings, 640, 480);
    t.seed(Roi::new(100, 100, 200, 200));
    let before = t.roi().center();
    t.update(Some(Point::new(400.0, 200.0)), 1.0);
    assert!(t.roi().center().distance(&before) <= 5.0 + 1.0);
  }

  #[test]
  fn movement_statistics_are_counted() {
    let mut t = tracker();
    t.seed(Roi::new(100, 100, 200, 200));
    for _ in 0..10 {
      t.update(Some(Point::new(200.0, 200.0)), 1.0);
    }
    let stats = t.movement_stats();
    assert_eq!(stats.total_movements, 10);
    assert_eq!(stats.stable_frames, 10);
    assert_eq!(stats.stability_rate, 1.0);
  }
}
