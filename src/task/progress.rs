// 该文件是 Jingmai （静脉追踪） 项目的一部分。
// src/task/progress.rs - 无锁进度计数
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

//! 已处理帧数与总帧数打包在同一个 `AtomicU64` 中（高 32 位为已处理，低 32
//! 位为总数），读取方一次加载即可得到一致的一对数值。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

const LOW_MASK: u64 = 0xFFFF_FFFF;

fn pack(high: u32, low: u32) -> u64 {
  ((high as u64) << 32) | low as u64
}

fn unpack(value: u64) -> (u32, u32) {
  ((value >> 32) as u32, (value & LOW_MASK) as u32)
}

fn saturate(value: u64) -> u32 {
  value.min(u32::MAX as u64) as u32
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
  pub processed: u64,
  pub total: u64,
  pub percentage: f64,
  pub eta_secs: Option<f64>,
  pub regions_found: u64,
  pub mean_confidence: f32,
}

#[derive(Debug)]
pub struct Progress {
  counts: AtomicU64,
  /// `f64` 的位模式，NaN 表示未知
  eta: AtomicU64,
  /// 高 32 位为区域数，低 32 位为置信度之和（`f32` 位模式）
  summary: AtomicU64,
}

impl Default for Progress {
  fn default() -> Self {
    Self {
      counts: AtomicU64::new(0),
      eta: AtomicU64::new(f64::NAN.to_bits()),
      summary: AtomicU64::new(0),
    }
  }
}

impl Progress {
  /// 设置总帧数，总数不会小于已处理数
  pub fn set_total(&self, total: u64) {
    let total = saturate(total);
    let _ = self
      .counts
      .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
        let (processed, _) = unpack(current);
        Some(pack(processed, total.max(processed)))
      });
  }

  /// 已处理数加一，必要时同步抬高总数
  pub fn advance(&self) {
    let _ = self
      .counts
      .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
        let (processed, total) = unpack(current);
        let processed = processed.saturating_add(1);
        Some(pack(processed, total.max(processed)))
      });
  }

  /// 结束时总数收敛为实际处理的帧数
  pub fn finish(&self) {
    let _ = self
      .counts
      .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
        let (processed, _) = unpack(current);
        Some(pack(processed, processed))
      });
    self.set_eta(Some(0.0));
  }

  pub fn set_eta(&self, eta_secs: Option<f64>) {
    let bits = eta_secs.unwrap_or(f64::NAN).to_bits();
    self.eta.store(bits, Ordering::Release);
  }

  pub fn record_regions(&self, count: u32, confidence_sum: f32) {
    let _ = self
      .summary
      .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
        let (regions, sum_bits) = unpack(current);
        let sum = f32::from_bits(sum_bits) + confidence_sum;
        Some(pack(regions.saturating_add(count), sum.to_bits()))
      });
  }

  pub fn counts(&self) -> (u64, u64) {
    let (processed, total) = unpack(self.counts.load(Ordering::Acquire));
    (processed as u64, total as u64)
  }

  pub fn snapshot(&self) -> ProgressSnapshot {
    let (processed, total) = self.counts();
    let percentage = if total == 0 {
      0.0
    } else {
      processed as f64 * 100.0 / total as f64
    };
    let eta = f64::from_bits(self.eta.load(Ordering::Acquire));
    let (regions, sum_bits) = unpack(self.summary.load(Ordering::Acquire));
    let mean_confidence = if regions == 0 {
      0.0
    } else {
      f32::from_bits(sum_bits) / regions as f32
    };
    ProgressSnapshot {
      processed,
      total,
      percentage,
      eta_secs: (!eta.is_nan()).then_some(eta),
      regions_found: regions as u64,
      mean_confidence,
    }
  }
}

/// 最近若干帧耗时的滑动平均
#[derive(Debug)]
pub struct FrameTimer {
  window: VecDeque<Duration>,
  capacity: usize,
}

impl FrameTimer {
  pub fn new(capacity: usize) -> Self {
    Self {
      window: VecDeque::with_capacity(capacity.max(1)),
      capacity: capacity.max(1),
    }
  }

  pub fn record(&mut self, elapsed: Duration) {
    if self.window.len() == self.capacity {
      self.window.pop_front();
    }
    self.window.push_back(elapsed);
  }

  pub fn average(&self) -> Option<Duration> {
    if self.window.is_empty() {
      return None;
    }
    Some(self.window.iter().sum::<Duration>() / self.window.len() as u32)
  }

  /// 剩余帧数乘以平均耗时；总数未知时无法估计
  pub fn eta_secs(&self, processed: u64, total: u64) -> Option<f64> {
    if total == 0 {
      return None;
    }
    let average = self.average()?;
    Some(average.as_secs_f64() * total.saturating_sub(processed) as f64)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn processed_never_exceeds_total() {
    let progress = Progress::default();
    progress.set_total(2);
    for _ in 0..3 {
      progress.advance();
      let (processed, total) = progress.counts();
      assert!(processed <= total);
    }
    assert_eq!(progress.counts(), (3, 3));
    progress.set_total(1);
    assert_eq!(progress.counts(), (3, 3));
  }

  #[test]
  fn finish_collapses_total_and_clears_eta() {
    let progress = Progress::default();
    progress.set_total(10);
    progress.advance();
    progress.set_eta(Some(4.5));
    assert_eq!(progress.snapshot().eta_secs, Some(4.5));
    progress.finish();
    let snapshot = progress.snapshot();
    assert_eq!((snapshot.processed, snapshot.total), (1, 1));
    assert_eq!(snapshot.percentage, 100.0);
    assert_eq!(snapshot.eta_secs, Some(0.0));
  }

  #[test]
  fn summary_tracks_mean_confidence() {
    let progress = Progress::default();
    progress.record_regions(2, 1.0);
    progress.record_regions(1, 0.8);
    let snapshot = progress.snapshot();
    assert_eq!(snapshot.regions_found, 3);
    assert!((snapshot.mean_confidence - 0.6).abs() < 1e-6);
  }

  #[test]
  fn concurrent_readers_never_see_torn_counts() {
    let progress = std::sync::Arc::new(Progress::default());
    progress.set_total(5000);
    let writer = {
      let progress = progress.clone();
      std::thread::spawn(move || {
        for _ in 0..5000 {
          progress.advance();
        }
      })
    };
    let mut last = 0;
    while !writer.is_finished() {
      let (processed, total) = progress.counts();
      assert!(processed <= total);
      assert!(processed >= last);
      last = processed;
    }
    writer.join().unwrap();
    assert_eq!(progress.counts(), (5000, 5000));
  }

  #[test]
  fn eta_uses_moving_average() {
    let mut timer = FrameTimer::new(2);
    assert_eq!(timer.eta_secs(0, 10), None);
    timer.record(Duration::from_millis(1000));
    timer.record(Duration::from_millis(100));
    timer.record(Duration::from_millis(300));
    let eta = timer.eta_secs(6, 10).unwrap();
    assert!((eta - 0.8).abs() < 1e-9);
    assert_eq!(timer.eta_secs(6, 0), None);
  }
}
