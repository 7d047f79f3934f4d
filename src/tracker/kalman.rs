// 该文件是 Jingmai （静脉追踪） 项目的一部分。
// src/tracker/kalman.rs - 匀速模型卡尔曼滤波
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

use crate::frame::Point;

const EPSILON: f32 = 1e-6;

/// 单轴匀速模型，状态为 `[位置, 速度]`
#[derive(Debug, Clone)]
pub struct Kalman1D {
  state: [f32; 2],
  covariance: [[f32; 2]; 2],
  process_noise: f32,
  measurement_noise: f32,
}

impl Kalman1D {
  pub fn new(position: f32, process_noise: f32, measurement_noise: f32) -> Self {
    Self {
      state: [position, 0.0],
      // 初始位置可信，速度未知
      covariance: [[measurement_noise.max(EPSILON), 0.0], [0.0, 100.0]],
      process_noise,
      measurement_noise: measurement_noise.max(EPSILON),
    }
  }

  /// P = F P Fᵀ + Q，Q 为离散白噪声加速度模型
  pub fn predict(&mut self, dt: f32) {
    let dt = if dt <= 0.0 { 1.0 } else { dt };
    self.state[0] += self.state[1] * dt;

    let [[p00, p01], [p10, p11]] = self.covariance;
    let q = self.process_noise;
    let (dt2, dt3, dt4) = (dt * dt, dt * dt * dt, dt * dt * dt * dt);

    self.covariance[0][0] = p00 + dt * (p10 + p01) + dt2 * p11 + q * dt4 / 4.0;
    self.covariance[0][1] = p01 + dt * p11 + q * dt3 / 2.0;
    self.covariance[1][0] = p10 + dt * p11 + q * dt3 / 2.0;
    self.covariance[1][1] = p11 + q * dt2;
  }

  pub fn correct(&mut self, measurement: f32) {
    let innovation = measurement - self.state[0];
    let s = self.covariance[0][0] + self.measurement_noise;
    if s.abs() < EPSILON {
      return;
    }
    let k0 = self.covariance[0][0] / s;
    let k1 = self.covariance[1][0] / s;

    self.state[0] += k0 * innovation;
    self.state[1] += k1 * innovation;

    let [[p00, p01], [p10, p11]] = self.covariance;
    self.covariance[0][0] = (1.0 - k0) * p00;
    self.covariance[0][1] = (1.0 - k0) * p01;
    self.covariance[1][0] = p10 - k1 * p00;
    self.covariance[1][1] = p11 - k1 * p01;
  }

  pub fn position(&self) -> f32 {
    self.state[0]
  }

  pub fn velocity(&self) -> f32 {
    self.state[1]
  }
}

#[derive(Debug, Clone)]
pub struct Kalman2D {
  x: Kalman1D,
  y: Kalman1D,
}

impl Kalman2D {
  pub fn new(center: Point, process_noise: f32, measurement_noise: f32) -> Self {
    Self {
      x: Kalman1D::new(center.x, process_noise, measurement_noise),
      y: Kalman1D::new(center.y, process_noise, measurement_noise),
    }
  }

  pub fn predict(&mut self, dt: f32) -> Point {
    self.x.predict(dt);
    self.y.predict(dt);
    self.position()
  }

  pub fn correct(&mut self, measurement: Point) {
    self.x.correct(measurement.x);
    self.y.correct(measurement.y);
  }

  pub fn position(&self) -> Point {
    Point::new(self.x.position(), self.y.position())
  }

  pub fn velocity(&self) -> Point {
    Point::new(self.x.velocity(), self.y.velocity())
  }

  /// 不修改状态，按当前速度外推 `dt`
  pub fn extrapolate(&self, dt: f32) -> Point {
    Point::new(
      self.x.position() + self.x.velocity() * dt,
      self.y.position() + self.y.velocity() * dt,
    )
  }
}
