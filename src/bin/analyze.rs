// 该文件是 Jingmai （静脉追踪） 项目的一部分。
// src/bin/analyze.rs - 命令行分析工具
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

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use tracing::{info, warn};
use url::Url;

use jingmai::{
  FromUrl,
  detect::Algorithm,
  frame::{Point, Roi},
  input::VideoHandle,
  output::OutputWrapper,
  settings::DetectionSettings,
  task::{TaskOrchestrator, TaskRequest, TaskState},
};

fn parse_numbers<const N: usize>(s: &str) -> Result<[f32; N], String> {
  let values: Vec<f32> = s
    .split(',')
    .map(|v| v.trim().parse::<f32>().map_err(|e| format!("{}: {}", v, e)))
    .collect::<Result<_, _>>()?;
  values
    .try_into()
    .map_err(|_| format!("需要 {} 个以逗号分隔的数值", N))
}

fn parse_roi(s: &str) -> Result<Roi, String> {
  let [x, y, w, h] = parse_numbers::<4>(s)?;
  if x < 0.0 || y < 0.0 || w <= 0.0 || h <= 0.0 {
    return Err("ROI 坐标不能为负，宽高必须为正".to_string());
  }
  Ok(Roi::new(x as u32, y as u32, w as u32, h as u32))
}

fn parse_point(s: &str) -> Result<Point, String> {
  let [x, y] = parse_numbers::<2>(s)?;
  Ok(Point::new(x, y))
}

/// 超声视频静脉检测与 ROI 跟踪
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 输入视频（`gst://file/...` 或 `frames:///dir?fps=25`）
  #[arg(long, value_name = "SOURCE")]
  pub input: String,
  /// 检测算法，未指定时使用参数文件中的算法
  #[arg(long, value_name = "ALGORITHM")]
  pub algorithm: Option<Algorithm>,
  /// JSON 参数文件
  #[arg(long, value_name = "FILE")]
  pub settings: Option<PathBuf>,
  /// 分割模型（`onnx:///path/model.onnx`）
  #[arg(long, value_name = "MODEL")]
  pub model: Option<String>,
  /// 初始 ROI：x,y,w,h
  #[arg(long, value_parser = parse_roi, value_name = "X,Y,W,H")]
  pub roi: Option<Roi>,
  /// 用户选中的点：x,y
  #[arg(long, value_parser = parse_point, value_name = "X,Y")]
  pub point: Option<Point>,
  /// 抽帧帧率
  #[arg(long, value_name = "FPS")]
  pub target_fps: Option<f64>,
  /// 逐帧输出（`folder:///dir` 或 `log:`）
  #[arg(long, value_name = "OUTPUT")]
  pub output: Option<Url>,
  /// 结果报告 JSON 路径
  #[arg(long, value_name = "FILE")]
  pub report: Option<PathBuf>,
}

fn load_settings(args: &Args) -> Result<DetectionSettings> {
  let mut settings = match &args.settings {
    Some(path) => {
      let text = std::fs::read_to_string(path)
        .with_context(|| format!("无法读取参数文件: {}", path.display()))?;
      serde_json::from_str(&text)
        .with_context(|| format!("参数文件格式错误: {}", path.display()))?
    }
    None => DetectionSettings::default(),
  };
  if let Some(algorithm) = args.algorithm {
    settings.algorithm = algorithm;
  }
  if let Some(fps) = args.target_fps {
    settings.target_fps = fps;
  }
  if let Some(model) = &args.model {
    settings.learned.model = Some(model.clone());
  }
  Ok(settings)
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();
  info!("输入来源: {}", args.input);

  let settings = load_settings(&args)?;
  let orchestrator = Arc::new(TaskOrchestrator::new(settings)?);

  let mut request = TaskRequest::new(VideoHandle::Url(args.input.clone()));
  if let Some(roi) = args.roi {
    request = request.with_roi(roi);
  }
  if let Some(point) = args.point {
    request = request.with_selected_point(point);
  }
  if let Some(url) = &args.output {
    info!("输出路径: {}", url);
    request = request.with_output(OutputWrapper::from_url(url)?);
  }

  let id = orchestrator.submit(request)?.id;
  info!("任务已提交: {}", id);

  {
    let orchestrator = Arc::clone(&orchestrator);
    ctrlc::set_handler(move || {
      info!("收到中断信号，取消任务...");
      let _ = orchestrator.cancel(id);
      thread::spawn(|| {
        thread::sleep(Duration::from_secs(30));
        warn!("强制退出程序");
        std::process::exit(1);
      });
    })
    .context("无法设置 Ctrl-C 处理函数")?;
  }

  loop {
    let status = orchestrator.status(id)?;
    if status.state.is_terminal() {
      break;
    }
    let progress = status.progress;
    info!(
      "进度 {}/{} ({:.1}%)，预计剩余 {}",
      progress.processed,
      progress.total,
      progress.percentage,
      progress
        .eta_secs
        .map(|s| format!("{:.1}s", s))
        .unwrap_or_else(|| "未知".to_string())
    );
    thread::sleep(Duration::from_millis(500));
  }

  let status = orchestrator.wait(id)?;
  for warning in &status.warnings {
    warn!("{:?}: {}", warning.kind, warning.message);
  }
  let results = orchestrator.results(id)?;
  let summary = results.report.summary;
  info!(
    "任务结束: {:?}，{} 帧，{} 个区域，平均置信度 {:.2}，跳过损坏帧 {}",
    status.state,
    summary.frames,
    summary.regions_found,
    summary.mean_confidence,
    results.report.corrupt_frames
  );
  let movement = &results.report.trajectory.movement;
  info!(
    "ROI 移动 {} 次，稳定率 {:.2}，漂移率 {:.2}",
    movement.total_movements, movement.stability_rate, movement.drift_rate
  );

  if let Some(path) = &args.report {
    let file = std::fs::File::create(path)
      .with_context(|| format!("无法创建报告文件: {}", path.display()))?;
    serde_json::to_writer_pretty(std::io::BufWriter::new(file), &results)?;
    info!("报告已写入: {}", path.display());
  }

  match status.state {
    TaskState::Failed => {
      let failure = status
        .failure
        .map(|f| format!("{:?}: {}", f.kind, f.message))
        .unwrap_or_default();
      Err(anyhow!("任务失败 {}", failure))
    }
    _ => Ok(()),
  }
}
