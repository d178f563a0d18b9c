//! 单机运行整个作业，把逐步状态写入本地文件
//!
//! 与分布式执行走同一套批次逻辑：每个批次结束后只保留快照，
//! 下一批次从快照恢复。

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Serialize;
use serde_json::Value;
use tracing::info;

use traffic_core::models::{CarState, JobDefinition, StepRecord};
use traffic_core::{SchedulerError, SchedulerResult, SimTime};

use crate::batch::run_batch;
use crate::random::RandomSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Csv,
    JsonLines,
}

impl OutputFormat {
    fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Csv => "csv",
            OutputFormat::JsonLines => "jsonl",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "csv" => Ok(OutputFormat::Csv),
            "json" | "jsonl" => Ok(OutputFormat::JsonLines),
            other => Err(SchedulerError::InvalidParams(format!(
                "不支持的输出格式: {other}"
            ))),
        }
    }
}

/// 每辆车的汇总信息，写入 cars 文件
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CarSummary {
    pub id: u64,
    pub desired_speed: f64,
    pub length: f64,
    pub width: f64,
    pub added: SimTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub removed: Option<SimTime>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OfflineSummary {
    pub steps: u64,
    pub final_time: SimTime,
    pub cars_seen: usize,
    pub finished_cars: usize,
    pub states_path: PathBuf,
    pub cars_path: PathBuf,
}

fn io_error(path: &Path, e: std::io::Error) -> SchedulerError {
    SchedulerError::Internal(format!("写入 {} 失败: {e}", path.display()))
}

struct StatesWriter {
    path: PathBuf,
    format: OutputFormat,
    out: BufWriter<File>,
}

impl StatesWriter {
    fn create(dir: &Path, format: OutputFormat) -> SchedulerResult<Self> {
        let path = dir.join(format!("states.{}", format.extension()));
        let file = File::create(&path).map_err(|e| io_error(&path, e))?;
        let mut writer = Self {
            path,
            format,
            out: BufWriter::new(file),
        };
        if format == OutputFormat::Csv {
            writer.line("time,car_id,road,lane,position,speed,desired_speed,state,blinker")?;
        }
        Ok(writer)
    }

    fn line(&mut self, line: &str) -> SchedulerResult<()> {
        writeln!(self.out, "{line}").map_err(|e| io_error(&self.path, e))
    }

    fn write(&mut self, record: &StepRecord) -> SchedulerResult<()> {
        match self.format {
            OutputFormat::JsonLines => {
                let line = serde_json::to_string(record)?;
                self.line(&line)
            }
            OutputFormat::Csv => {
                let time = record.time.as_secs_f64();
                for car in &record.cars {
                    let line = format!(
                        "{time:.6},{},{},{},{:.4},{:.4},{:.4},{},{}",
                        car.id,
                        car.road,
                        car.lane,
                        car.position,
                        car.speed,
                        car.desired_speed,
                        car.state.as_str(),
                        car.blinker
                    );
                    self.line(&line)?;
                }
                Ok(())
            }
        }
    }

    fn finish(mut self) -> SchedulerResult<PathBuf> {
        self.out.flush().map_err(|e| io_error(&self.path, e))?;
        Ok(self.path)
    }
}

fn write_cars(
    dir: &Path,
    format: OutputFormat,
    cars: &BTreeMap<u64, CarSummary>,
) -> SchedulerResult<PathBuf> {
    let path = dir.join(format!("cars.{}", format.extension()));
    let file = File::create(&path).map_err(|e| io_error(&path, e))?;
    let mut out = BufWriter::new(file);
    let mut write_line =
        |line: String| writeln!(out, "{line}").map_err(|e| io_error(&path, e));

    if format == OutputFormat::Csv {
        write_line("car_id,desired_speed,length,width,added,removed".to_string())?;
    }
    for car in cars.values() {
        let line = match format {
            OutputFormat::JsonLines => serde_json::to_string(car)?,
            OutputFormat::Csv => format!(
                "{},{:.4},{},{},{:.6},{}",
                car.id,
                car.desired_speed,
                car.length,
                car.width,
                car.added.as_secs_f64(),
                car.removed
                    .map(|t| format!("{:.6}", t.as_secs_f64()))
                    .unwrap_or_default()
            ),
        };
        write_line(line)?;
    }
    out.flush().map_err(|e| io_error(&path, e))?;
    Ok(path)
}

/// 运行整个作业并写出 `states.*` 与 `cars.*`
pub fn run_offline(
    definition: &JobDefinition,
    out_dir: &Path,
    format: OutputFormat,
    random: &RandomSource,
) -> SchedulerResult<OfflineSummary> {
    definition.validate()?;
    fs::create_dir_all(out_dir).map_err(|e| io_error(out_dir, e))?;

    let total = definition.total_steps()?;
    let batch_length = definition.simulation_parameters.batch_length;
    let mut states = StatesWriter::create(out_dir, format)?;
    let mut cars: BTreeMap<u64, CarSummary> = BTreeMap::new();

    let mut done = 0;
    let mut snapshot: Option<Value> = None;
    let mut final_time = SimTime::ZERO;
    while done < total {
        let batch = run_batch(definition, snapshot.as_ref(), done, total, batch_length, random)?;
        for record in &batch.records {
            for car in &record.cars {
                let entry = cars.entry(car.id).or_insert_with(|| CarSummary {
                    id: car.id,
                    desired_speed: car.desired_speed,
                    length: car.length,
                    width: car.width,
                    added: record.time,
                    removed: None,
                });
                if car.state == CarState::Del {
                    entry.removed = Some(record.time);
                }
            }
            states.write(record)?;
        }
        done += batch.steps_done;
        final_time = batch.final_time;
        snapshot = Some(batch.snapshot.to_value()?);
    }

    let states_path = states.finish()?;
    let cars_path = write_cars(out_dir, format, &cars)?;
    let finished_cars = cars.values().filter(|c| c.removed.is_some()).count();
    info!(
        "离线仿真完成: {} 步，{} 辆车，{} 辆驶出，输出目录 {}",
        done,
        cars.len(),
        finished_cars,
        out_dir.display()
    );

    Ok(OfflineSummary {
        steps: done,
        final_time,
        cars_seen: cars.len(),
        finished_cars,
        states_path,
        cars_path,
    })
}
