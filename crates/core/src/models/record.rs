use serde::{Deserialize, Serialize};

use super::definition::LightPhase;
use crate::time::SimTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CarState {
    /// 本步刚进入道路
    Add,
    Active,
    /// 本步驶出道路，记录后即从模型移除
    Del,
}

impl CarState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CarState::Add => "add",
            CarState::Active => "active",
            CarState::Del => "del",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "add" => Some(CarState::Add),
            "active" => Some(CarState::Active),
            "del" => Some(CarState::Del),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CarRecord {
    pub id: u64,
    pub road: String,
    pub lane: u32,
    pub position: f64,
    pub speed: f64,
    pub desired_speed: f64,
    pub length: f64,
    pub width: f64,
    pub state: CarState,
    /// -1 左转向灯，1 右转向灯，0 关闭
    #[serde(default)]
    pub blinker: i8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LightRecord {
    pub id: String,
    pub road: String,
    pub position: f64,
    pub phase: LightPhase,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueRecord {
    pub endpoint: String,
    pub length: u32,
}

/// 单个仿真步结束时的状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub time: SimTime,
    pub cars: Vec<CarRecord>,
    #[serde(default)]
    pub lights: Vec<LightRecord>,
    #[serde(default)]
    pub queues: Vec<QueueRecord>,
}

/// 某辆车按时间排序的轨迹点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackPoint {
    pub time: SimTime,
    pub road: String,
    pub lane: u32,
    pub position: f64,
    pub speed: f64,
    pub state: CarState,
}

impl TrackPoint {
    pub fn from_record(time: SimTime, car: &CarRecord) -> Self {
        Self {
            time,
            road: car.road.clone(),
            lane: car.lane,
            position: car.position,
            speed: car.speed,
            state: car.state,
        }
    }
}
