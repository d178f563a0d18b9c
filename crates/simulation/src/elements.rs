//! 模型中的静态与动态元素
//!
//! 道路、信号灯和端点存放在 [`crate::Model`] 持有的扁平集合里，
//! 互相之间只通过下标引用，不存在反向指针。

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use traffic_core::models::{CarRecord, CarState, LightPhase};
use traffic_core::SimTime;

#[derive(Debug, Clone)]
pub struct Road {
    pub id: String,
    pub length: f64,
    pub width: f64,
    pub lanes: u32,
}

#[derive(Debug, Clone)]
pub struct TrafficLight {
    pub id: String,
    pub road: usize,
    pub position: f64,
    pub green: SimTime,
    pub red: SimTime,
    pub phase: LightPhase,
    pub last_switch: SimTime,
}

impl TrafficLight {
    pub fn is_green(&self) -> bool {
        self.phase == LightPhase::Green
    }

    pub fn next_switch(&self) -> SimTime {
        let duration = match self.phase {
            LightPhase::Green => self.green,
            LightPhase::Red => self.red,
        };
        self.last_switch + duration
    }

    /// 切换相位并记录仿真时间（而非真实时间），保证可重放
    pub fn switch(&mut self, at: SimTime) {
        self.phase = self.phase.flipped();
        self.last_switch = at;
    }
}

/// 端点排队等待进入道路的车辆
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedCar {
    pub id: u64,
    pub desired_speed: f64,
    pub lane: u32,
    pub length: f64,
    pub width: f64,
}

#[derive(Debug, Clone)]
pub struct Endpoint {
    pub id: String,
    pub road: Option<usize>,
    /// 生成间隔 `3600 / inputRate` 秒；非入口端点为空
    pub interval: Option<SimTime>,
    pub queue: VecDeque<QueuedCar>,
    pub last_generation: SimTime,
}

impl Endpoint {
    /// `lastGeneration + k·interval <= now` 的 k 的个数，并返回推进后的生成时间
    pub fn due_cars(&self, now: SimTime) -> (u64, SimTime) {
        let Some(interval) = self.interval else {
            return (0, self.last_generation);
        };
        if self.last_generation > now {
            return (0, self.last_generation);
        }
        let elapsed = (now - self.last_generation).as_micros();
        let count = (elapsed / interval.as_micros()) as u64 + 1;
        (count, self.last_generation + interval.times(count))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Car {
    pub id: u64,
    pub road: usize,
    pub lane: u32,
    pub position: f64,
    pub speed: f64,
    pub desired_speed: f64,
    pub length: f64,
    pub width: f64,
    pub state: CarState,
    pub blinker: i8,
    /// 当前转向灯开始闪烁的时刻
    pub blinker_since: Option<SimTime>,
}

impl Car {
    pub fn rear(&self) -> f64 {
        self.position - self.length
    }

    pub fn to_record(&self, road: &Road) -> CarRecord {
        CarRecord {
            id: self.id,
            road: road.id.clone(),
            lane: self.lane,
            position: self.position,
            speed: self.speed,
            desired_speed: self.desired_speed,
            length: self.length,
            width: self.width,
            state: self.state,
            blinker: self.blinker,
        }
    }
}
