//! 模型完整状态快照
//!
//! 快照以JSON形式随批次结果提交给调度器，下一批次（可能在另一个Worker上）
//! 从快照恢复后继续仿真。

use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use traffic_core::models::{CarState, JobDefinition, LightPhase};
use traffic_core::{SchedulerError, SchedulerResult, SimTime};

use crate::elements::{Car, QueuedCar};
use crate::model::Model;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSnapshot {
    pub time: SimTime,
    pub next_car_id: u64,
    pub cars: Vec<CarSnapshot>,
    pub traffic_lights: Vec<LightSnapshot>,
    pub endpoints: Vec<EndpointSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CarSnapshot {
    pub id: u64,
    pub road: String,
    pub lane: u32,
    pub position: f64,
    pub speed: f64,
    pub desired_speed: f64,
    pub length: f64,
    pub width: f64,
    pub state: CarState,
    pub blinker: i8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blinker_since: Option<SimTime>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LightSnapshot {
    pub id: String,
    pub phase: LightPhase,
    pub last_switch_time: SimTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSnapshot {
    pub id: String,
    pub last_generation_time: SimTime,
    #[serde(default)]
    pub queue: Vec<QueuedCar>,
}

impl ModelSnapshot {
    pub fn to_value(&self) -> SchedulerResult<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: Value) -> SchedulerResult<Self> {
        serde_json::from_value(value)
            .map_err(|e| SchedulerError::Serialization(format!("无法解析模型快照: {e}")))
    }
}

impl Model {
    pub fn snapshot(&self) -> ModelSnapshot {
        ModelSnapshot {
            time: self.time,
            next_car_id: self.next_car_id,
            cars: self
                .cars
                .iter()
                .map(|c| CarSnapshot {
                    id: c.id,
                    road: self.roads[c.road].id.clone(),
                    lane: c.lane,
                    position: c.position,
                    speed: c.speed,
                    desired_speed: c.desired_speed,
                    length: c.length,
                    width: c.width,
                    state: c.state,
                    blinker: c.blinker,
                    blinker_since: c.blinker_since,
                })
                .collect(),
            traffic_lights: self
                .lights
                .iter()
                .map(|l| LightSnapshot {
                    id: l.id.clone(),
                    phase: l.phase,
                    last_switch_time: l.last_switch,
                })
                .collect(),
            endpoints: self
                .endpoints
                .iter()
                .map(|e| EndpointSnapshot {
                    id: e.id.clone(),
                    last_generation_time: e.last_generation,
                    queue: e.queue.iter().cloned().collect(),
                })
                .collect(),
        }
    }

    /// 依据定义重建静态结构，再用快照覆盖所有动态状态
    pub fn from_snapshot(
        definition: &JobDefinition,
        snapshot: &ModelSnapshot,
        rng: ChaCha8Rng,
    ) -> SchedulerResult<Self> {
        let mut model = Model::new(definition, rng)?;
        model.time = snapshot.time;
        model.next_car_id = snapshot.next_car_id;

        for ls in &snapshot.traffic_lights {
            let light = model
                .lights
                .iter_mut()
                .find(|l| l.id == ls.id)
                .ok_or_else(|| {
                    SchedulerError::invalid_definition(format!("快照中的信号灯 {} 不存在", ls.id))
                })?;
            light.phase = ls.phase;
            light.last_switch = ls.last_switch_time;
        }

        for es in &snapshot.endpoints {
            let endpoint = model
                .endpoints
                .iter_mut()
                .find(|e| e.id == es.id)
                .ok_or_else(|| {
                    SchedulerError::invalid_definition(format!("快照中的端点 {} 不存在", es.id))
                })?;
            endpoint.last_generation = es.last_generation_time;
            endpoint.queue = es.queue.iter().cloned().collect();
        }

        let mut cars = Vec::with_capacity(snapshot.cars.len());
        for cs in &snapshot.cars {
            let road = model.road_by_id(&cs.road).ok_or_else(|| {
                SchedulerError::invalid_definition(format!(
                    "快照中车辆 {} 所在道路 {} 不存在",
                    cs.id, cs.road
                ))
            })?;
            if cs.lane >= model.roads[road].lanes {
                return Err(SchedulerError::invalid_definition(format!(
                    "快照中车辆 {} 的车道 {} 超出道路 {} 的车道数",
                    cs.id, cs.lane, cs.road
                )));
            }
            cars.push(Car {
                id: cs.id,
                road,
                lane: cs.lane,
                position: cs.position,
                speed: cs.speed,
                desired_speed: cs.desired_speed,
                length: cs.length,
                width: cs.width,
                state: cs.state,
                blinker: cs.blinker,
                blinker_since: cs.blinker_since,
            });
        }
        model.cars = cars;
        Ok(model)
    }
}
