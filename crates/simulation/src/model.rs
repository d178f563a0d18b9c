use std::collections::{HashMap, VecDeque};

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, trace};

use traffic_core::models::{
    CarState, JobDefinition, LightPhase, LightRecord, ModelParameters, QueueRecord, StepRecord,
};
use traffic_core::{SchedulerError, SchedulerResult, SimTime};

use crate::elements::{Car, Endpoint, QueuedCar, Road, TrafficLight};
use crate::motion::{resolve_overlaps, PreparedMove, StepContext};

/// 交通模型
///
/// 道路、端点和信号灯存放在扁平集合中，按下标互相引用；
/// 车辆生成使用注入的随机源，以便测试和续跑时精确重放。
pub struct Model {
    pub(crate) params: ModelParameters,
    pub(crate) roads: Vec<Road>,
    pub(crate) road_index: HashMap<String, usize>,
    pub(crate) endpoints: Vec<Endpoint>,
    pub(crate) lights: Vec<TrafficLight>,
    pub(crate) cars: Vec<Car>,
    pub(crate) time: SimTime,
    pub(crate) next_car_id: u64,
    rng: ChaCha8Rng,
}

impl Model {
    pub fn new(definition: &JobDefinition, mut rng: ChaCha8Rng) -> SchedulerResult<Self> {
        definition.validate()?;

        let roads: Vec<Road> = definition
            .roads
            .iter()
            .map(|r| Road {
                id: r.id.clone(),
                length: r.length,
                width: r.width,
                lanes: r.lanes,
            })
            .collect();
        let road_index: HashMap<String, usize> = roads
            .iter()
            .enumerate()
            .map(|(i, r)| (r.id.clone(), i))
            .collect();
        let lookup = |id: &str| {
            road_index.get(id).copied().ok_or_else(|| {
                SchedulerError::invalid_definition(format!("未知道路: {id}"))
            })
        };

        let mut endpoints = Vec::with_capacity(definition.endpoints.len());
        for e in &definition.endpoints {
            let road = e.road.as_deref().map(lookup).transpose()?;
            let interval = if e.is_entry() {
                let micros = (3_600_000_000f64 / e.input_rate).round() as i64;
                Some(SimTime::from_micros(micros.max(1)))
            } else {
                None
            };
            endpoints.push(Endpoint {
                id: e.id.clone(),
                road,
                interval,
                queue: VecDeque::new(),
                last_generation: SimTime::ZERO,
            });
        }

        let mut lights = Vec::with_capacity(definition.traffic_lights.len());
        for l in &definition.traffic_lights {
            let phase = match l.initial_phase {
                Some(phase) => phase,
                None if rng.random_bool(0.5) => LightPhase::Red,
                None => LightPhase::Green,
            };
            lights.push(TrafficLight {
                id: l.id.clone(),
                road: lookup(&l.road)?,
                position: l.position,
                green: SimTime::try_from_secs_f64(l.green_duration)?,
                red: SimTime::try_from_secs_f64(l.red_duration)?,
                phase,
                last_switch: SimTime::ZERO,
            });
        }

        Ok(Self {
            params: definition.model_parameters.clone(),
            roads,
            road_index,
            endpoints,
            lights,
            cars: Vec::new(),
            time: SimTime::ZERO,
            next_car_id: 0,
            rng,
        })
    }

    pub fn time(&self) -> SimTime {
        self.time
    }

    pub fn cars(&self) -> &[Car] {
        &self.cars
    }

    pub fn lights(&self) -> &[TrafficLight] {
        &self.lights
    }

    /// 已生成的车辆总数
    pub fn generated_cars(&self) -> u64 {
        self.next_car_id
    }

    pub fn queued_cars(&self) -> usize {
        self.endpoints.iter().map(|e| e.queue.len()).sum()
    }

    pub(crate) fn road_by_id(&self, id: &str) -> Option<usize> {
        self.road_index.get(id).copied()
    }

    pub fn set_rng(&mut self, rng: ChaCha8Rng) {
        self.rng = rng;
    }

    /// 推进一步并返回该步结束时的状态记录
    ///
    /// 顺序：信号灯 → 车辆生成 → 入队车辆上路 → 准备 → 提交 → 推进时间。
    /// 本步驶出道路的车辆会出现在记录中（状态 `del`），随后才从模型移除。
    pub fn step(&mut self, dt: SimTime) -> SchedulerResult<StepRecord> {
        if dt <= SimTime::ZERO {
            return Err(SchedulerError::invariant(format!("步长必须为正: {dt}")));
        }
        let new_time = self.time + dt;

        for light in &mut self.lights {
            if new_time > light.next_switch() {
                light.switch(new_time);
                trace!("信号灯 {} 切换为 {:?}", light.id, light.phase);
            }
        }

        self.generate_cars(new_time);

        for car in &mut self.cars {
            if car.state == CarState::Add {
                car.state = CarState::Active;
            }
        }
        let admitted = self.admit_queued_cars();

        let moves = {
            let ctx = StepContext {
                cars: &self.cars,
                roads: &self.roads,
                lights: &self.lights,
                params: &self.params,
                now: self.time,
                dt: dt.as_secs_f64(),
            };
            let mut moves = Vec::with_capacity(self.cars.len());
            for (i, car) in self.cars.iter().enumerate() {
                if car.state == CarState::Add {
                    moves.push(PreparedMove::stay(car));
                } else {
                    moves.push(ctx.prepare(i)?);
                }
            }
            resolve_overlaps(&self.cars, &mut moves, self.params.minimal_distance)?;
            moves
        };

        for (car, m) in self.cars.iter_mut().zip(moves) {
            if m.position < car.position {
                return Err(SchedulerError::invariant(format!(
                    "车辆 {} 后退: {} -> {}",
                    car.id, car.position, m.position
                )));
            }
            car.lane = m.lane;
            car.position = m.position;
            car.speed = m.speed;
            car.blinker = m.blinker;
            car.blinker_since = m.blinker_since;
            if m.deleted {
                car.state = CarState::Del;
            }
        }

        self.time = new_time;
        let record = self.record();
        let removed = self.cars.len();
        self.cars.retain(|c| c.state != CarState::Del);
        let removed = removed - self.cars.len();
        if admitted > 0 || removed > 0 {
            debug!(
                "t={} 上路 {} 辆，驶出 {} 辆，在途 {} 辆",
                self.time,
                admitted,
                removed,
                self.cars.len()
            );
        }
        Ok(record)
    }

    fn generate_cars(&mut self, now: SimTime) {
        let params = &self.params;
        for endpoint in &mut self.endpoints {
            let Some(road) = endpoint.road else { continue };
            let (count, last) = endpoint.due_cars(now);
            let lanes = self.roads[road].lanes;
            for _ in 0..count {
                let desired_speed = if params.max_speed > params.min_speed {
                    self.rng.random_range(params.min_speed..params.max_speed)
                } else {
                    params.min_speed
                };
                let lane = self.rng.random_range(0..lanes);
                endpoint.queue.push_back(QueuedCar {
                    id: self.next_car_id,
                    desired_speed,
                    lane,
                    length: params.car_length,
                    width: params.car_width,
                });
                self.next_car_id += 1;
            }
            endpoint.last_generation = last;
        }
    }

    fn lane_is_free(&self, road: usize, lane: u32) -> bool {
        self.cars
            .iter()
            .filter(|c| c.road == road && c.lane == lane && c.state != CarState::Del)
            .min_by(|a, b| a.position.total_cmp(&b.position))
            .is_none_or(|last| last.rear() > self.params.safe_distance)
    }

    /// 将各端点队首车辆放上道路，优先其预选车道，其次按车道下标从小到大尝试
    fn admit_queued_cars(&mut self) -> usize {
        let mut admitted = 0;
        for e in 0..self.endpoints.len() {
            let Some(road) = self.endpoints[e].road else { continue };
            let lanes = self.roads[road].lanes;
            while let Some(head) = self.endpoints[e].queue.front() {
                let preferred = head.lane.min(lanes - 1);
                let lane = if self.lane_is_free(road, preferred) {
                    Some(preferred)
                } else {
                    (0..lanes).find(|l| self.lane_is_free(road, *l))
                };
                let Some(lane) = lane else { break };
                let Some(queued) = self.endpoints[e].queue.pop_front() else { break };
                self.cars.push(Car {
                    id: queued.id,
                    road,
                    lane,
                    position: 0.0,
                    speed: 0.0,
                    desired_speed: queued.desired_speed,
                    length: queued.length,
                    width: queued.width,
                    state: CarState::Add,
                    blinker: 0,
                    blinker_since: None,
                });
                admitted += 1;
            }
        }
        admitted
    }

    /// 当前状态的记录
    pub fn record(&self) -> StepRecord {
        StepRecord {
            time: self.time,
            cars: self
                .cars
                .iter()
                .map(|c| c.to_record(&self.roads[c.road]))
                .collect(),
            lights: self
                .lights
                .iter()
                .map(|l| LightRecord {
                    id: l.id.clone(),
                    road: self.roads[l.road].id.clone(),
                    position: l.position,
                    phase: l.phase,
                })
                .collect(),
            queues: self
                .endpoints
                .iter()
                .filter(|e| e.interval.is_some())
                .map(|e| QueueRecord {
                    endpoint: e.id.clone(),
                    length: e.queue.len() as u32,
                })
                .collect(),
        }
    }
}
