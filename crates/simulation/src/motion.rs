//! 车辆运动：准备阶段与提交阶段
//!
//! 准备阶段中每辆车只读取上一步的全部车辆状态做决策，结果写入 [`PreparedMove`]；
//! 提交阶段统一应用所有决策，并消除同一车道内的重叠。

use std::collections::BTreeMap;

use traffic_core::models::{CarState, ModelParameters};
use traffic_core::{SchedulerError, SchedulerResult, SimTime};

use crate::elements::{Car, Road, TrafficLight};

/// 自身车道查找前车时的起点偏移，避免把自己当作前车
const OWN_LANE_LOOKAHEAD: f64 = 0.1;

#[derive(Debug, Clone, PartialEq)]
pub struct PreparedMove {
    pub lane: u32,
    pub position: f64,
    pub speed: f64,
    pub blinker: i8,
    pub blinker_since: Option<SimTime>,
    pub deleted: bool,
}

impl PreparedMove {
    /// 本步不移动（例如刚进入道路的车辆）
    pub fn stay(car: &Car) -> Self {
        Self {
            lane: car.lane,
            position: car.position,
            speed: car.speed,
            blinker: car.blinker,
            blinker_since: car.blinker_since,
            deleted: false,
        }
    }
}

pub struct StepContext<'a> {
    pub cars: &'a [Car],
    pub roads: &'a [Road],
    pub lights: &'a [TrafficLight],
    pub params: &'a ModelParameters,
    /// 步开始时的仿真时间
    pub now: SimTime,
    /// 步长（秒）
    pub dt: f64,
}

impl StepContext<'_> {
    fn braking_distance(&self, car: &Car) -> f64 {
        car.speed * car.speed / (2.0 * self.params.comfort_braking_limit)
            + self.params.minimal_distance
    }

    /// 前方最近的信号灯，仅在红灯时返回距离
    fn red_light_distance(&self, car: &Car) -> Option<f64> {
        let start = car.position + OWN_LANE_LOOKAHEAD;
        self.lights
            .iter()
            .filter(|l| l.road == car.road && l.position >= start)
            .min_by(|a, b| a.position.total_cmp(&b.position))
            .filter(|l| !l.is_green())
            .map(|l| l.position - car.position)
    }

    /// 车辆是否占据或正在并入指定车道
    fn occupies(other: &Car, lane: u32, include_converging: bool) -> bool {
        if other.lane == lane {
            return true;
        }
        include_converging
            && other.blinker != 0
            && other.lane as i64 + other.blinker as i64 == lane as i64
    }

    /// 到指定车道前车的距离（含前车本步按当前速度的预计位移）
    fn leader_distance(&self, index: usize, lane: u32) -> Option<f64> {
        let car = &self.cars[index];
        let own_lane = lane == car.lane;
        let start = if own_lane {
            car.position + OWN_LANE_LOOKAHEAD
        } else {
            car.position
        };
        self.cars
            .iter()
            .enumerate()
            .filter(|(j, other)| {
                *j != index
                    && other.road == car.road
                    && other.state != CarState::Del
                    && Self::occupies(other, lane, !own_lane)
                    && other.position >= start
            })
            .map(|(_, other)| other)
            .min_by(|a, b| a.position.total_cmp(&b.position))
            .map(|leader| leader.rear() - car.position + leader.speed * self.dt)
    }

    /// 目标车道后方是否有足够的安全距离
    fn rear_gap_holds(&self, index: usize, lane: u32) -> bool {
        let car = &self.cars[index];
        let follower = self
            .cars
            .iter()
            .enumerate()
            .filter(|(j, other)| {
                *j != index
                    && other.road == car.road
                    && other.state != CarState::Del
                    && Self::occupies(other, lane, true)
                    && other.position <= car.position
            })
            .map(|(_, other)| other)
            .max_by(|a, b| a.position.total_cmp(&b.position));
        match follower {
            Some(f) => (car.position - f.position) - car.length >= self.params.safe_distance_rear,
            None => true,
        }
    }

    /// 相邻车道可达距离；被红灯截断或后方间距不足时返回 `None`
    fn candidate_distance(&self, index: usize, lane: u32, red_light: Option<f64>) -> Option<f64> {
        let distance = self
            .leader_distance(index, lane)
            .unwrap_or(f64::INFINITY);
        if let Some(tl) = red_light {
            if tl < distance {
                return None;
            }
        }
        if !self.rear_gap_holds(index, lane) {
            return None;
        }
        Some(distance)
    }

    pub fn prepare(&self, index: usize) -> SchedulerResult<PreparedMove> {
        let car = &self.cars[index];
        let road = &self.roads[car.road];
        let p = self.params;
        let t = self.dt;

        let braking = self.braking_distance(car);
        let step_speed = car.desired_speed.min(car.speed + p.acceleration_limit * t);
        let desired_distance = (car.speed + step_speed) / 2.0 * t;

        let red_light = self.red_light_distance(car);
        let mut leader = self.leader_distance(index, car.lane);
        // 红灯在前车之前时，前车不构成约束
        if let (Some(tl), Some(ld)) = (red_light, leader) {
            if tl < ld {
                leader = None;
            }
        }

        let mut lane = car.lane;
        let mut final_distance = leader.or(red_light).unwrap_or(f64::INFINITY);
        let mut blinker = 0i8;
        let mut blinker_since = None;

        if let Some(own) = leader.filter(|d| road.lanes > 1 && *d <= braking) {
            let mut best = (car.lane, own);
            // 距离相同时优先左侧车道
            if car.lane > 0 {
                if let Some(d) = self.candidate_distance(index, car.lane - 1, red_light) {
                    if d > best.1 {
                        best = (car.lane - 1, d);
                    }
                }
            }
            if car.lane + 1 < road.lanes {
                if let Some(d) = self.candidate_distance(index, car.lane + 1, red_light) {
                    if d > best.1 {
                        best = (car.lane + 1, d);
                    }
                }
            }

            if best.0 != car.lane {
                let direction: i8 = if best.0 < car.lane { -1 } else { 1 };
                let signalled_long_enough = p.line_changing_delay <= 0.0
                    || (car.blinker == direction
                        && car.blinker_since.is_some_and(|since| {
                            (self.now - since).as_secs_f64() + 1e-9 >= p.line_changing_delay
                        }));
                if signalled_long_enough {
                    lane = best.0;
                    final_distance = best.1;
                } else {
                    blinker = direction;
                    blinker_since = if car.blinker == direction {
                        car.blinker_since
                    } else {
                        Some(self.now)
                    };
                    final_distance = own;
                }
            } else {
                final_distance = own;
            }
        }

        let (speed, distance) = if final_distance <= braking {
            let allowed = final_distance - p.minimal_distance;
            if allowed > 0.0 {
                let decel = (car.speed * car.speed / (2.0 * allowed)).min(p.braking_limit);
                let speed = (car.speed - decel * t).max(0.0);
                let distance = if decel > 0.0 && car.speed / decel < t {
                    car.speed * car.speed / (2.0 * decel)
                } else {
                    car.speed * t - decel * t * t / 2.0
                };
                (speed, distance.clamp(0.0, allowed))
            } else {
                (0.0, 0.0)
            }
        } else {
            let cap = (final_distance - p.minimal_distance).max(0.0);
            (step_speed, desired_distance.min(cap))
        };

        if !distance.is_finite() || distance < 0.0 || !speed.is_finite() || speed < 0.0 {
            return Err(SchedulerError::invariant(format!(
                "车辆 {} 的位移非法: distance={distance}, speed={speed}",
                car.id
            )));
        }

        let position = car.position + distance;
        Ok(PreparedMove {
            lane,
            position,
            speed,
            blinker,
            blinker_since,
            deleted: position > road.length,
        })
    }
}

/// 消除同一车道内的车身重叠
///
/// 按准备后的位置排序，后车与前车重叠时将后车回退到前车车尾之后
/// `minimalDistance` 处，但不会低于其旧位置；无法回退时撤销造成冲突的变道，
/// 然后重新检查，直到稳定。
pub fn resolve_overlaps(
    cars: &[Car],
    moves: &mut [PreparedMove],
    minimal_distance: f64,
) -> SchedulerResult<()> {
    let max_rounds = cars.len() * 2 + 4;
    for _ in 0..max_rounds {
        let mut lanes: BTreeMap<(usize, u32), Vec<usize>> = BTreeMap::new();
        for (i, car) in cars.iter().enumerate() {
            lanes.entry((car.road, moves[i].lane)).or_default().push(i);
        }

        let mut changed = false;
        for members in lanes.values_mut() {
            members.sort_by(|&a, &b| {
                moves[b]
                    .position
                    .total_cmp(&moves[a].position)
                    .then(cars[b].position.total_cmp(&cars[a].position))
                    .then(cars[a].id.cmp(&cars[b].id))
            });
            for pair in members.windows(2) {
                let (leader, follower) = (pair[0], pair[1]);
                let leader_rear = moves[leader].position - cars[leader].length;
                if moves[follower].position < leader_rear {
                    continue;
                }

                let stayed = moves[follower].lane == cars[follower].lane;
                if stayed && cars[follower].position < leader_rear {
                    let target = (leader_rear - minimal_distance).max(cars[follower].position);
                    let leader_speed = moves[leader].speed;
                    let m = &mut moves[follower];
                    m.position = target.min(m.position);
                    m.speed = m.speed.min(leader_speed);
                    changed = true;
                    break;
                }

                let offender = if !stayed {
                    follower
                } else if moves[leader].lane != cars[leader].lane {
                    leader
                } else {
                    return Err(SchedulerError::invariant(format!(
                        "车辆 {} 与 {} 在同一车道重叠且无法消除",
                        cars[follower].id, cars[leader].id
                    )));
                };
                let car = &cars[offender];
                let m = &mut moves[offender];
                m.blinker = if m.lane < car.lane { -1 } else { 1 };
                m.blinker_since = car.blinker_since;
                m.lane = car.lane;
                changed = true;
                break;
            }
            if changed {
                break;
            }
        }

        if !changed {
            return Ok(());
        }
    }
    Err(SchedulerError::invariant("车道冲突消解未收敛"))
}
