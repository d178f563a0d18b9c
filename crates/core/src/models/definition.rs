use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::time::SimTime;
use crate::{SchedulerError, SchedulerResult};

/// 作业定义
///
/// 一次仿真运行的不可变参数：仿真时长、步长、批大小、道路拓扑、
/// 信号灯与车辆生成速率。字段名与 JSON/TOML 输入文件保持 camelCase。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDefinition {
    pub simulation_parameters: SimulationParameters,
    #[serde(default)]
    pub model_parameters: ModelParameters,
    pub roads: Vec<RoadDefinition>,
    #[serde(default)]
    pub endpoints: Vec<EndpointDefinition>,
    #[serde(default)]
    pub crossroads: Vec<CrossroadDefinition>,
    #[serde(default)]
    pub traffic_lights: Vec<TrafficLightDefinition>,
    #[serde(default)]
    pub statistics_parameters: StatisticsParameters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationParameters {
    /// 仿真总时长（秒）
    pub duration: f64,
    /// 单步时长（秒）
    pub step_duration: f64,
    /// 每批步数
    pub batch_length: u64,
    /// 固定随机种子；为空时使用系统熵源
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelParameters {
    pub safe_distance: f64,
    pub safe_distance_rear: f64,
    pub minimal_distance: f64,
    pub acceleration_limit: f64,
    pub braking_limit: f64,
    pub comfort_braking_limit: f64,
    pub line_changing_delay: f64,
    pub min_speed: f64,
    pub max_speed: f64,
    pub car_length: f64,
    pub car_width: f64,
}

impl Default for ModelParameters {
    fn default() -> Self {
        Self {
            safe_distance: 20.0,
            safe_distance_rear: 10.0,
            minimal_distance: 3.0,
            acceleration_limit: 2.0,   // 约13.5秒加速到100km/h
            braking_limit: 6.5,        // 60km/h约21米制动
            comfort_braking_limit: 4.5,
            line_changing_delay: 1.0,
            min_speed: 10.0,
            max_speed: 20.0,
            car_length: 4.5,
            car_width: 1.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoadDefinition {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    pub length: f64,
    #[serde(default = "default_road_width")]
    pub width: f64,
    #[serde(default = "default_lanes")]
    pub lanes: u32,
}

fn default_road_width() -> f64 {
    10.0
}

fn default_lanes() -> u32 {
    1
}

/// 端点：车辆进入或离开模型的位置
///
/// 配置了 `road` 且 `input_rate > 0` 的端点是入口，按该速率（辆/小时）生成车辆。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointDefinition {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub road: Option<String>,
    #[serde(default)]
    pub input_rate: f64,
}

impl EndpointDefinition {
    pub fn is_entry(&self) -> bool {
        self.road.is_some() && self.input_rate > 0.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrossroadDefinition {
    pub id: String,
    #[serde(default)]
    pub traffic_lights: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LightPhase {
    Green,
    Red,
}

impl LightPhase {
    pub fn flipped(self) -> Self {
        match self {
            LightPhase::Green => LightPhase::Red,
            LightPhase::Red => LightPhase::Green,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficLightDefinition {
    pub id: String,
    pub road: String,
    pub position: f64,
    pub green_duration: f64,
    pub red_duration: f64,
    /// 初始相位；为空时由随机源决定
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_phase: Option<LightPhase>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatisticsParameters {
    /// 通行量统计的断面；为空时使用每条道路的起点和终点
    pub throughput_positions: Vec<RoadPosition>,
    /// 低于该速度（m/s）视为停车等待
    pub idle_speed_threshold: f64,
}

impl Default for StatisticsParameters {
    fn default() -> Self {
        Self {
            throughput_positions: Vec::new(),
            idle_speed_threshold: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoadPosition {
    pub road: String,
    pub position: f64,
}

impl JobDefinition {
    pub fn from_json_str(s: &str) -> SchedulerResult<Self> {
        let definition: JobDefinition = serde_json::from_str(s)?;
        definition.validate()?;
        Ok(definition)
    }

    pub fn from_toml_str(s: &str) -> SchedulerResult<Self> {
        let definition: JobDefinition =
            toml::from_str(s).map_err(|e| SchedulerError::Serialization(e.to_string()))?;
        definition.validate()?;
        Ok(definition)
    }

    pub fn step_duration(&self) -> SchedulerResult<SimTime> {
        SimTime::try_from_secs_f64(self.simulation_parameters.step_duration)
    }

    pub fn duration(&self) -> SchedulerResult<SimTime> {
        SimTime::try_from_secs_f64(self.simulation_parameters.duration)
    }

    /// `ceil(duration / stepDuration)`
    pub fn total_steps(&self) -> SchedulerResult<u64> {
        let step = self.step_duration()?.as_micros();
        let duration = self.duration()?.as_micros();
        if step <= 0 {
            return Err(SchedulerError::invalid_definition("stepDuration 必须大于0"));
        }
        Ok(((duration + step - 1) / step) as u64)
    }

    /// `ceil(totalSteps / batchLength)`
    pub fn batches(&self) -> SchedulerResult<u64> {
        let batch = self.simulation_parameters.batch_length;
        if batch == 0 {
            return Err(SchedulerError::invalid_definition("batchLength 必须大于0"));
        }
        Ok(self.total_steps()?.div_ceil(batch))
    }

    pub fn road(&self, id: &str) -> Option<&RoadDefinition> {
        self.roads.iter().find(|r| r.id == id)
    }

    /// 统计断面：配置值或每条道路的起终点
    pub fn throughput_positions(&self) -> Vec<RoadPosition> {
        if !self.statistics_parameters.throughput_positions.is_empty() {
            return self.statistics_parameters.throughput_positions.clone();
        }
        self.roads
            .iter()
            .flat_map(|r| {
                [
                    RoadPosition {
                        road: r.id.clone(),
                        position: 0.0,
                    },
                    RoadPosition {
                        road: r.id.clone(),
                        position: r.length,
                    },
                ]
            })
            .collect()
    }

    pub fn validate(&self) -> SchedulerResult<()> {
        let sim = &self.simulation_parameters;
        if !(sim.duration.is_finite() && sim.duration > 0.0) {
            return Err(SchedulerError::invalid_definition("duration 必须大于0"));
        }
        if !(sim.step_duration.is_finite() && sim.step_duration > 0.0) {
            return Err(SchedulerError::invalid_definition("stepDuration 必须大于0"));
        }
        self.step_duration()?;
        self.duration()?;
        if sim.batch_length == 0 {
            return Err(SchedulerError::invalid_definition("batchLength 必须大于0"));
        }

        let m = &self.model_parameters;
        let positive = [
            ("safeDistance", m.safe_distance),
            ("minimalDistance", m.minimal_distance),
            ("accelerationLimit", m.acceleration_limit),
            ("brakingLimit", m.braking_limit),
            ("comfortBrakingLimit", m.comfort_braking_limit),
            ("carLength", m.car_length),
            ("carWidth", m.car_width),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(SchedulerError::invalid_definition(format!(
                    "{name} 必须是正数: {value}"
                )));
            }
        }
        let non_negative = |v: f64| v.is_finite() && v >= 0.0;
        if !non_negative(m.safe_distance_rear) || !non_negative(m.line_changing_delay) {
            return Err(SchedulerError::invalid_definition(
                "safeDistanceRear 和 lineChangingDelay 不能为负",
            ));
        }
        // NaN 和无穷的速度会让随机取速越界
        let speeds_valid = m.min_speed.is_finite()
            && m.max_speed.is_finite()
            && m.min_speed > 0.0
            && m.max_speed >= m.min_speed;
        if !speeds_valid {
            return Err(SchedulerError::invalid_definition(format!(
                "速度区间无效: [{}, {})",
                m.min_speed, m.max_speed
            )));
        }

        if self.roads.is_empty() {
            return Err(SchedulerError::invalid_definition("至少需要一条道路"));
        }
        let mut road_ids = HashSet::new();
        for road in &self.roads {
            if !road_ids.insert(road.id.as_str()) {
                return Err(SchedulerError::invalid_definition(format!(
                    "道路ID重复: {}",
                    road.id
                )));
            }
            if !(road.length.is_finite() && road.length > 0.0) || road.lanes == 0 {
                return Err(SchedulerError::invalid_definition(format!(
                    "道路 {} 的长度和车道数必须大于0",
                    road.id
                )));
            }
        }

        let mut endpoint_ids = HashSet::new();
        for endpoint in &self.endpoints {
            if !endpoint_ids.insert(endpoint.id.as_str()) {
                return Err(SchedulerError::invalid_definition(format!(
                    "端点ID重复: {}",
                    endpoint.id
                )));
            }
            if !non_negative(endpoint.input_rate) {
                return Err(SchedulerError::invalid_definition(format!(
                    "端点 {} 的输入速率不能为负",
                    endpoint.id
                )));
            }
            if let Some(road) = &endpoint.road {
                if !road_ids.contains(road.as_str()) {
                    return Err(SchedulerError::invalid_definition(format!(
                        "端点 {} 引用了不存在的道路 {road}",
                        endpoint.id
                    )));
                }
            }
        }

        let mut light_ids = HashSet::new();
        for light in &self.traffic_lights {
            if !light_ids.insert(light.id.as_str()) {
                return Err(SchedulerError::invalid_definition(format!(
                    "信号灯ID重复: {}",
                    light.id
                )));
            }
            let road = self.road(&light.road).ok_or_else(|| {
                SchedulerError::invalid_definition(format!(
                    "信号灯 {} 引用了不存在的道路 {}",
                    light.id, light.road
                ))
            })?;
            if !(non_negative(light.position) && light.position <= road.length) {
                return Err(SchedulerError::invalid_definition(format!(
                    "信号灯 {} 的位置超出道路范围",
                    light.id
                )));
            }
            SimTime::try_from_secs_f64(light.green_duration)?;
            SimTime::try_from_secs_f64(light.red_duration)?;
            let positive = |v: f64| v.is_finite() && v > 0.0;
            if !positive(light.green_duration) || !positive(light.red_duration) {
                return Err(SchedulerError::invalid_definition(format!(
                    "信号灯 {} 的相位时长必须大于0",
                    light.id
                )));
            }
        }

        for crossroad in &self.crossroads {
            for light in &crossroad.traffic_lights {
                if !light_ids.contains(light.as_str()) {
                    return Err(SchedulerError::invalid_definition(format!(
                        "路口 {} 引用了不存在的信号灯 {light}",
                        crossroad.id
                    )));
                }
            }
        }

        for node in self.roads.iter().flat_map(|r| r.from.iter().chain(r.to.iter())) {
            let known = endpoint_ids.contains(node.as_str())
                || self.crossroads.iter().any(|c| &c.id == node);
            if !known {
                return Err(SchedulerError::invalid_definition(format!(
                    "道路引用了不存在的节点 {node}"
                )));
            }
        }

        for p in &self.statistics_parameters.throughput_positions {
            if !road_ids.contains(p.road.as_str()) {
                return Err(SchedulerError::invalid_definition(format!(
                    "统计断面引用了不存在的道路 {}",
                    p.road
                )));
            }
        }

        Ok(())
    }

    /// 单条道路、单个入口的定义，便于快速搭建模型
    pub fn single_road(length: f64, lanes: u32, input_rate: f64) -> Self {
        JobDefinition {
            simulation_parameters: SimulationParameters {
                duration: 60.0,
                step_duration: 0.2,
                batch_length: 50,
                seed: None,
            },
            model_parameters: ModelParameters::default(),
            roads: vec![RoadDefinition {
                id: "main".to_string(),
                from: Some("in".to_string()),
                to: Some("out".to_string()),
                length,
                width: default_road_width(),
                lanes,
            }],
            endpoints: vec![
                EndpointDefinition {
                    id: "in".to_string(),
                    road: Some("main".to_string()),
                    input_rate,
                },
                EndpointDefinition {
                    id: "out".to_string(),
                    road: None,
                    input_rate: 0.0,
                },
            ],
            crossroads: Vec::new(),
            traffic_lights: Vec::new(),
            statistics_parameters: StatisticsParameters::default(),
        }
    }

    pub fn with_timing(mut self, duration: f64, step_duration: f64, batch_length: u64) -> Self {
        self.simulation_parameters.duration = duration;
        self.simulation_parameters.step_duration = step_duration;
        self.simulation_parameters.batch_length = batch_length;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.simulation_parameters.seed = Some(seed);
        self
    }

    pub fn with_light(
        mut self,
        id: &str,
        road: &str,
        position: f64,
        green: f64,
        red: f64,
        initial: LightPhase,
    ) -> Self {
        self.traffic_lights.push(TrafficLightDefinition {
            id: id.to_string(),
            road: road.to_string(),
            position,
            green_duration: green,
            red_duration: red,
            initial_phase: Some(initial),
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORIGINAL_FORMAT: &str = r#"{
        "simulationParameters": { "duration": 90, "stepDuration": 0.2, "batchLength": 50 },
        "modelParameters": { "safeDistance": 10, "maxSpeed": 20, "minSpeed": 10 },
        "roads": [ { "id": "r1", "length": 300, "width": 10, "lanes": 3 } ],
        "endpoints": [ { "id": "west", "road": "r1", "inputRate": 1200 } ],
        "trafficLights": [
            { "id": "1", "road": "r1", "position": 80, "greenDuration": 5, "redDuration": 4 }
        ]
    }"#;

    #[test]
    fn test_parse_json_with_defaults() {
        let def = JobDefinition::from_json_str(ORIGINAL_FORMAT).unwrap();
        assert_eq!(def.model_parameters.safe_distance, 10.0);
        assert_eq!(def.model_parameters.braking_limit, 6.5);
        assert_eq!(def.roads[0].lanes, 3);
        assert_eq!(def.total_steps().unwrap(), 450);
        assert_eq!(def.batches().unwrap(), 9);
        assert!(def.endpoints[0].is_entry());
    }

    #[test]
    fn test_total_steps_rounds_up() {
        let def = JobDefinition::single_road(100.0, 1, 600.0).with_timing(1.0, 0.3, 2);
        assert_eq!(def.total_steps().unwrap(), 4);
        assert_eq!(def.batches().unwrap(), 2);
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
            roads = [ { id = "a", length = 200.0, lanes = 2 } ]
            endpoints = [ { id = "e", road = "a", inputRate = 600.0 } ]

            [simulationParameters]
            duration = 10.0
            stepDuration = 0.5
            batchLength = 5
            seed = 7
        "#;
        let def = JobDefinition::from_toml_str(toml).unwrap();
        assert_eq!(def.simulation_parameters.seed, Some(7));
        assert_eq!(def.total_steps().unwrap(), 20);
    }

    #[test]
    fn test_validate_rejects_dangling_references() {
        let mut def = JobDefinition::single_road(100.0, 1, 600.0);
        def.endpoints[0].road = Some("missing".into());
        assert!(matches!(
            def.validate(),
            Err(SchedulerError::InvalidDefinition(_))
        ));

        let def = JobDefinition::single_road(100.0, 1, 600.0).with_light(
            "l",
            "main",
            150.0,
            5.0,
            5.0,
            LightPhase::Red,
        );
        assert!(def.validate().is_err());

        let mut def = JobDefinition::single_road(100.0, 1, 600.0);
        def.crossroads.push(CrossroadDefinition {
            id: "x".into(),
            traffic_lights: vec!["nope".into()],
        });
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_timing() {
        let def = JobDefinition::single_road(100.0, 1, 600.0).with_timing(10.0, 0.0, 5);
        assert!(def.validate().is_err());
        let def = JobDefinition::single_road(100.0, 1, 600.0).with_timing(10.0, 0.5, 0);
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_non_finite_numbers() {
        let mut def = JobDefinition::single_road(100.0, 1, 600.0);
        def.roads[0].length = f64::NAN;
        assert!(def.validate().is_err());

        let mut def = JobDefinition::single_road(100.0, 1, 600.0);
        def.endpoints[0].input_rate = f64::NAN;
        assert!(def.validate().is_err());

        let mut def = JobDefinition::single_road(100.0, 1, 600.0);
        def.model_parameters.min_speed = f64::NAN;
        assert!(def.validate().is_err());

        let def = JobDefinition::single_road(100.0, 1, 600.0).with_light(
            "l",
            "main",
            50.0,
            f64::INFINITY,
            5.0,
            LightPhase::Green,
        );
        assert!(def.validate().is_err());

        // TOML 可以直接写出 inf
        let toml = r#"
            roads = [ { id = "a", length = 200.0, lanes = 2 } ]
            endpoints = [ { id = "e", road = "a", inputRate = 600.0 } ]

            [simulationParameters]
            duration = 10.0
            stepDuration = 0.5
            batchLength = 5

            [modelParameters]
            minSpeed = 10.0
            maxSpeed = inf
        "#;
        assert!(matches!(
            JobDefinition::from_toml_str(toml),
            Err(SchedulerError::InvalidDefinition(_))
        ));
    }

    #[test]
    fn test_default_throughput_positions() {
        let def = JobDefinition::single_road(100.0, 1, 600.0);
        let positions = def.throughput_positions();
        assert_eq!(positions.len(), 2);
        assert_eq!(positions[1].position, 100.0);
    }
}
