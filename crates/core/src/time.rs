//! 精确的仿真时间
//!
//! 仿真时间以整数微秒保存，避免数百万步之后浮点秒累积误差。
//! 文本形式为 `{天}d{秒}s{微秒}`，例如 `0d90s200000` 表示 90.2 秒。
//! 只有在 I/O 边界（CSV 输出、统计）才转换为浮点秒。

use std::fmt;
use std::ops::{Add, AddAssign, Sub};
use std::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{SchedulerError, SchedulerResult};

pub const MICROS_PER_SECOND: i64 = 1_000_000;
pub const SECONDS_PER_DAY: i64 = 86_400;
const MICROS_PER_DAY: i64 = MICROS_PER_SECOND * SECONDS_PER_DAY;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SimTime(i64);

impl SimTime {
    pub const ZERO: SimTime = SimTime(0);

    pub const fn from_micros(micros: i64) -> Self {
        SimTime(micros)
    }

    pub const fn from_secs(secs: i64) -> Self {
        SimTime(secs * MICROS_PER_SECOND)
    }

    pub fn from_millis(millis: i64) -> Self {
        SimTime(millis * 1_000)
    }

    /// 由浮点秒构造，要求结果可以精确表示为微秒
    pub fn try_from_secs_f64(secs: f64) -> SchedulerResult<Self> {
        if !secs.is_finite() || secs < 0.0 {
            return Err(SchedulerError::invalid_definition(format!(
                "时间必须是非负有限数: {secs}"
            )));
        }
        let micros = (secs * MICROS_PER_SECOND as f64).round();
        if (micros / MICROS_PER_SECOND as f64 - secs).abs() > 1e-9 {
            return Err(SchedulerError::invalid_definition(format!(
                "时间无法精确表示为微秒: {secs}"
            )));
        }
        Ok(SimTime(micros as i64))
    }

    pub const fn as_micros(&self) -> i64 {
        self.0
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / MICROS_PER_SECOND as f64
    }

    pub fn days(&self) -> i64 {
        self.0.div_euclid(MICROS_PER_DAY)
    }

    /// 当天内的秒数
    pub fn seconds(&self) -> i64 {
        self.0.rem_euclid(MICROS_PER_DAY) / MICROS_PER_SECOND
    }

    /// 当前秒内的微秒数
    pub fn microseconds(&self) -> i64 {
        self.0.rem_euclid(MICROS_PER_SECOND)
    }

    pub fn times(&self, n: u64) -> SimTime {
        SimTime(self.0 * n as i64)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl Add for SimTime {
    type Output = SimTime;

    fn add(self, rhs: SimTime) -> SimTime {
        SimTime(self.0 + rhs.0)
    }
}

impl AddAssign for SimTime {
    fn add_assign(&mut self, rhs: SimTime) {
        self.0 += rhs.0;
    }
}

impl Sub for SimTime {
    type Output = SimTime;

    fn sub(self, rhs: SimTime) -> SimTime {
        SimTime(self.0 - rhs.0)
    }
}

impl fmt::Display for SimTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}d{}s{}",
            self.days(),
            self.seconds(),
            self.microseconds()
        )
    }
}

impl FromStr for SimTime {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SchedulerError::Serialization(format!("无效的仿真时间: {s}"));
        let (days, rest) = s.split_once('d').ok_or_else(invalid)?;
        let (secs, micros) = rest.split_once('s').ok_or_else(invalid)?;
        let days: i64 = days.parse().map_err(|_| invalid())?;
        let secs: i64 = secs.parse().map_err(|_| invalid())?;
        let micros: i64 = if micros.is_empty() {
            0
        } else {
            micros.parse().map_err(|_| invalid())?
        };
        if !(0..SECONDS_PER_DAY).contains(&secs) || !(0..MICROS_PER_SECOND).contains(&micros) {
            return Err(invalid());
        }
        Ok(SimTime(days * MICROS_PER_DAY + secs * MICROS_PER_SECOND + micros))
    }
}

impl Serialize for SimTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

struct SimTimeVisitor;

impl<'de> Visitor<'de> for SimTimeVisitor {
    type Value = SimTime;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a time string like `0d12s500000` or a number of seconds")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<SimTime, E> {
        v.parse().map_err(E::custom)
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<SimTime, E> {
        Ok(SimTime::from_secs(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<SimTime, E> {
        Ok(SimTime::from_secs(v as i64))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<SimTime, E> {
        SimTime::try_from_secs_f64(v).map_err(E::custom)
    }
}

impl<'de> Deserialize<'de> for SimTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(SimTimeVisitor)
    }
}
