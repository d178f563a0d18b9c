use std::collections::BTreeMap;
use std::str::FromStr;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::{debug, instrument};

use traffic_core::models::{
    CarRecord, CarState, Job, JobDefinition, JobProgress, JobStatistics, StatisticsResult,
    StepRecord, TrackPoint,
};
use traffic_core::traits::StateStore;
use traffic_core::{SchedulerError, SchedulerResult, SimTime};

/// 连接类故障映射为 `StorageUnavailable`，其余保留为数据库错误
fn db_error(e: sqlx::Error) -> SchedulerError {
    match e {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => SchedulerError::storage_unavailable(e.to_string()),
        other => SchedulerError::Database(other),
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(text: &str, what: &str) -> SchedulerResult<T> {
    serde_json::from_str(text)
        .map_err(|e| SchedulerError::Serialization(format!("无法解析{what}: {e}")))
}

fn parse_state(text: &str) -> SchedulerResult<CarState> {
    CarState::parse(text)
        .ok_or_else(|| SchedulerError::Serialization(format!("未知车辆状态: {text}")))
}

/// SQLite状态存储
pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// 连接数据库并初始化表结构
    ///
    /// 内存数据库只使用一个长期连接，否则每个连接各自看到一份空库。
    pub async fn connect(url: &str, max_connections: u32) -> SchedulerResult<Self> {
        debug!("连接SQLite状态存储: {}", url);
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");

        let mut options = SqliteConnectOptions::from_str(url)
            .map_err(|e| SchedulerError::config_error(format!("无效的SQLite URL {url}: {e}")))?
            .create_if_missing(true)
            .foreign_keys(true);
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new()
                .max_connections(max_connections)
                .min_connections(1)
        };
        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(db_error)?;

        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    async fn run_migrations(pool: &SqlitePool) -> SchedulerResult<()> {
        debug!("初始化SQLite表结构");

        let tables = [
            r#"
            CREATE TABLE IF NOT EXISTS projects (
                name TEXT PRIMARY KEY,
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                project TEXT NOT NULL,
                name TEXT NOT NULL,
                definition TEXT NOT NULL,
                progress TEXT NOT NULL,
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (project, name),
                FOREIGN KEY (project) REFERENCES projects(name) ON DELETE CASCADE
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS full_states (
                project TEXT NOT NULL,
                job TEXT NOT NULL,
                state TEXT NOT NULL,
                updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (project, job),
                FOREIGN KEY (project, job) REFERENCES jobs(project, name) ON DELETE CASCADE
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS statistics (
                project TEXT NOT NULL,
                job TEXT NOT NULL,
                phase TEXT NOT NULL,
                result TEXT NOT NULL,
                PRIMARY KEY (project, job, phase),
                FOREIGN KEY (project, job) REFERENCES jobs(project, name) ON DELETE CASCADE
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS states (
                project TEXT NOT NULL,
                job TEXT NOT NULL,
                time INTEGER NOT NULL,
                lights TEXT NOT NULL DEFAULT '[]',
                queues TEXT NOT NULL DEFAULT '[]',
                PRIMARY KEY (project, job, time),
                FOREIGN KEY (project, job) REFERENCES jobs(project, name) ON DELETE CASCADE
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS cars (
                project TEXT NOT NULL,
                job TEXT NOT NULL,
                time INTEGER NOT NULL,
                car_id INTEGER NOT NULL,
                road TEXT NOT NULL,
                lane INTEGER NOT NULL,
                position REAL NOT NULL,
                speed REAL NOT NULL,
                desired_speed REAL NOT NULL,
                length REAL NOT NULL,
                width REAL NOT NULL,
                state TEXT NOT NULL,
                blinker INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (project, job, time, car_id),
                FOREIGN KEY (project, job) REFERENCES jobs(project, name) ON DELETE CASCADE
            )
            "#,
        ];
        for sql in tables {
            sqlx::query(sql).execute(pool).await.map_err(db_error)?;
        }

        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_states_job_time ON states(project, job, time)",
            "CREATE INDEX IF NOT EXISTS idx_cars_job_time ON cars(project, job, time)",
            "CREATE INDEX IF NOT EXISTS idx_cars_job_car ON cars(project, job, car_id)",
            "CREATE INDEX IF NOT EXISTS idx_cars_job_state ON cars(project, job, state)",
        ];
        for sql in indexes {
            sqlx::query(sql).execute(pool).await.map_err(db_error)?;
        }

        debug!("SQLite表结构初始化完成");
        Ok(())
    }

    pub async fn health_check(&self) -> SchedulerResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await
    }

    async fn ensure_project(&self, project: &str) -> SchedulerResult<()> {
        if self.project_exists(project).await? {
            Ok(())
        } else {
            Err(SchedulerError::project_not_found(project))
        }
    }

    async fn ensure_job(&self, project: &str, job: &str) -> SchedulerResult<()> {
        let row = sqlx::query("SELECT 1 FROM jobs WHERE project = ?1 AND name = ?2")
            .bind(project)
            .bind(job)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        match row {
            Some(_) => Ok(()),
            None => {
                self.ensure_project(project).await?;
                Err(SchedulerError::job_not_found(project, job))
            }
        }
    }

    async fn load_progress(
        tx: &mut Transaction<'_, Sqlite>,
        project: &str,
        job: &str,
    ) -> SchedulerResult<JobProgress> {
        let row = sqlx::query("SELECT progress FROM jobs WHERE project = ?1 AND name = ?2")
            .bind(project)
            .bind(job)
            .fetch_optional(&mut **tx)
            .await
            .map_err(db_error)?
            .ok_or_else(|| SchedulerError::job_not_found(project, job))?;
        let text: String = row.try_get("progress")?;
        parse_json(&text, "作业进度")
    }

    async fn store_progress(
        tx: &mut Transaction<'_, Sqlite>,
        project: &str,
        job: &str,
        progress: &JobProgress,
    ) -> SchedulerResult<()> {
        sqlx::query(
            "UPDATE jobs SET progress = ?1, updated_at = CURRENT_TIMESTAMP WHERE project = ?2 AND name = ?3",
        )
        .bind(serde_json::to_string(progress)?)
        .bind(project)
        .bind(job)
        .execute(&mut **tx)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn load_statistics(&self, project: &str, job: &str) -> SchedulerResult<JobStatistics> {
        let rows = sqlx::query(
            "SELECT result FROM statistics WHERE project = ?1 AND job = ?2 ORDER BY phase",
        )
        .bind(project)
        .bind(job)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        let mut statistics = JobStatistics::default();
        for row in rows {
            let text: String = row.try_get("result")?;
            statistics.apply(parse_json::<StatisticsResult>(&text, "统计结果")?);
        }
        Ok(statistics)
    }

    fn row_to_car(row: &SqliteRow) -> SchedulerResult<CarRecord> {
        let state: String = row.try_get("state")?;
        Ok(CarRecord {
            id: row.try_get::<i64, _>("car_id")? as u64,
            road: row.try_get("road")?,
            lane: row.try_get::<i64, _>("lane")? as u32,
            position: row.try_get("position")?,
            speed: row.try_get("speed")?,
            desired_speed: row.try_get("desired_speed")?,
            length: row.try_get("length")?,
            width: row.try_get("width")?,
            state: parse_state(&state)?,
            blinker: row.try_get::<i64, _>("blinker")? as i8,
        })
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    #[instrument(skip(self))]
    async fn create_project(&self, name: &str) -> SchedulerResult<()> {
        let result = sqlx::query("INSERT OR IGNORE INTO projects (name) VALUES (?1)")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        if result.rows_affected() == 0 {
            return Err(SchedulerError::ProjectAlreadyExists {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_project(&self, name: &str) -> SchedulerResult<()> {
        let result = sqlx::query("DELETE FROM projects WHERE name = ?1")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        if result.rows_affected() == 0 {
            return Err(SchedulerError::project_not_found(name));
        }
        Ok(())
    }

    async fn project_exists(&self, name: &str) -> SchedulerResult<bool> {
        let row = sqlx::query("SELECT 1 FROM projects WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(row.is_some())
    }

    async fn list_projects(&self) -> SchedulerResult<Vec<String>> {
        let rows = sqlx::query("SELECT name FROM projects ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;
        rows.iter()
            .map(|row| row.try_get("name").map_err(db_error))
            .collect()
    }

    #[instrument(skip(self, definition))]
    async fn add_job(
        &self,
        project: &str,
        name: &str,
        definition: JobDefinition,
    ) -> SchedulerResult<Job> {
        definition.validate()?;
        self.ensure_project(project).await?;
        let progress = JobProgress::for_definition(&definition)?;

        let result = sqlx::query(
            "INSERT OR IGNORE INTO jobs (project, name, definition, progress) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(project)
        .bind(name)
        .bind(serde_json::to_string(&definition)?)
        .bind(serde_json::to_string(&progress)?)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        if result.rows_affected() == 0 {
            return Err(SchedulerError::JobAlreadyExists {
                project: project.to_string(),
                job: name.to_string(),
            });
        }

        Ok(Job {
            project: project.to_string(),
            name: name.to_string(),
            definition,
            progress,
            statistics: JobStatistics::default(),
        })
    }

    async fn get_job(&self, project: &str, job: &str) -> SchedulerResult<Option<Job>> {
        let row = sqlx::query(
            "SELECT definition, progress FROM jobs WHERE project = ?1 AND name = ?2",
        )
        .bind(project)
        .bind(job)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let definition: String = row.try_get("definition")?;
        let progress: String = row.try_get("progress")?;
        Ok(Some(Job {
            project: project.to_string(),
            name: job.to_string(),
            definition: parse_json(&definition, "作业定义")?,
            progress: parse_json(&progress, "作业进度")?,
            statistics: self.load_statistics(project, job).await?,
        }))
    }

    async fn list_jobs(&self, project: &str) -> SchedulerResult<Vec<String>> {
        self.ensure_project(project).await?;
        let rows = sqlx::query("SELECT name FROM jobs WHERE project = ?1 ORDER BY name")
            .bind(project)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;
        rows.iter()
            .map(|row| row.try_get("name").map_err(db_error))
            .collect()
    }

    #[instrument(skip(self))]
    async fn delete_job(&self, project: &str, job: &str) -> SchedulerResult<()> {
        let result = sqlx::query("DELETE FROM jobs WHERE project = ?1 AND name = ?2")
            .bind(project)
            .bind(job)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        if result.rows_affected() == 0 {
            self.ensure_project(project).await?;
            return Err(SchedulerError::job_not_found(project, job));
        }
        Ok(())
    }

    async fn save_progress(
        &self,
        project: &str,
        job: &str,
        progress: &JobProgress,
    ) -> SchedulerResult<()> {
        self.ensure_job(project, job).await?;
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        Self::store_progress(&mut tx, project, job, progress).await?;
        tx.commit().await.map_err(db_error)?;
        Ok(())
    }

    async fn get_full_state(&self, project: &str, job: &str) -> SchedulerResult<Option<Value>> {
        self.ensure_job(project, job).await?;
        let row = sqlx::query("SELECT state FROM full_states WHERE project = ?1 AND job = ?2")
            .bind(project)
            .bind(job)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        match row {
            Some(row) => {
                let text: String = row.try_get("state")?;
                Ok(Some(parse_json(&text, "完整快照")?))
            }
            None => Ok(None),
        }
    }

    async fn set_full_state(&self, project: &str, job: &str, state: Value) -> SchedulerResult<()> {
        self.ensure_job(project, job).await?;
        sqlx::query(
            r#"
            INSERT INTO full_states (project, job, state) VALUES (?1, ?2, ?3)
            ON CONFLICT(project, job) DO UPDATE SET state = excluded.state, updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(project)
        .bind(job)
        .bind(serde_json::to_string(&state)?)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    #[instrument(skip(self, full_state))]
    async fn commit_simulation_batch(
        &self,
        project: &str,
        job: &str,
        from_step: u64,
        steps: u64,
        full_state: Value,
    ) -> SchedulerResult<JobProgress> {
        let state = serde_json::to_string(&full_state)?;
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        let mut progress = Self::load_progress(&mut tx, project, job).await?;
        // 失败时事务随 tx 一起回滚
        progress.advance(from_step, steps)?;

        sqlx::query(
            r#"
            INSERT INTO full_states (project, job, state) VALUES (?1, ?2, ?3)
            ON CONFLICT(project, job) DO UPDATE SET state = excluded.state, updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(project)
        .bind(job)
        .bind(state)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;
        Self::store_progress(&mut tx, project, job, &progress).await?;
        tx.commit().await.map_err(db_error)?;
        Ok(progress)
    }

    #[instrument(skip(self, result))]
    async fn save_statistics(
        &self,
        project: &str,
        job: &str,
        result: StatisticsResult,
    ) -> SchedulerResult<JobProgress> {
        let phase = result.task_type();
        let text = serde_json::to_string(&result)?;
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        let mut progress = Self::load_progress(&mut tx, project, job).await?;
        progress.mark_phase(phase)?;

        sqlx::query(
            r#"
            INSERT INTO statistics (project, job, phase, result) VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(project, job, phase) DO UPDATE SET result = excluded.result
            "#,
        )
        .bind(project)
        .bind(job)
        .bind(phase.as_str())
        .bind(text)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;
        Self::store_progress(&mut tx, project, job, &progress).await?;
        tx.commit().await.map_err(db_error)?;
        Ok(progress)
    }

    async fn add_states(
        &self,
        project: &str,
        job: &str,
        records: &[StepRecord],
    ) -> SchedulerResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        self.ensure_job(project, job).await?;

        let mut tx = self.pool.begin().await.map_err(db_error)?;
        for record in records {
            let time = record.time.as_micros();
            sqlx::query(
                "INSERT OR REPLACE INTO states (project, job, time, lights, queues) VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .bind(project)
            .bind(job)
            .bind(time)
            .bind(serde_json::to_string(&record.lights)?)
            .bind(serde_json::to_string(&record.queues)?)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;

            for car in &record.cars {
                sqlx::query(
                    r#"
                    INSERT OR REPLACE INTO cars
                        (project, job, time, car_id, road, lane, position, speed, desired_speed, length, width, state, blinker)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                    "#,
                )
                .bind(project)
                .bind(job)
                .bind(time)
                .bind(car.id as i64)
                .bind(&car.road)
                .bind(car.lane as i64)
                .bind(car.position)
                .bind(car.speed)
                .bind(car.desired_speed)
                .bind(car.length)
                .bind(car.width)
                .bind(car.state.as_str())
                .bind(car.blinker as i64)
                .execute(&mut *tx)
                .await
                .map_err(db_error)?;
            }
        }
        tx.commit().await.map_err(db_error)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn repair(&self, project: &str, job: &str, from_time: SimTime) -> SchedulerResult<u64> {
        self.ensure_job(project, job).await?;
        let time = from_time.as_micros();
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        sqlx::query("DELETE FROM cars WHERE project = ?1 AND job = ?2 AND time >= ?3")
            .bind(project)
            .bind(job)
            .bind(time)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        let result = sqlx::query("DELETE FROM states WHERE project = ?1 AND job = ?2 AND time >= ?3")
            .bind(project)
            .bind(job)
            .bind(time)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        tx.commit().await.map_err(db_error)?;
        Ok(result.rows_affected())
    }

    async fn list_states(&self, project: &str, job: &str) -> SchedulerResult<Vec<StepRecord>> {
        self.ensure_job(project, job).await?;
        let state_rows = sqlx::query(
            "SELECT time, lights, queues FROM states WHERE project = ?1 AND job = ?2 ORDER BY time",
        )
        .bind(project)
        .bind(job)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        let mut records: BTreeMap<i64, StepRecord> = BTreeMap::new();
        for row in &state_rows {
            let time: i64 = row.try_get("time")?;
            let lights: String = row.try_get("lights")?;
            let queues: String = row.try_get("queues")?;
            records.insert(
                time,
                StepRecord {
                    time: SimTime::from_micros(time),
                    cars: Vec::new(),
                    lights: parse_json(&lights, "信号灯记录")?,
                    queues: parse_json(&queues, "队列记录")?,
                },
            );
        }

        let car_rows = sqlx::query(
            "SELECT * FROM cars WHERE project = ?1 AND job = ?2 ORDER BY time, car_id",
        )
        .bind(project)
        .bind(job)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;
        for row in &car_rows {
            let time: i64 = row.try_get("time")?;
            if let Some(record) = records.get_mut(&time) {
                record.cars.push(Self::row_to_car(row)?);
            }
        }

        Ok(records.into_values().collect())
    }

    async fn count_states(&self, project: &str, job: &str) -> SchedulerResult<u64> {
        self.ensure_job(project, job).await?;
        let row = sqlx::query("SELECT COUNT(*) AS n FROM states WHERE project = ?1 AND job = ?2")
            .bind(project)
            .bind(job)
            .fetch_one(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(row.try_get::<i64, _>("n")? as u64)
    }

    async fn car_event_times(
        &self,
        project: &str,
        job: &str,
        state: CarState,
    ) -> SchedulerResult<Vec<(u64, SimTime)>> {
        self.ensure_job(project, job).await?;
        let rows = sqlx::query(
            "SELECT car_id, time FROM cars WHERE project = ?1 AND job = ?2 AND state = ?3 ORDER BY car_id, time",
        )
        .bind(project)
        .bind(job)
        .bind(state.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;
        rows.iter()
            .map(|row| -> SchedulerResult<(u64, SimTime)> {
                let id: i64 = row.try_get("car_id")?;
                let time: i64 = row.try_get("time")?;
                Ok((id as u64, SimTime::from_micros(time)))
            })
            .collect()
    }

    async fn car_ids(&self, project: &str, job: &str) -> SchedulerResult<Vec<u64>> {
        self.ensure_job(project, job).await?;
        let rows = sqlx::query(
            "SELECT DISTINCT car_id FROM cars WHERE project = ?1 AND job = ?2 ORDER BY car_id",
        )
        .bind(project)
        .bind(job)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;
        rows.iter()
            .map(|row| -> SchedulerResult<u64> { Ok(row.try_get::<i64, _>("car_id")? as u64) })
            .collect()
    }

    async fn car_track(
        &self,
        project: &str,
        job: &str,
        car_id: u64,
    ) -> SchedulerResult<Vec<TrackPoint>> {
        self.ensure_job(project, job).await?;
        let rows = sqlx::query(
            "SELECT * FROM cars WHERE project = ?1 AND job = ?2 AND car_id = ?3 ORDER BY time",
        )
        .bind(project)
        .bind(job)
        .bind(car_id as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;
        rows.iter()
            .map(|row| -> SchedulerResult<TrackPoint> {
                let time: i64 = row.try_get("time")?;
                let car = Self::row_to_car(row)?;
                Ok(TrackPoint::from_record(SimTime::from_micros(time), &car))
            })
            .collect()
    }
}
