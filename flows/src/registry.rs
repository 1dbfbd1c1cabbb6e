//! Catalogue of the flows this crate knows how to run, with their schedules.

use chrono::DateTime;
use chrono::NaiveDate;
use chrono::NaiveDateTime;
use chrono::TimeDelta;
use chrono::TimeZone;
use chrono::Utc;
use chrono_tz::Tz;
use serde::Serialize;

use crate::error::FlowError;
use crate::error::FlowResult;

/// Timezone every flow clock runs in.
pub const SCHEDULE_TIMEZONE: Tz = chrono_tz::America::Sao_Paulo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlowKind {
    TablesBindings,
    AuditLog,
    Metadata,
    FloodingDetection,
    Healthcheck,
    MapaRealizacoes,
}

impl FlowKind {
    pub const ALL: [FlowKind; 6] = [
        FlowKind::TablesBindings,
        FlowKind::AuditLog,
        FlowKind::Metadata,
        FlowKind::FloodingDetection,
        FlowKind::Healthcheck,
        FlowKind::MapaRealizacoes,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FlowKind::TablesBindings => "tables-bindings",
            FlowKind::AuditLog => "audit-log",
            FlowKind::Metadata => "metadata",
            FlowKind::FloodingDetection => "flooding-detection",
            FlowKind::Healthcheck => "healthcheck",
            FlowKind::MapaRealizacoes => "mapa-realizacoes",
        }
    }
}

impl std::fmt::Display for FlowKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FlowKind {
    type Err = FlowError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        FlowKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| FlowError::UnknownFlow(value.to_string()))
    }
}

/// Fixed-interval clock anchored at a local start time.
///
/// Runs happen at `start + k * interval` for every integer `k >= 0`; the
/// interval is absolute elapsed time, so daylight saving shifts the local
/// wall-clock time of runs rather than the spacing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntervalSchedule {
    #[serde(serialize_with = "serialize_interval")]
    pub interval: TimeDelta,
    pub start: NaiveDateTime,
    #[serde(serialize_with = "serialize_timezone")]
    pub timezone: Tz,
}

fn serialize_interval<S: serde::Serializer>(
    interval: &TimeDelta,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_i64(interval.num_seconds())
}

fn serialize_timezone<S: serde::Serializer>(
    timezone: &Tz,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(timezone.name())
}

impl IntervalSchedule {
    pub fn new(interval: TimeDelta, start: NaiveDateTime, timezone: Tz) -> Self {
        Self {
            interval,
            start,
            timezone,
        }
    }

    fn anchor(&self) -> FlowResult<DateTime<Tz>> {
        self.timezone
            .from_local_datetime(&self.start)
            .earliest()
            .ok_or_else(|| {
                FlowError::Config(format!(
                    "schedule start {} does not exist in {}",
                    self.start,
                    self.timezone.name()
                ))
            })
    }

    /// The next `n` run times strictly after `after`.
    pub fn next_runs(&self, after: DateTime<Utc>, n: usize) -> FlowResult<Vec<DateTime<Tz>>> {
        if self.interval <= TimeDelta::zero() {
            return Err(FlowError::Config(
                "schedule interval must be positive".to_string(),
            ));
        }
        let anchor = self.anchor()?;
        let step = self.interval.num_seconds();
        let elapsed = after.signed_duration_since(anchor.with_timezone(&Utc)).num_seconds();
        let first = if elapsed < 0 { 0 } else { elapsed / step + 1 };

        Ok((0..n)
            .filter_map(|offset| {
                let k = first.checked_add(i64::try_from(offset).ok()?)?;
                let delta = TimeDelta::try_seconds(step.checked_mul(k)?)?;
                anchor.checked_add_signed(delta)
            })
            .collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowDefinition {
    pub kind: FlowKind,
    pub title: &'static str,
    pub schedule: Option<IntervalSchedule>,
    /// Maximum number of concurrent per-item tasks inside one run.
    pub parallelism: usize,
}

#[derive(Debug, Clone)]
pub struct FlowRegistry {
    flows: Vec<FlowDefinition>,
}

fn local_start(year: i32, month: u32, day: u32) -> NaiveDateTime {
    local_start_at(year, month, day, 0)
}

fn local_start_at(year: i32, month: u32, day: u32, hour: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|date| date.and_hms_opt(hour, 0, 0))
        .unwrap_or_default()
}

impl FlowRegistry {
    pub fn builtin() -> Self {
        let daily_from_2023 = IntervalSchedule::new(
            TimeDelta::days(1),
            local_start(2023, 1, 1),
            SCHEDULE_TIMEZONE,
        );
        Self {
            flows: vec![
                FlowDefinition {
                    kind: FlowKind::TablesBindings,
                    title: "LGPD - Table access bindings from BigQuery IAM",
                    schedule: Some(daily_from_2023.clone()),
                    parallelism: 5,
                },
                FlowDefinition {
                    kind: FlowKind::AuditLog,
                    title: "LGPD - IAM permission grant history",
                    schedule: None,
                    parallelism: 10,
                },
                FlowDefinition {
                    kind: FlowKind::Metadata,
                    title: "Datalake management - Table metadata",
                    schedule: Some(daily_from_2023),
                    parallelism: 10,
                },
                FlowDefinition {
                    kind: FlowKind::FloodingDetection,
                    title: "Flooding detection (AI) from street cameras",
                    schedule: Some(IntervalSchedule::new(
                        TimeDelta::minutes(3),
                        local_start(2023, 1, 1),
                        SCHEDULE_TIMEZONE,
                    )),
                    parallelism: 30,
                },
                FlowDefinition {
                    kind: FlowKind::Healthcheck,
                    title: "Healthcheck: data relay and API",
                    schedule: Some(IntervalSchedule::new(
                        TimeDelta::minutes(5),
                        local_start(2021, 1, 1),
                        SCHEDULE_TIMEZONE,
                    )),
                    parallelism: 1,
                },
                FlowDefinition {
                    kind: FlowKind::MapaRealizacoes,
                    title: "Public works map - Firestore update",
                    schedule: Some(IntervalSchedule::new(
                        TimeDelta::days(1),
                        local_start_at(2021, 1, 1, 3),
                        SCHEDULE_TIMEZONE,
                    )),
                    parallelism: 50,
                },
            ],
        }
    }

    pub fn get(&self, kind: FlowKind) -> Option<&FlowDefinition> {
        self.flows.iter().find(|flow| flow.kind == kind)
    }

    pub fn list(&self) -> &[FlowDefinition] {
        &self.flows
    }
}
