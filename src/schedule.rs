// src/schedule.rs
//
// Daily cadence: the interval [d, d+1) closes at the next UTC midnight and
// runs with logical date d.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::{future::Future, sync::Arc};
use tracing::{error, info, warn};

use crate::pipeline::{Pipeline, RunContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Cadence {
    #[default]
    #[serde(rename = "@daily")]
    Daily,
}

impl Cadence {
    pub fn period(&self) -> Duration {
        match self {
            Cadence::Daily => Duration::days(1),
        }
    }
}

fn default_max_active_runs() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(default, rename = "interval")]
    pub cadence: Cadence,
    pub start_date: NaiveDate,
    #[serde(default)]
    pub catchup: bool,
    #[serde(default = "default_max_active_runs")]
    pub max_active_runs: usize,
}

fn midnight(t: DateTime<Utc>) -> DateTime<Utc> {
    t.date_naive().and_time(NaiveTime::MIN).and_utc()
}

impl Schedule {
    /// `@daily` from `start_date`, no catch-up, one active run.
    pub fn daily(start_date: NaiveDate) -> Self {
        Self {
            cadence: Cadence::Daily,
            start_date,
            catchup: false,
            max_active_runs: 1,
        }
    }

    pub fn with_catchup(mut self, catchup: bool) -> Self {
        self.catchup = catchup;
        self
    }

    pub fn with_max_active_runs(mut self, max_active_runs: usize) -> Self {
        self.max_active_runs = max_active_runs;
        self
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start_date.and_time(NaiveTime::MIN).and_utc()
    }

    /// First fire time strictly after `t`.
    pub fn next_fire_after(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let first = self.start() + self.cadence.period();
        if t < first {
            first
        } else {
            midnight(t) + self.cadence.period()
        }
    }

    /// Logical dates of closed intervals at `now` that have not run since `last`.
    /// Without catch-up only the most recent one is returned.
    pub fn due_runs(
        &self,
        last: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Vec<DateTime<Utc>> {
        let period = self.cadence.period();
        let latest = midnight(now) - period;
        let mut next = match last {
            Some(l) => midnight(l) + period,
            None => self.start(),
        };
        if next < self.start() {
            next = self.start();
        }
        if latest < next {
            return Vec::new();
        }
        if !self.catchup {
            return vec![latest];
        }

        let mut due = Vec::new();
        while next <= latest {
            due.push(next);
            next += period;
        }
        due
    }
}

/// Run `pipeline` on its schedule until `shutdown` resolves. Runs are
/// sequential; failures are logged and the next interval still fires.
pub async fn serve<S>(pipeline: Arc<Pipeline>, shutdown: S)
where
    S: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let schedule = pipeline.schedule().clone();
    let mut last: Option<DateTime<Utc>> = None;

    info!(
        pipeline = %pipeline.id(),
        start = %schedule.start_date,
        catchup = schedule.catchup,
        "scheduler started"
    );

    loop {
        let now = Utc::now();
        for logical_date in schedule.due_runs(last, now) {
            let ctx = RunContext::scheduled(logical_date);
            match pipeline.run(ctx).await {
                Ok(report) if report.succeeded() => {
                    info!(run_id = %report.run_id, "run succeeded");
                }
                Ok(report) => {
                    let reason = report
                        .failure
                        .as_ref()
                        .map(|e| e.to_string())
                        .unwrap_or_default();
                    error!(run_id = %report.run_id, %reason, "run failed");
                }
                Err(e) => warn!("run for {} not started: {}", logical_date, e),
            }
            last = Some(logical_date);
        }

        let next = schedule.next_fire_after(Utc::now());
        let wait = (next - Utc::now()).to_std().unwrap_or_default();
        info!(next = %next, "waiting for next interval");

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = &mut shutdown => {
                info!("shutdown requested");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::tests::{fake_pipeline, Fakes};
    use chrono::TimeZone;
    use std::sync::atomic::Ordering;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    fn sched() -> Schedule {
        Schedule::daily(NaiveDate::from_ymd_opt(2021, 3, 1).unwrap())
    }

    #[test]
    fn first_fire_closes_first_interval() {
        let s = sched();
        assert_eq!(s.next_fire_after(at(2021, 1, 1, 0)), at(2021, 3, 2, 0));
        assert_eq!(s.next_fire_after(at(2021, 3, 2, 0)), at(2021, 3, 3, 0));
        assert_eq!(s.next_fire_after(at(2021, 3, 5, 13)), at(2021, 3, 6, 0));
    }

    #[test]
    fn nothing_due_before_first_interval_closes() {
        assert!(sched().due_runs(None, at(2021, 3, 1, 23)).is_empty());
        assert_eq!(sched().due_runs(None, at(2021, 3, 2, 0)), vec![at(2021, 3, 1, 0)]);
    }

    #[test]
    fn without_catchup_only_latest_interval_runs() {
        let due = sched().due_runs(None, at(2021, 3, 10, 6));
        assert_eq!(due, vec![at(2021, 3, 9, 0)]);

        let due = sched().due_runs(Some(at(2021, 3, 2, 0)), at(2021, 3, 10, 6));
        assert_eq!(due, vec![at(2021, 3, 9, 0)]);

        // already ran the latest
        assert!(sched()
            .due_runs(Some(at(2021, 3, 9, 0)), at(2021, 3, 10, 6))
            .is_empty());
    }

    #[test]
    fn with_catchup_every_missed_interval_runs() {
        let due = sched()
            .with_catchup(true)
            .due_runs(Some(at(2021, 3, 5, 0)), at(2021, 3, 9, 1));
        assert_eq!(
            due,
            vec![at(2021, 3, 6, 0), at(2021, 3, 7, 0), at(2021, 3, 8, 0)]
        );
    }

    #[test]
    fn deserializes_airflow_style_interval() {
        let s: Schedule = serde_yaml::from_str(
            "interval: \"@daily\"\nstart_date: 2021-03-01\ncatchup: false\n",
        )
        .unwrap();
        assert_eq!(s, sched());
        assert_eq!(s.max_active_runs, 1);
    }

    #[tokio::test]
    async fn serve_runs_latest_interval_then_stops_on_shutdown() {
        let fakes = Fakes::default();
        let pipeline = Arc::new(fake_pipeline(&fakes, true, true));
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let handle = tokio::spawn(serve(pipeline, async {
            let _ = rx.await;
        }));

        for _ in 0..100 {
            if fakes.loads.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        tx.send(()).unwrap();
        handle.await.unwrap();

        assert_eq!(fakes.transforms.load(Ordering::SeqCst), 1);
        assert_eq!(fakes.loads.load(Ordering::SeqCst), 1);
    }
}
