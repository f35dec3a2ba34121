//! Launch failures per project, as a process-lifetime counter.
//!
//! Each rebuild counts the servers in `ERROR` and the nodes with a
//! `last_error` that were updated since the previous successful poll (the
//! first poll looks back one refresh interval), and adds those counts to the
//! `launch_failure` counter. Rendering always shows the
//! accumulated counter, never the rows themselves.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Timelike, Utc};
use parking_lot::Mutex;
use tracing::{debug, info};

use super::inventory::NodeSources;
use crate::backend::Resource;
use crate::cache::Snapshot;
use crate::collector::{Collector, CollectorContext};
use crate::error::CollectorResult;
use crate::exposition::MetricFamily;
use crate::join::index_by;
use crate::model::JoinedRow;

pub const FAMILY: &str = "launch_failure";
pub const HELP: &str = "OpenStack Launch Failures by Project";
pub const LABELS: [&str; 3] = ["region", "project_id", "project_name"];

/// Timestamps are compared on their first 19 characters, read as UTC.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

pub struct LaunchFailuresCollector {
    ctx: CollectorContext,
    sources: NodeSources,
    /// Look-back of the first poll
    window: Duration,
    /// End of the last window whose failures were counted
    last_poll: Mutex<Option<DateTime<Utc>>>,
}

impl LaunchFailuresCollector {
    pub const CACHE_KEY: &'static str = "launch_failures";

    /// `window` is normally the refresh interval.
    pub fn new(ctx: CollectorContext, sources: NodeSources, window: Duration) -> Self {
        Self {
            ctx,
            sources,
            window,
            last_poll: Mutex::new(None),
        }
    }

    pub fn last_poll(&self) -> Option<DateTime<Utc>> {
        *self.last_poll.lock()
    }

    #[cfg(test)]
    pub(crate) fn set_last_poll(&self, at: Option<DateTime<Utc>>) {
        *self.last_poll.lock() = at;
    }

    /// The `(since, until]` span a poll at `now` counts.
    ///
    /// Upstream timestamps have whole-second precision, so a second is only
    /// counted once it has fully passed.
    fn poll_window(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let until = now.with_nanosecond(0).unwrap_or(now) - chrono::Duration::seconds(1);
        let since = self.last_poll().unwrap_or_else(|| {
            until - chrono::Duration::from_std(self.window).unwrap_or_else(|_| chrono::Duration::zero())
        });
        (since, until.max(since))
    }
}

/// True when `timestamp` parses and falls in `(since, until]`.
pub fn updated_between(timestamp: Option<&str>, since: DateTime<Utc>, until: DateTime<Utc>) -> bool {
    let Some(head) = timestamp.and_then(|t| t.get(..19)) else {
        return false;
    };
    match NaiveDateTime::parse_from_str(head, TIMESTAMP_FORMAT) {
        Ok(naive) => {
            let updated = Utc.from_utc_datetime(&naive);
            updated > since && updated <= until
        }
        Err(e) => {
            debug!(target: "exporter::collector::launch_failures", timestamp = head, error = %e, "Unparseable timestamp");
            false
        }
    }
}

#[async_trait]
impl Collector for LaunchFailuresCollector {
    fn name(&self) -> &str {
        "launch failures"
    }

    fn cache_key(&self) -> &str {
        Self::CACHE_KEY
    }

    fn context(&self) -> &CollectorContext {
        &self.ctx
    }

    async fn build_rows(&self) -> CollectorResult<Vec<JoinedRow>> {
        let (nodes, servers, projects) = tokio::try_join!(
            self.sources.node_details(&self.ctx.region, false),
            self.sources.nova.list(&Resource::NOVA_SERVERS, &[]),
            self.sources.keystone.list(&Resource::KEYSTONE_PROJECTS, &[]),
        )?;
        let (since, until) = self.poll_window(Utc::now());
        debug!(target: "exporter::collector::launch_failures", %since, %until, "Counting launch failures");
        let project_names = index_by("projects", &projects, |p| Some(p.id.clone()));

        let instance_failures = servers
            .iter()
            .filter(|s| s.str_field("status").as_deref() == Some("ERROR"))
            .filter(|s| updated_between(s.str_field("updated").as_deref(), since, until))
            .map(|s| {
                let project_id = s.str_field("tenant_id").unwrap_or_default();
                let project_name = project_names
                    .get(&project_id)
                    .and_then(|p| p.str_field("name"))
                    .unwrap_or_default();
                (project_id, project_name)
            });

        let node_failures = nodes
            .iter()
            .filter(|n| n.field("last_error").is_some())
            .filter(|n| updated_between(n.field("updated_at"), since, until))
            .map(|n| {
                (
                    n.field("project_id").unwrap_or_default().to_string(),
                    n.field("project_name").unwrap_or_default().to_string(),
                )
            });

        let mut counts: BTreeMap<(String, String), u64> = BTreeMap::new();
        for key in instance_failures.chain(node_failures) {
            *counts.entry(key).or_default() += 1;
        }

        let mut rows = Vec::with_capacity(counts.len());
        for ((project_id, project_name), count) in counts {
            let labels = vec![self.ctx.region.clone(), project_id.clone(), project_name.clone()];
            let total = self.ctx.counters.increment(FAMILY, &labels, count as f64)?;
            info!(
                target: "exporter::collector::launch_failures",
                project_id = %project_id,
                project_name = %project_name,
                new = count,
                total,
                "Launch failures counted"
            );
            rows.push(
                self.ctx
                    .row(project_id.as_str())
                    .with_field("project_id", project_id.as_str())
                    .with_field("project_name", project_name)
                    .with_stat("failures", count as f64),
            );
        }
        *self.last_poll.lock() = Some(until);
        Ok(rows)
    }

    fn families(&self, _snapshot: &Snapshot) -> CollectorResult<Vec<MetricFamily>> {
        Ok(vec![self.ctx.counters.family(FAMILY, HELP, &LABELS)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Resource;
    use crate::collectors::fixtures::{minutes_ago, Testbed};
    use serde_json::json;
    use std::sync::Arc;

    fn alpha() -> Vec<String> {
        vec!["r1".to_string(), "p1".into(), "alpha".into()]
    }

    fn collector(testbed: &Testbed) -> Arc<LaunchFailuresCollector> {
        Arc::new(LaunchFailuresCollector::new(
            Testbed::context(),
            testbed.node_sources(),
            Duration::from_secs(300),
        ))
    }

    #[test]
    fn test_updated_between() {
        let until = Utc::now();
        let since = until - chrono::Duration::minutes(5);
        assert!(updated_between(Some(minutes_ago(1).as_str()), since, until));
        assert!(!updated_between(Some("2999-01-01T00:00:00Z"), since, until));
        assert!(!updated_between(Some(minutes_ago(10).as_str()), since, until));
        assert!(!updated_between(Some("yesterday"), since, until));
        assert!(!updated_between(None, since, until));
    }

    #[test]
    fn test_window_ends_on_last_whole_second() {
        let testbed = Testbed::new();
        let collector = collector(&testbed);
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 30).unwrap() + chrono::Duration::milliseconds(400);

        let (since, until) = collector.poll_window(now);
        assert_eq!(until, Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 29).unwrap());
        assert_eq!(since, Utc.with_ymd_and_hms(2024, 5, 1, 11, 55, 29).unwrap());

        collector.set_last_poll(Some(Utc.with_ymd_and_hms(2024, 5, 1, 11, 40, 0).unwrap()));
        let (since, _) = collector.poll_window(now);
        assert_eq!(since, Utc.with_ymd_and_hms(2024, 5, 1, 11, 40, 0).unwrap());
    }

    #[tokio::test]
    async fn test_failures_since_previous_poll_are_counted() {
        let testbed = Testbed::new();
        testbed.nova.set_records(
            &Resource::NOVA_SERVERS,
            vec![
                json!({"id": "late", "status": "ERROR", "tenant_id": "p1", "updated": minutes_ago(7)}),
                json!({"id": "before-poll", "status": "ERROR", "tenant_id": "p1", "updated": minutes_ago(15)}),
            ],
        );
        let collector = collector(&testbed);
        collector.set_last_poll(Some(Utc::now() - chrono::Duration::minutes(10)));

        collector.build_rows().await.unwrap();
        let counters = &collector.context().counters;
        assert_eq!(counters.value(FAMILY, &alpha()), Some(1.0));

        let rows = collector.build_rows().await.unwrap();
        assert!(rows.is_empty());
        assert_eq!(counters.value(FAMILY, &alpha()), Some(1.0));
    }

    #[tokio::test]
    async fn test_failed_poll_keeps_window_open() {
        let testbed = Testbed::new();
        let collector = collector(&testbed);
        let previous = Utc::now() - chrono::Duration::minutes(10);
        collector.set_last_poll(Some(previous));

        testbed.nova.set_failing(true);
        assert!(collector.build_rows().await.is_err());
        assert_eq!(collector.last_poll(), Some(previous));

        testbed.nova.set_failing(false);
        collector.build_rows().await.unwrap();
        assert!(collector.last_poll() > Some(previous));
        assert_eq!(collector.context().counters.value(FAMILY, &alpha()), Some(1.0));
    }

    #[tokio::test]
    async fn test_build_counts_servers_and_nodes() {
        let testbed = Testbed::new();
        let collector = collector(&testbed);
        let rows = collector.build_rows().await.unwrap();

        let counts: Vec<_> = rows
            .iter()
            .map(|r| (r.field("project_name").unwrap_or_default(), r.stat("failures").unwrap()))
            .collect();
        assert_eq!(counts, vec![("alpha", 1.0), ("beta", 1.0)]);

        assert_eq!(collector.context().counters.value(FAMILY, &alpha()), Some(1.0));
    }

    #[tokio::test]
    async fn test_cache_hit_does_not_count_twice() {
        let testbed = Testbed::new();
        let collector = collector(&testbed);
        let ttl = Duration::from_secs(300);

        Arc::clone(&collector).render(ttl).await.unwrap();
        let text = String::from_utf8(Arc::clone(&collector).render(ttl).await.unwrap()).unwrap();

        assert!(text.contains("# TYPE launch_failure counter\n"));
        assert!(text.contains("launch_failure{region=\"r1\",project_id=\"p1\",project_name=\"alpha\"} 1\n"));
    }
}
