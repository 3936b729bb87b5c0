//! The four app feeds. Each runs until its connection goes away or the session
//! switches feed; transient fetch errors never end a feed.
use futures_util::{future::join_all, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::WatchEvent;
use rustc_hash::FxHasher;
use std::{collections::{HashMap, HashSet}, hash::{Hash, Hasher}, time::Duration};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, warn};
use crate::cluster::ClusterError;
use crate::config::{EVENT_POLL_INTERVAL, INSTANCE_ADD_PACING, USAGE_POLL_INTERVAL};
use super::{backoff_retry, APP_DELETED};
use super::podinfo::{event_summaries, instance_summary, round_to, workload_status, InstanceSummary};
use super::protocol::{FeedKind, InstanceData, InstanceEvent, InstanceUpdate, ServerFrame, UsageSnapshot};
use super::session::{FeedContext, FrameSink};
use super::source::WorkloadEvent;

const RETRY_BASE: Duration = Duration::from_millis(500);
const RETRY_MAX: Duration = Duration::from_secs(10);

/// Traffic-proxy counters, in snapshot order.
const TRAFFIC_COUNTERS: [&str; 3] = [
    "traefik_service_responses_bytes_total",
    "traefik_service_requests_bytes_total",
    "traefik_service_requests_total",
];

pub async fn run(kind: FeedKind, ctx: FeedContext, sink: FrameSink) {
    match kind {
        FeedKind::Instances => instances(ctx, sink).await,
        FeedKind::Stat => stat(ctx, sink).await,
        FeedKind::Events => events(ctx, sink).await,
        FeedKind::Usage => usage(ctx, sink).await,
    }
}

fn content_hash(payload: &str) -> u64 {
    let mut h = FxHasher::default();
    payload.hash(&mut h);
    h.finish()
}

/// Remembers the last payload sent so identical polls stay silent.
#[derive(Default)]
struct Dedup { last: Option<u64> }

impl Dedup {
    fn is_new(&mut self, payload: &str) -> bool {
        let h = content_hash(payload);
        if self.last == Some(h) { return false; }
        self.last = Some(h);
        true
    }
}

/// Why a watch pass ended.
enum WatchEnd { Relist, Rewatch, Disconnected }

async fn instances(ctx: FeedContext, sink: FrameSink) {
    let mut attempt = 0u32;
    // Instances whose status was not populated when last seen.
    let mut dismissed: HashSet<String> = HashSet::new();
    // Last summary the client holds for each instance.
    let mut shown: HashMap<String, InstanceSummary> = HashMap::new();
    loop {
        let list = match ctx.feeds.list_instances(&ctx.namespace, &ctx.appid).await {
            Ok(l) => l,
            Err(e) => {
                warn!(error=%e, appid=%ctx.appid, "instances_list_failed");
                attempt += 1;
                backoff_retry(attempt, RETRY_BASE, RETRY_MAX).await;
                continue;
            }
        };
        let mut pods = list.items;
        pods.sort_by_key(|p| p.metadata.creation_timestamp.as_ref().map(|t| t.0));
        dismissed.clear();
        // Instances that vanished while no watch was running.
        let listed: HashSet<String> = pods.iter().filter_map(|p| p.metadata.name.clone()).collect();
        let vanished: Vec<String> = shown.keys().filter(|iref| !listed.contains(*iref)).cloned().collect();
        for iref in vanished {
            if let Some(summary) = shown.remove(&iref) {
                if !sink.send_frame(&ServerFrame::Instance(InstanceUpdate::new(InstanceEvent::Delete, summary))).await { return; }
            }
        }
        for pod in &pods {
            let summary = instance_summary(pod);
            if summary.state.is_none() {
                dismissed.insert(summary.iref);
                continue;
            }
            shown.insert(summary.iref.clone(), summary.clone());
            if !sink.send_frame(&ServerFrame::Instance(InstanceUpdate::new(InstanceEvent::Add, summary))).await { return; }
            sleep(INSTANCE_ADD_PACING).await;
        }

        let mut rv = list.resource_version;
        loop {
            match watch_instances(&ctx, &sink, &mut rv, &mut dismissed, &mut shown, &mut attempt).await {
                WatchEnd::Disconnected => return,
                WatchEnd::Relist => break,
                WatchEnd::Rewatch => {}
            }
        }
    }
}

async fn watch_instances(ctx: &FeedContext, sink: &FrameSink, rv: &mut String, dismissed: &mut HashSet<String>, shown: &mut HashMap<String, InstanceSummary>, attempt: &mut u32) -> WatchEnd {
    let mut stream = match ctx.feeds.watch_instances(&ctx.namespace, &ctx.appid, rv).await {
        Ok(s) => s,
        Err(ClusterError::Expired(_)) => return WatchEnd::Relist,
        Err(e) => {
            warn!(error=%e, appid=%ctx.appid, "instances_watch_failed");
            *attempt += 1;
            backoff_retry(*attempt, RETRY_BASE, RETRY_MAX).await;
            return WatchEnd::Rewatch;
        }
    };
    while let Some(item) = stream.next().await {
        let update = match item {
            Ok(WatchEvent::Added(pod)) => {
                *attempt = 0;
                match observe(&pod, rv, dismissed, InstanceEvent::Add) { Some(u) => u, None => continue }
            }
            Ok(WatchEvent::Modified(pod)) => {
                *attempt = 0;
                match observe(&pod, rv, dismissed, InstanceEvent::Modify) { Some(u) => u, None => continue }
            }
            Ok(WatchEvent::Deleted(pod)) => {
                if let Some(v) = &pod.metadata.resource_version { rv.clone_from(v); }
                let summary = instance_summary(&pod);
                dismissed.remove(&summary.iref);
                shown.remove(&summary.iref);
                InstanceUpdate::new(InstanceEvent::Delete, summary)
            }
            Ok(WatchEvent::Bookmark(b)) => {
                rv.clone_from(&b.metadata.resource_version);
                continue;
            }
            Ok(WatchEvent::Error(e)) if e.code == 410 => return WatchEnd::Relist,
            Ok(WatchEvent::Error(e)) => InstanceUpdate::error(e.message),
            Err(ClusterError::Expired(_)) => return WatchEnd::Relist,
            Err(e) => {
                warn!(error=%e, appid=%ctx.appid, "instances_watch_interrupted");
                *attempt += 1;
                backoff_retry(*attempt, RETRY_BASE, RETRY_MAX).await;
                return WatchEnd::Rewatch;
            }
        };
        if let InstanceData::Instance(summary) = &update.data {
            if update.event != InstanceEvent::Delete { shown.insert(summary.iref.clone(), summary.clone()); }
        }
        if !sink.send_frame(&ServerFrame::Instance(update)).await { return WatchEnd::Disconnected; }
    }
    debug!(appid=%ctx.appid, "instances_watch_ended");
    WatchEnd::Rewatch
}

/// `None` while the instance status is not populated; the instance is then
/// remembered so its next event is announced as an add.
fn observe(pod: &Pod, rv: &mut String, dismissed: &mut HashSet<String>, event: InstanceEvent) -> Option<InstanceUpdate> {
    if let Some(v) = &pod.metadata.resource_version { rv.clone_from(v); }
    let summary = instance_summary(pod);
    if summary.state.is_none() {
        dismissed.insert(summary.iref);
        return None;
    }
    let event = if dismissed.remove(&summary.iref) { InstanceEvent::Add } else { event };
    Some(InstanceUpdate::new(event, summary))
}

async fn stat(ctx: FeedContext, sink: FrameSink) {
    let mut attempt = 0u32;
    loop {
        match ctx.feeds.watch_workload(&ctx.namespace, &ctx.appid).await {
            Ok(mut stream) => {
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(WorkloadEvent::Applied(d)) => {
                            attempt = 0;
                            if !sink.send_frame(&ServerFrame::Stat(workload_status(&d))).await { return; }
                        }
                        Ok(WorkloadEvent::Deleted) => {
                            sink.close_with(APP_DELETED).await;
                            return;
                        }
                        Err(e) => {
                            warn!(error=%e, appid=%ctx.appid, "stat_watch_interrupted");
                            break;
                        }
                    }
                }
            }
            Err(e) => warn!(error=%e, appid=%ctx.appid, "stat_watch_failed"),
        }
        attempt += 1;
        backoff_retry(attempt, RETRY_BASE, RETRY_MAX).await;
    }
}

async fn events(ctx: FeedContext, sink: FrameSink) {
    let mut ticker = interval(EVENT_POLL_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut dedup = Dedup::default();
    loop {
        ticker.tick().await;
        match ctx.feeds.list_events(&ctx.namespace, &ctx.appid).await {
            Ok(evs) => {
                let payload = ServerFrame::Events(event_summaries(&evs)).encode();
                if dedup.is_new(&payload) && !sink.send_text(payload).await { return; }
            }
            Err(e) if e.is_gone() => {
                sink.close_with(APP_DELETED).await;
                return;
            }
            Err(e) => warn!(error=%e, appid=%ctx.appid, "events_poll_failed"),
        }
    }
}

async fn usage(ctx: FeedContext, sink: FrameSink) {
    let mut ticker = interval(USAGE_POLL_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut dedup = Dedup::default();
    loop {
        ticker.tick().await;
        match collect_usage(&ctx).await {
            Ok(snapshot) => {
                let payload = ServerFrame::Usage(snapshot).encode();
                if dedup.is_new(&payload) && !sink.send_text(payload).await { return; }
            }
            Err(e) => warn!(error=%e, appid=%ctx.appid, "usage_poll_failed"),
        }
    }
}

pub fn traffic_queries(namespace: &str, appid: &str) -> [String; 3] {
    TRAFFIC_COUNTERS.map(|m| format!("sum({m}{{service=~\"{namespace}-route-{appid}.*\"}})"))
}

/// Traffic counters and per-instance usage, fetched concurrently. A failed
/// traffic query fails the whole tick; a failed instance counts as idle.
async fn collect_usage(ctx: &FeedContext) -> Result<UsageSnapshot, ClusterError> {
    let queries = traffic_queries(&ctx.namespace, &ctx.appid);
    let traffic = join_all(queries.iter().map(|q| ctx.feeds.traffic_counter(q)));
    let resources = async {
        let names = ctx.feeds.instance_names(&ctx.namespace, &ctx.appid).await?;
        let usages = join_all(names.iter().map(|n| ctx.feeds.instance_usage(&ctx.namespace, n))).await;
        Ok::<_, ClusterError>(usages.into_iter().fold((0.0, 0.0), |(cpu, mem), u| match u {
            Ok(u) => (cpu + u.cpu, mem + u.memory),
            Err(e) => { debug!(error=%e, "instance_usage_unavailable"); (cpu, mem) }
        }))
    };
    let (traffic, resources) = tokio::join!(traffic, resources);
    let mut counters = [0.0; 3];
    for (slot, value) in counters.iter_mut().zip(traffic) { *slot = value?; }
    let (cpu, memory) = resources?;
    Ok(UsageSnapshot {
        response_bytes: counters[0],
        request_bytes: counters[1],
        request_count: counters[2],
        cpu: round_to(cpu, 2),
        memory: round_to(memory, 2),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_suppresses_repeats_only() {
        let mut d = Dedup::default();
        assert!(d.is_new("a"));
        assert!(!d.is_new("a"));
        assert!(d.is_new("b"));
        assert!(d.is_new("a"));
    }

    #[test]
    fn traffic_queries_target_app_routes() {
        let q = traffic_queries("ns1", "a1");
        assert_eq!(q[2], r#"sum(traefik_service_requests_total{service=~"ns1-route-a1.*"})"#);
    }
}
