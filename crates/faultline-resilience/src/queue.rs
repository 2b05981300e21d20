//! ---
//! fl_section: "02-resilience-fault-tolerance"
//! fl_subsection: "module"
//! fl_type: "source"
//! fl_scope: "code"
//! fl_description: "Bounded, age-limited deferred work queue."
//! fl_version: "v0.0.0-prealpha"
//! fl_owner: "tbd"
//! ---
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use faultline_common::QueueConfig;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ResilienceError, Result};
use crate::events::{FailureEvent, FailureSink};
use crate::metrics::ResilienceMetrics;
use crate::operation::{Operation, OperationContext};

/// Deferred unit of work.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem {
    pub id: Uuid,
    pub payload: Value,
    pub enqueued_at: Instant,
    pub retry_count: u32,
}

impl QueueItem {
    pub fn new(payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            enqueued_at: Instant::now(),
            retry_count: 0,
        }
    }
}

/// What [`RetryQueue::process_one`] did with an item.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessResult {
    Completed,
    Requeued,
    Dropped(FailureEvent),
}

/// Final fate of an item, kept until claimed with [`RetryQueue::take_settled`].
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    Completed { attempts: u32 },
    Dropped(FailureEvent),
}

#[derive(Debug, Default)]
pub struct DrainReport {
    pub completed: usize,
    pub dropped: Vec<FailureEvent>,
}

/// FIFO of failed work retried on a fixed poll interval.
#[derive(Debug)]
pub struct RetryQueue {
    config: QueueConfig,
    items: Mutex<VecDeque<QueueItem>>,
    settled: Mutex<HashMap<Uuid, Settlement>>,
    metrics: Option<ResilienceMetrics>,
    sink: Option<Arc<dyn FailureSink>>,
}

impl RetryQueue {
    pub fn new(config: QueueConfig, metrics: Option<ResilienceMetrics>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            items: Mutex::new(VecDeque::with_capacity(config.capacity)),
            settled: Mutex::new(HashMap::new()),
            metrics,
            sink: None,
        })
    }

    /// Report every dropped item to `sink` as well as to its waiting run.
    pub fn with_sink(mut self, sink: Arc<dyn FailureSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Append `item`, rejecting it when the queue is full.
    pub fn enqueue(&self, item: QueueItem) -> Result<Uuid> {
        let mut items = self.items.lock();
        if items.len() >= self.config.capacity {
            drop(items);
            if let Some(metrics) = &self.metrics {
                metrics.inc_queue_rejection();
            }
            warn!(
                target: "faultline::resilience::queue",
                item = %item.id,
                capacity = self.config.capacity,
                "retry queue full; rejecting item",
            );
            return Err(ResilienceError::CapacityExceeded {
                capacity: self.config.capacity,
            });
        }
        let id = item.id;
        items.push_back(item);
        Ok(id)
    }

    pub fn pop(&self) -> Option<QueueItem> {
        self.items.lock().pop_front()
    }

    /// Run `operation` once for `item`; requeue or drop it on failure.
    ///
    /// If the returned future is dropped mid-call the item is settled as
    /// dropped, so its waiting run never polls for an item nobody holds.
    pub async fn process_one(
        &self,
        mut item: QueueItem,
        operation: &dyn Operation,
        context: &OperationContext,
    ) -> ProcessResult {
        let attempt = item.retry_count + 1;
        let in_flight = InFlight {
            queue: self,
            id: item.id,
            attempt,
            context,
            armed: true,
        };
        let result = operation.invoke(&context.with_attempt(attempt)).await;
        in_flight.disarm();
        let err = match result {
            Ok(()) => {
                debug!(target: "faultline::resilience::queue", item = %item.id, attempt, "queued item completed");
                self.settle(item.id, Settlement::Completed { attempts: attempt });
                return ProcessResult::Completed;
            }
            Err(err) => err,
        };

        item.retry_count += 1;
        let within_age = item.enqueued_at.elapsed() <= self.config.max_age;
        if item.retry_count < self.config.max_retries_per_item && within_age {
            let mut items = self.items.lock();
            if items.len() < self.config.capacity {
                items.push_back(item);
                return ProcessResult::Requeued;
            }
        }

        let reason = if !within_age {
            format!("item {} expired after {} attempts: {err}", item.id, item.retry_count)
        } else {
            format!("item {} dropped after {} attempts: {err}", item.id, item.retry_count)
        };
        self.drop_item(item.id, context, err.kind(), reason)
    }

    /// Poll the queue every `retry_interval` until it is empty.
    ///
    /// Each tick attempts every item present at the start of the tick once.
    pub async fn drain(&self, operation: &dyn Operation, context: &OperationContext) -> DrainReport {
        let mut ticker = interval(self.config.retry_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut report = DrainReport::default();
        loop {
            ticker.tick().await;
            let batch = self.len();
            if batch == 0 {
                break;
            }
            for _ in 0..batch {
                let Some(item) = self.pop() else {
                    break;
                };
                if item.enqueued_at.elapsed() > self.config.max_age {
                    let reason = format!("item {} expired in queue", item.id);
                    if let ProcessResult::Dropped(event) =
                        self.drop_item(item.id, context, "expired", reason)
                    {
                        report.dropped.push(event);
                    }
                    continue;
                }
                match self.process_one(item, operation, context).await {
                    ProcessResult::Completed => report.completed += 1,
                    ProcessResult::Requeued => {}
                    ProcessResult::Dropped(event) => report.dropped.push(event),
                }
            }
        }
        report
    }

    /// Claim the final outcome of an item processed by any drainer.
    pub fn take_settled(&self, id: &Uuid) -> Option<Settlement> {
        self.settled.lock().remove(id)
    }

    pub fn clear(&self) {
        self.items.lock().clear();
        self.settled.lock().clear();
    }

    fn drop_item(
        &self,
        id: Uuid,
        context: &OperationContext,
        error_kind: &str,
        reason: String,
    ) -> ProcessResult {
        warn!(
            target: "faultline::resilience::queue",
            component = %context.component_id,
            scenario = %context.scenario,
            item = %id,
            "{reason}",
        );
        let event = FailureEvent::new(&context.scenario, &context.component_id, error_kind, reason);
        if let Some(sink) = &self.sink {
            sink.record_failure(event.clone());
        }
        self.settle(id, Settlement::Dropped(event.clone()));
        ProcessResult::Dropped(event)
    }

    fn settle(&self, id: Uuid, settlement: Settlement) {
        self.settled.lock().insert(id, settlement);
    }
}

/// An item popped from the queue whose attempt has not returned yet.
struct InFlight<'a> {
    queue: &'a RetryQueue,
    id: Uuid,
    attempt: u32,
    context: &'a OperationContext,
    armed: bool,
}

impl InFlight<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let reason = format!("item {} abandoned during attempt {}", self.id, self.attempt);
        self.queue.drop_item(self.id, self.context, "cancelled", reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::MetricsAggregator;
    use crate::operation::FnOperation;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn queue(capacity: usize) -> RetryQueue {
        RetryQueue::new(
            QueueConfig {
                capacity,
                retry_interval: Duration::from_millis(50),
                max_age: Duration::from_secs(1),
                max_retries_per_item: 3,
            },
            None,
        )
        .unwrap()
    }

    fn ctx() -> OperationContext {
        OperationContext::new("notification_dispatch", "queue-test")
    }

    #[test]
    fn third_item_is_rejected_at_capacity_two() {
        let queue = queue(2);
        queue.enqueue(QueueItem::new(json!({"n": 1}))).unwrap();
        queue.enqueue(QueueItem::new(json!({"n": 2}))).unwrap();
        let err = queue.enqueue(QueueItem::new(json!({"n": 3}))).unwrap_err();
        assert_eq!(err, ResilienceError::CapacityExceeded { capacity: 2 });
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_items_leave_within_bound() {
        let queue = queue(4);
        let op = FnOperation::new("mail", |_ctx: OperationContext| async {
            Err::<(), _>(ResilienceError::Transient("smtp refused".into()))
        });
        let started = Instant::now();
        let ids: Vec<_> = (0..3)
            .map(|n| queue.enqueue(QueueItem::new(json!({ "n": n }))).unwrap())
            .collect();
        let report = queue.drain(&op, &ctx()).await;
        let config = queue.config();
        let bound = config.max_age + config.retry_interval * config.max_retries_per_item;
        assert!(queue.is_empty());
        assert_eq!(report.completed, 0);
        assert_eq!(report.dropped.len(), 3);
        assert!(started.elapsed() <= bound);
        for id in ids {
            assert!(matches!(queue.take_settled(&id), Some(Settlement::Dropped(_))));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn flaky_item_completes_on_retry() {
        let queue = queue(2);
        let calls = Arc::new(AtomicU32::new(0));
        let op = {
            let calls = calls.clone();
            FnOperation::new("mail", move |_ctx: OperationContext| {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(ResilienceError::Transient("first send failed".into()))
                    } else {
                        Ok(())
                    }
                }
            })
        };
        let id = queue.enqueue(QueueItem::new(json!("welcome"))).unwrap();
        let report = queue.drain(&op, &ctx()).await;
        assert_eq!(report.completed, 1);
        assert!(report.dropped.is_empty());
        assert_eq!(
            queue.take_settled(&id),
            Some(Settlement::Completed { attempts: 2 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stale_items_expire_without_another_attempt() {
        let queue = queue(2);
        let calls = Arc::new(AtomicU32::new(0));
        let op = {
            let calls = calls.clone();
            FnOperation::new("mail", move |_ctx: OperationContext| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
        };
        queue.enqueue(QueueItem::new(json!(null))).unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        let report = queue.drain(&op, &ctx()).await;
        assert_eq!(report.dropped.len(), 1);
        assert_eq!(report.dropped[0].error_kind, "expired");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_attempt_settles_its_item() {
        let queue = queue(2);
        let op = FnOperation::new("mail", |_ctx: OperationContext| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        });
        let id = queue.enqueue(QueueItem::new(json!("digest"))).unwrap();
        let cut_short =
            tokio::time::timeout(Duration::from_millis(100), queue.drain(&op, &ctx())).await;
        assert!(cut_short.is_err());

        assert!(queue.is_empty());
        let Some(Settlement::Dropped(event)) = queue.take_settled(&id) else {
            panic!("abandoned item must be settled as dropped");
        };
        assert_eq!(event.error_kind, "cancelled");
        assert!(event.message.contains("attempt 1"));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_items_reach_the_failure_sink() {
        let aggregator = Arc::new(MetricsAggregator::new());
        let queue = queue(2).with_sink(aggregator.clone());
        let op = FnOperation::new("mail", |_ctx: OperationContext| async {
            Err::<(), _>(ResilienceError::Transient("smtp refused".into()))
        });
        queue.enqueue(QueueItem::new(json!("receipt"))).unwrap();
        let report = queue.drain(&op, &ctx()).await;
        assert_eq!(report.dropped.len(), 1);

        let summary = aggregator.summarize(Vec::new());
        assert_eq!(summary.failure_events, report.dropped);
        assert_eq!(summary.failure_events[0].component_id, "notification_dispatch");
        // Queue losses are not scenario results.
        assert_eq!(summary.total, 0);
    }
}
