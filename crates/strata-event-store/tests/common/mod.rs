//! Counter aggregate shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use strata_core::aggregate::{Aggregate, AggregateModel};
use strata_core::command::Command;
use strata_core::error::DomainError;
use strata_core::event::{Event, EventIter, Model};
use strata_core::retry::DefaultRetry;
use strata_core::store::EventStore;
use uuid::Uuid;

pub const GROUP: &str = "a0c5e8f2-7b41-4d3a-9c55-000000000001";
pub const COUNTER: &str = "c7d2b1e0-4f6a-4b8e-8d21-000000000001";

fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CounterChange {
    Added { amount: i64 },
    Snapshot { total: i64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CounterEvent {
    pub version: u64,
    pub group_id: String,
    pub aggregate_id: String,
    pub timestamp: DateTime<Utc>,
    pub change: CounterChange,
}

impl CounterEvent {
    pub fn new(group_id: &str, aggregate_id: &str, version: u64, change: CounterChange) -> Self {
        Self {
            version,
            group_id: group_id.to_owned(),
            aggregate_id: aggregate_id.to_owned(),
            timestamp: base() + Duration::seconds(i64::try_from(version).unwrap()),
            change,
        }
    }
}

impl Event for CounterEvent {
    fn version(&self) -> u64 {
        self.version
    }

    fn event_type(&self) -> &str {
        match self.change {
            CounterChange::Added { .. } => "counter_added",
            CounterChange::Snapshot { .. } => "counter_snapshot",
        }
    }

    fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    fn group_id(&self) -> &str {
        &self.group_id
    }

    fn is_snapshot(&self) -> bool {
        matches!(self.change, CounterChange::Snapshot { .. })
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn to_payload(&self) -> Result<serde_json::Value, DomainError> {
        serde_json::to_value(&self.change).map_err(|source| DomainError::Encode {
            event_type: self.event_type().to_owned(),
            source,
        })
    }
}

#[derive(Debug)]
pub enum CounterCommand {
    Add(Vec<i64>),
    Noop,
    Reject,
}

impl Command for CounterCommand {
    fn command_type(&self) -> &'static str {
        match self {
            Self::Add(_) => "counter.add",
            Self::Noop => "counter.noop",
            Self::Reject => "counter.reject",
        }
    }

    fn correlation_id(&self) -> Uuid {
        Uuid::nil()
    }
}

#[derive(Debug, Default)]
pub struct Counter {
    pub group_id: String,
    pub aggregate_id: String,
    pub total: i64,
    pub applied: Vec<u64>,
}

impl Counter {
    pub fn new(group_id: &str, aggregate_id: &str) -> Self {
        Self {
            group_id: group_id.to_owned(),
            aggregate_id: aggregate_id.to_owned(),
            ..Self::default()
        }
    }
}

#[async_trait]
impl Model for Counter {
    async fn handle(&mut self, iter: &mut dyn EventIter) -> Result<(), DomainError> {
        while let Some(event) = iter.next().await? {
            match event.decode::<CounterChange>()? {
                CounterChange::Added { amount } => self.total += amount,
                CounterChange::Snapshot { total } => self.total = total,
            }
            self.applied.push(event.version());
        }
        Ok(())
    }
}

impl AggregateModel for Counter {
    type Command = CounterCommand;
    type Event = CounterEvent;

    fn handle_command(
        &self,
        command: &CounterCommand,
        new_version: u64,
    ) -> Result<Vec<CounterEvent>, DomainError> {
        match command {
            CounterCommand::Add(amounts) => Ok(amounts
                .iter()
                .zip(new_version..)
                .map(|(amount, version)| {
                    CounterEvent::new(
                        &self.group_id,
                        &self.aggregate_id,
                        version,
                        CounterChange::Added { amount: *amount },
                    )
                })
                .collect()),
            CounterCommand::Noop => Ok(Vec::new()),
            CounterCommand::Reject => Err(DomainError::Validation("rejected".into())),
        }
    }

    fn take_snapshot(&self, version: u64) -> Option<CounterEvent> {
        Some(CounterEvent::new(
            &self.group_id,
            &self.aggregate_id,
            version,
            CounterChange::Snapshot { total: self.total },
        ))
    }

    fn group_id(&self) -> &str {
        &self.group_id
    }
}

pub fn fast_retry(limit: u32) -> DefaultRetry {
    DefaultRetry::new(
        limit,
        std::time::Duration::from_millis(1),
        std::time::Duration::from_millis(2),
    )
}

pub fn counter_aggregate(
    store: Arc<dyn EventStore>,
    threshold: u64,
    retry: DefaultRetry,
) -> Aggregate<Counter> {
    Aggregate::new(
        GROUP,
        COUNTER,
        threshold,
        retry,
        store,
        Arc::new(|| Ok::<_, DomainError>(Counter::new(GROUP, COUNTER))),
    )
    .unwrap()
}

pub fn versions(events: &[CounterEvent]) -> Vec<u64> {
    events.iter().map(|e| e.version).collect()
}
