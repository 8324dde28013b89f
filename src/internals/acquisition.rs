use std::{
    collections::{BTreeMap, VecDeque},
    time::Duration,
};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    time::{self, Instant, Interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::models::{channel::Channel, row::Row};

/// How samples from independently timed devices are joined into rows.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum JoinPolicy {
    /// Append a row every tick; channels that didn't report carry their
    /// previous value forward.
    #[default]
    SampleAndHold,

    /// Append a row only once every `required` channel has reported since
    /// the previous row.
    Strict { required: Vec<Channel> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionSettings {
    /// Row count that triggers a compaction.
    pub capacity: usize,

    /// Rows kept by a compaction.
    pub keep: usize,

    pub policy: JoinPolicy,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            capacity: 20_000,
            keep: 3_000,
            policy: JoinPolicy::SampleAndHold,
        }
    }
}

/// Append-only table of rows, owned by the acquisition task.
pub struct AcquisitionBuffer {
    settings: AcquisitionSettings,
    rows: VecDeque<Row>,
    pending: BTreeMap<Channel, f64>,
    started: Instant,
}

impl AcquisitionBuffer {
    pub fn new(settings: AcquisitionSettings) -> Self {
        Self {
            settings,
            rows: VecDeque::new(),
            pending: BTreeMap::new(),
            started: Instant::now(),
        }
    }

    /// Remember `value` for the next row. Later values for the same channel
    /// replace earlier ones.
    pub fn collect(&mut self, channel: Channel, value: f64) {
        self.pending.insert(channel, value);
    }

    pub fn tick(&mut self) -> Option<Row> {
        self.tick_at(Instant::now(), Local::now())
    }

    /// Turn everything collected since the previous row into a new row.
    /// Returns `None` when the join policy holds the row back.
    pub fn tick_at(&mut self, now: Instant, datetime: DateTime<Local>) -> Option<Row> {
        if let JoinPolicy::Strict { required } = &self.settings.policy {
            if let Some(missing) = required.iter().find(|c| !self.pending.contains_key(*c)) {
                trace!("Holding row back, {} hasn't reported.", missing);
                return None;
            }
        }

        let mut values = self
            .rows
            .back()
            .map(|row| row.values.clone())
            .unwrap_or_default();
        values.append(&mut self.pending);

        let mut time = now.saturating_duration_since(self.started).as_secs_f64();
        if let Some(last) = self.rows.back() {
            time = time.max(last.time);
        }

        let row = Row {
            time,
            datetime,
            values,
        };
        self.rows.push_back(row.clone());
        self.compact();
        Some(row)
    }

    fn compact(&mut self) {
        if self.rows.len() <= self.settings.capacity {
            return;
        }
        let keep = self.settings.keep.min(self.settings.capacity);
        let excess = self.rows.len() - keep;
        self.rows.drain(..excess);
        debug!("Compacted table, dropped {} rows.", excess);
    }

    /// Drop every row and restart the clock.
    pub fn clear(&mut self) {
        self.rows.clear();
        self.pending.clear();
        self.started = Instant::now();
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn last(&self) -> Option<&Row> {
        self.rows.back()
    }

    pub fn rows(&self) -> impl Iterator<Item = &Row> {
        self.rows.iter()
    }
}

#[derive(Debug)]
pub enum AcquisitionCommand {
    Start,
    Stop,
    SetInterval(Duration),
    Clear,
    Snapshot(oneshot::Sender<Vec<Row>>),
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionError {
    #[error("The acquisition task is not running.")]
    Closed,

    #[error("The acquisition interval must be positive.")]
    InvalidInterval,
}

/// Cheap, cloneable access to the acquisition task.
#[derive(Clone, Debug)]
pub struct AcquisitionHandle {
    tx_commands: mpsc::UnboundedSender<AcquisitionCommand>,
    tx_values: mpsc::UnboundedSender<(Channel, f64)>,
}

impl AcquisitionHandle {
    pub fn collect(&self, channel: Channel, value: f64) -> Result<(), AcquisitionError> {
        self.tx_values
            .send((channel, value))
            .map_err(|_| AcquisitionError::Closed)
    }

    pub fn start(&self) -> Result<(), AcquisitionError> {
        self.command(AcquisitionCommand::Start)
    }

    pub fn stop(&self) -> Result<(), AcquisitionError> {
        self.command(AcquisitionCommand::Stop)
    }

    pub fn clear(&self) -> Result<(), AcquisitionError> {
        self.command(AcquisitionCommand::Clear)
    }

    pub fn set_interval(&self, interval: Duration) -> Result<(), AcquisitionError> {
        if interval.is_zero() {
            return Err(AcquisitionError::InvalidInterval);
        }
        self.command(AcquisitionCommand::SetInterval(interval))
    }

    /// Copy of the whole table.
    pub async fn snapshot(&self) -> Result<Vec<Row>, AcquisitionError> {
        let (tx, rx) = oneshot::channel();
        self.command(AcquisitionCommand::Snapshot(tx))?;
        rx.await.map_err(|_| AcquisitionError::Closed)
    }

    fn command(&self, command: AcquisitionCommand) -> Result<(), AcquisitionError> {
        self.tx_commands
            .send(command)
            .map_err(|_| AcquisitionError::Closed)
    }
}

/// Receiving ends of an `AcquisitionHandle`.
pub struct AcquisitionInbox {
    rx_commands: mpsc::UnboundedReceiver<AcquisitionCommand>,
    rx_values: mpsc::UnboundedReceiver<(Channel, f64)>,
}

#[cfg(test)]
impl AcquisitionInbox {
    pub(crate) fn try_next_value(&mut self) -> Option<(Channel, f64)> {
        self.rx_values.try_recv().ok()
    }

    pub(crate) fn try_next_command(&mut self) -> Option<AcquisitionCommand> {
        self.rx_commands.try_recv().ok()
    }
}

pub fn acquisition_channel() -> (AcquisitionHandle, AcquisitionInbox) {
    let (tx_commands, rx_commands) = mpsc::unbounded_channel();
    let (tx_values, rx_values) = mpsc::unbounded_channel();
    (
        AcquisitionHandle {
            tx_commands,
            tx_values,
        },
        AcquisitionInbox {
            rx_commands,
            rx_values,
        },
    )
}

/// Shortest tick period; tokio rejects a zero period.
const MIN_PERIOD: Duration = Duration::from_millis(1);

fn ticker(period: Duration) -> Interval {
    let period = period.max(MIN_PERIOD);
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Task: Collect channel values and snapshot them into a row every tick
/// while running. Every appended row is broadcast. Can be cancelled.
#[tracing::instrument(skip_all)]
pub async fn task_acquisition(
    token: CancellationToken,
    mut buffer: AcquisitionBuffer,
    mut period: Duration,
    inbox: AcquisitionInbox,
    tx_rows: broadcast::Sender<Row>,
) {
    info!("Started.");
    let AcquisitionInbox {
        mut rx_commands,
        mut rx_values,
    } = inbox;
    let mut ticker = ticker(period);
    let mut running = false;

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                warn!("Cancelled.");
                break;
            },
            Some(command) = rx_commands.recv() => {
                match command {
                    AcquisitionCommand::Start => {
                        if !running {
                            ticker = self::ticker(period);
                        }
                        running = true;
                        debug!("Collecting.");
                    }
                    AcquisitionCommand::Stop => {
                        running = false;
                        debug!("Stopped collecting.");
                    }
                    AcquisitionCommand::SetInterval(new_period) => {
                        info!("Interval {:?} -> {:?}.", period, new_period);
                        ticker = self::ticker(new_period);
                        period = new_period;
                    }
                    AcquisitionCommand::Clear => buffer.clear(),
                    AcquisitionCommand::Snapshot(reply) => {
                        if reply.send(buffer.rows().cloned().collect()).is_err() {
                            debug!("Snapshot requester went away.");
                        }
                    }
                }
            },
            Some((channel, value)) = rx_values.recv() => {
                buffer.collect(channel, value);
            },
            _ = ticker.tick(), if running => {
                if let Some(row) = buffer.tick() {
                    trace!("Appended {}.", row);
                    if tx_rows.send(row).is_err() {
                        trace!("No row subscribers.");
                    }
                }
            }
        }
    }
}
