use std::collections::VecDeque;
use std::sync::{Mutex, OnceLock};

use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use agentmux_protocol::event::{AppEvent, MessagePriority};

pub const DEFAULT_CRITICAL_LANE_CAPACITY: usize = 256;
pub const DEFAULT_NORMAL_LANE_CAPACITY: usize = 1_024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpConfig {
    pub critical_lane_capacity: usize,
    pub normal_lane_capacity: usize,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            critical_lane_capacity: DEFAULT_CRITICAL_LANE_CAPACITY,
            normal_lane_capacity: DEFAULT_NORMAL_LANE_CAPACITY,
        }
    }
}

/// Monotone drop counters; each increment corresponds to exactly one enqueue
/// call that will never produce a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PumpStats {
    pub dropped_critical: u64,
    pub dropped_normal: u64,
}

#[derive(Debug, Error)]
#[error("pump message sender already registered")]
pub struct SenderAlreadyRegistered;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PumpRunError {
    #[error("pump consumer started before a message sender was registered")]
    SenderNotRegistered,
    #[error("pump message sender closed")]
    SenderClosed,
}

#[derive(Debug, Default)]
struct Lanes {
    critical: VecDeque<AppEvent>,
    normal: VecDeque<AppEvent>,
    dropped_critical: u64,
    dropped_normal: u64,
}

/// Two bounded FIFO lanes plus a single consumer loop.
///
/// The lanes are the only structure in this subsystem touched by more than
/// one task; producers hold the lock only for a push, so `enqueue` never
/// blocks for longer than a queue operation and never awaits.
#[derive(Debug)]
pub struct MessagePump {
    config: PumpConfig,
    lanes: Mutex<Lanes>,
    available: Notify,
    sender: OnceLock<UnboundedSender<AppEvent>>,
}

impl Default for MessagePump {
    fn default() -> Self {
        Self::new(PumpConfig::default())
    }
}

impl MessagePump {
    pub fn new(config: PumpConfig) -> Self {
        assert!(
            config.critical_lane_capacity > 0,
            "critical_lane_capacity must be greater than 0"
        );
        assert!(
            config.normal_lane_capacity > 0,
            "normal_lane_capacity must be greater than 0"
        );
        Self {
            config,
            lanes: Mutex::new(Lanes::default()),
            available: Notify::new(),
            sender: OnceLock::new(),
        }
    }

    /// Installs the delivery target. The sender can be registered exactly
    /// once; a duplicate registration during startup is rejected rather than
    /// silently replacing the consumer.
    pub fn set_message_sender(
        &self,
        sender: UnboundedSender<AppEvent>,
    ) -> Result<(), SenderAlreadyRegistered> {
        if self.sender.set(sender).is_err() {
            tracing::warn!("rejected duplicate pump message sender registration");
            return Err(SenderAlreadyRegistered);
        }
        Ok(())
    }

    /// Classifies and inserts `event` without ever blocking the caller.
    ///
    /// A full critical lane evicts the oldest pending normal message to
    /// admit the new one; with nothing to evict the new message is dropped
    /// and counted. A full normal lane drops the new message and counts it.
    pub fn enqueue(&self, event: AppEvent) {
        let priority = event.priority();
        let mut lanes = self.lanes.lock().expect("pump lane lock poisoned");
        match priority {
            MessagePriority::Critical => {
                if lanes.critical.len() >= self.config.critical_lane_capacity {
                    if lanes.normal.pop_front().is_some() {
                        // The sacrificed message will never be delivered.
                        lanes.dropped_normal += 1;
                        lanes.critical.push_back(event);
                    } else {
                        lanes.dropped_critical += 1;
                        tracing::warn!(
                            dropped_critical = lanes.dropped_critical,
                            "critical lane full, message dropped"
                        );
                        return;
                    }
                } else {
                    lanes.critical.push_back(event);
                }
            }
            MessagePriority::Normal => {
                if lanes.normal.len() >= self.config.normal_lane_capacity {
                    lanes.dropped_normal += 1;
                    tracing::debug!(
                        dropped_normal = lanes.dropped_normal,
                        "normal lane full, message dropped"
                    );
                    return;
                }
                lanes.normal.push_back(event);
            }
        }
        drop(lanes);
        self.available.notify_one();
    }

    pub fn stats(&self) -> PumpStats {
        let lanes = self.lanes.lock().expect("pump lane lock poisoned");
        PumpStats {
            dropped_critical: lanes.dropped_critical,
            dropped_normal: lanes.dropped_normal,
        }
    }

    fn try_pop(&self) -> Option<AppEvent> {
        let mut lanes = self.lanes.lock().expect("pump lane lock poisoned");
        if let Some(event) = lanes.critical.pop_front() {
            return Some(event);
        }
        lanes.normal.pop_front()
    }

    /// The single consumer loop, run as a supervised worker.
    ///
    /// Each iteration drains the critical lane ahead of the normal lane;
    /// with both lanes empty it waits for a producer or the shutdown signal.
    /// Nothing is forwarded after the loop observes shutdown.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), PumpRunError> {
        let sender = self
            .sender
            .get()
            .ok_or(PumpRunError::SenderNotRegistered)?;

        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }
            if let Some(event) = self.try_pop() {
                if sender.send(event).is_err() {
                    return Err(PumpRunError::SenderClosed);
                }
                continue;
            }
            tokio::select! {
                biased;
                () = shutdown.cancelled() => return Ok(()),
                () = self.available.notified() => {}
            }
        }
    }
}
