//! Timed hardware fades and unacknowledged color streams

use std::time::Duration;

use ilumi_proto::{Color, Command, Transition, ValueOutOfRange};
use serde::{Deserialize, Serialize};
use tokio::time::{Interval, MissedTickBehavior, interval};
use tracing::debug;

use crate::engine::Engine;
use crate::error::Result;
use crate::lease::ScopedConnection;
use crate::result::ExecutionResult;
use crate::topology::DeviceIdentity;
use crate::transport::Transport;

/// How a command reaches its targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routing {
    /// One connection per target, in order
    Sequential,
    /// One proxy packet relayed over the mesh
    Mesh,
}

/// Default fade durations, in milliseconds
///
/// A sequential run over several bulbs defaults to an instant change so
/// that the bulbs finish close together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FadePolicy {
    pub single_ms: u64,
    pub broadcast_ms: u64,
    pub sequential_ms: u64,
}

impl Default for FadePolicy {
    fn default() -> Self {
        Self { single_ms: 500, broadcast_ms: 500, sequential_ms: 0 }
    }
}

impl FadePolicy {
    pub fn duration_ms(&self, targets: usize, routing: Routing, override_ms: Option<u64>) -> u64 {
        match (override_ms, routing) {
            (Some(ms), _) => ms,
            (None, Routing::Mesh) => self.broadcast_ms,
            (None, Routing::Sequential) if targets <= 1 => self.single_ms,
            (None, Routing::Sequential) => self.sequential_ms,
        }
    }

    pub fn resolve(
        &self,
        targets: usize,
        routing: Routing,
        override_ms: Option<u64>,
    ) -> Result<Transition, ValueOutOfRange> {
        Transition::from_millis(self.duration_ms(targets, routing, override_ms))
    }
}

/// Paces stream frames at a fixed rate, skipping ticks the caller missed
pub struct FramePacer {
    interval: Interval,
}

impl FramePacer {
    pub const MAX_FPS: u32 = 20;

    pub fn new(fps: u32) -> Self {
        let fps = fps.clamp(1, Self::MAX_FPS);
        let mut interval = interval(Duration::from_secs(1) / fps);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { interval }
    }

    pub fn period(&self) -> Duration {
        self.interval.period()
    }

    pub async fn tick(&mut self) {
        self.interval.tick().await;
    }
}

/// Raw color frames to one bulb over a single held connection
pub struct ColorStream<T: Transport> {
    engine: Engine<T>,
    conn: ScopedConnection<T::Link>,
    frames: u64,
}

impl<T: Transport> ColorStream<T> {
    /// Write one frame without waiting for an acknowledgment
    pub async fn send(&mut self, color: Color) -> Result<()> {
        self.engine.transmit(&mut self.conn, &Command::SetColor(color)).await?;
        self.frames += 1;
        Ok(())
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames
    }

    pub fn device(&self) -> &DeviceIdentity {
        self.conn.device()
    }

    /// Disconnect, returning how many frames went out
    pub async fn close(self) -> Result<u64> {
        let frames = self.frames;
        debug!(address = %self.conn.device().address, frames, "stream closed");
        self.conn.release().await?;
        Ok(frames)
    }
}

impl<T: Transport> Engine<T> {
    /// Fade `targets` to `color`, picking the duration from the fade policy
    /// unless `override_ms` is given.
    pub async fn fade(
        &self,
        targets: &[DeviceIdentity],
        color: Color,
        routing: Routing,
        override_ms: Option<u64>,
    ) -> ExecutionResult {
        let transition = self.config().fade.resolve(targets.len(), routing, override_ms);
        match routing {
            Routing::Sequential => {
                self.run(targets, |_| transition.clone().map(|t| Command::fade(color, t))).await
            }
            Routing::Mesh => match transition {
                Ok(t) => self.run_mesh(targets, &Command::fade(color, t)).await,
                Err(e) => self.run(targets, |_| Err::<Command, _>(e.clone())).await,
            },
        }
    }

    /// Hold the lease on `device` for a stream of raw frames
    pub async fn open_stream(&self, device: &DeviceIdentity) -> Result<ColorStream<T>> {
        device.generation.require(ilumi_proto::Opcode::SetColor)?;
        let conn = self.lease().acquire(device).await?;
        Ok(ColorStream { engine: self.clone(), conn, frames: 0 })
    }
}
