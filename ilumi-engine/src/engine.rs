//! Sequential execution of commands across many bulbs through one lease

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use data_encoding::HEXLOWER;
use ilumi_proto::{
    Body, Command, MacAddress, Notification, Opcode, Status, decode, encode, fragment,
    needs_fragmenting,
};
use tokio::time::{Instant, sleep, timeout, timeout_at};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{Error, Phase, Result, TransportError};
use crate::lease::{ConnectionLease, ScopedConnection};
use crate::pattern::PatternBook;
use crate::result::{Delivery, ExecutionResult, TargetOutcome};
use crate::session::Sessions;
use crate::topology::DeviceIdentity;
use crate::transport::{Transport, WriteMode};

/// Commands to send to one bulb, in order, under one lease
pub trait IntoBatch {
    fn into_batch(self) -> Result<Vec<Command>>;
}

impl IntoBatch for Command {
    fn into_batch(self) -> Result<Vec<Command>> {
        Ok(vec![self])
    }
}

impl IntoBatch for Vec<Command> {
    fn into_batch(self) -> Result<Vec<Command>> {
        Ok(self)
    }
}

impl<B: IntoBatch, E: Into<Error>> IntoBatch for std::result::Result<B, E> {
    fn into_batch(self) -> Result<Vec<Command>> {
        self.map_err(Into::into)?.into_batch()
    }
}

/// What went out for one command
#[derive(Debug, Clone, Default)]
pub(crate) struct Sent {
    /// Session counters consumed, in transmission order
    pub counters: Vec<u64>,
    pub reply: Option<Notification>,
}

pub struct Engine<T: Transport> {
    inner: Arc<Inner<T>>,
}

struct Inner<T: Transport> {
    lease: ConnectionLease<T>,
    sessions: Sessions,
    patterns: PatternBook,
    config: EngineConfig,
}

impl<T: Transport> Clone for Engine<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T: Transport> Engine<T> {
    pub fn new(transport: T, sessions: Sessions, config: EngineConfig) -> Self {
        let lease = ConnectionLease::new(transport, config.connect_timeout());
        Self {
            inner: Arc::new(Inner { lease, sessions, patterns: PatternBook::new(), config }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn sessions(&self) -> &Sessions {
        &self.inner.sessions
    }

    pub fn lease(&self) -> &ConnectionLease<T> {
        &self.inner.lease
    }

    pub fn patterns(&self) -> &PatternBook {
        &self.inner.patterns
    }

    /// Run `op` against every target, one connection at a time, in order.
    ///
    /// A failing target is recorded and the run moves on.
    pub async fn run<F, B>(&self, targets: &[DeviceIdentity], op: F) -> ExecutionResult
    where
        F: FnMut(&DeviceIdentity) -> B,
        B: IntoBatch,
    {
        self.run_until(targets, op, std::future::pending()).await
    }

    /// Like [`Engine::run`], stopping when `cancel` completes. The target in
    /// flight and every target not yet attempted are recorded as cancelled.
    pub async fn run_until<F, B, C>(
        &self,
        targets: &[DeviceIdentity],
        mut op: F,
        cancel: C,
    ) -> ExecutionResult
    where
        F: FnMut(&DeviceIdentity) -> B,
        B: IntoBatch,
        C: Future<Output = ()>,
    {
        let mut result = ExecutionResult::new();
        let mut seen = HashSet::new();
        let mut cancelled = false;
        tokio::pin!(cancel);

        for device in targets {
            if !seen.insert(device.address) {
                continue;
            }
            let address = device.address;

            if cancelled {
                result.record(address, TargetOutcome::failed(Delivery::Direct, &Error::Cancelled));
                continue;
            }

            let batch = op(device).into_batch();
            let outcome = tokio::select! {
                biased;
                _ = &mut cancel => {
                    cancelled = true;
                    warn!(%address, "run cancelled");
                    Err(Error::Cancelled)
                }
                r = async {
                    let commands = batch?;
                    self.send(device, &commands).await
                } => r,
            };

            match &outcome {
                Ok(_) => info!(%address, "ok"),
                Err(e) => warn!(%address, error = %e, kind = %e.kind(), "failed"),
            }
            result.record(address, TargetOutcome::from_result(Delivery::Direct, &outcome));
        }

        result
    }

    /// Send `commands` to one bulb under a single lease, returning any
    /// query replies in order.
    pub async fn send(
        &self,
        device: &DeviceIdentity,
        commands: &[Command],
    ) -> Result<Vec<Notification>> {
        for command in commands {
            device.generation.require(command.opcode())?;
        }
        self.inner.patterns.check(device.address, commands)?;

        let mut conn = self.inner.lease.acquire(device).await?;
        let mut replies = Vec::new();
        let mut outcome = Ok(());
        for command in commands {
            match self.transmit(&mut conn, command).await {
                Ok(sent) => replies.extend(sent.reply),
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }

        if let Err(e) = conn.release().await {
            warn!(address = %device.address, error = %e, "disconnect failed");
        }
        outcome.map(|()| replies)
    }

    /// Encode, persist the counter, write, and wait for whatever the command
    /// expects back.
    pub(crate) async fn transmit(
        &self,
        conn: &mut ScopedConnection<T::Link>,
        command: &Command,
    ) -> Result<Sent> {
        let mut sent = Sent::default();
        self.transmit_into(conn, command, &mut sent).await?;
        Ok(sent)
    }

    /// Like [`Engine::transmit`], recording into `sent` as it goes so that a
    /// failed command still reports the counters it consumed.
    pub(crate) async fn transmit_into(
        &self,
        conn: &mut ScopedConnection<T::Link>,
        command: &Command,
        sent: &mut Sent,
    ) -> Result<()> {
        let address = conn.device().address;
        let generation = conn.device().generation;
        let config = &self.inner.config;
        let sessions = &self.inner.sessions;

        let (header, counter) = sessions.next_header(&address)?;
        sent.counters.push(counter);
        let packet = encode(command, header, generation)?;

        // (bytes, counter) per write
        let chunked = needs_fragmenting(&packet);
        let packets = if chunked {
            let mut chunks = Vec::new();
            for chunk in fragment(&packet) {
                let (header, counter) = sessions.next_header(&address)?;
                sent.counters.push(counter);
                chunks.push((encode(&Command::DataChunk(chunk), header, generation)?, counter));
            }
            chunks
        } else {
            vec![(packet, counter)]
        };

        let acknowledged = command.is_acknowledged();
        let mode = if acknowledged { WriteMode::WithResponse } else { WriteMode::WithoutResponse };
        let last = packets.len() - 1;
        for (i, (bytes, _)) in packets.iter().enumerate() {
            debug!(
                %address,
                opcode = ?command.opcode(),
                len = bytes.len(),
                packet = %HEXLOWER.encode(bytes),
                "write"
            );
            let after = config.command_timeout();
            timeout(after, conn.write(bytes, generation, mode))
                .await
                .map_err(|_| Error::LeaseTimeout { address, phase: Phase::Write, after })??;
            if i != last {
                sleep(config.chunk_spacing()).await;
            }
        }

        if chunked && acknowledged {
            let counters: Vec<u64> = packets.iter().map(|(_, counter)| *counter).collect();
            self.drain_chunk_acks(conn, &counters).await?;
        }

        if command.is_query() {
            let after = config.response_timeout();
            let mut reply = self
                .await_reply(conn, command.opcode(), after)
                .await?
                .ok_or(Error::LeaseTimeout { address, phase: Phase::Response, after })?;
            check_status(address, &reply, counter)?;
            if command.opcode() == Opcode::QueryRouting {
                self.collect_routes(conn, &mut reply).await?;
            }
            sent.reply = Some(reply);
        } else if acknowledged && !chunked {
            let ack = self.await_reply(conn, command.opcode(), config.ack_settle()).await?;
            if let Some(ack) = ack {
                check_status(address, &ack, counter)?;
            }
        }

        if acknowledged {
            sessions.record_ack(&address, command.opcode())?;
        }
        if let Command::DefinePattern(pattern) = command {
            self.inner.patterns.record(address, pattern.scene());
        }
        Ok(())
    }

    /// Take one acknowledgment per chunk written, checking each. Stops at the
    /// first chunk whose acknowledgment does not arrive within the settle
    /// window.
    async fn drain_chunk_acks(
        &self,
        conn: &mut ScopedConnection<T::Link>,
        counters: &[u64],
    ) -> Result<()> {
        let address = conn.device().address;
        let settle = self.inner.config.ack_settle();
        for (taken, counter) in counters.iter().enumerate() {
            match self.await_reply(conn, Opcode::DataChunk, settle).await? {
                Some(ack) => check_status(address, &ack, *counter)?,
                None => {
                    let expected = counters.len();
                    debug!(%address, taken, expected, "chunk acknowledgments stopped");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Merge the rest of a routing table into `first` until the bulb goes
    /// quiet
    async fn collect_routes(
        &self,
        conn: &mut ScopedConnection<T::Link>,
        first: &mut Notification,
    ) -> Result<()> {
        let idle = self.inner.config.routing_idle();
        while let Some(more) = self.await_reply(conn, Opcode::QueryRouting, idle).await? {
            match (&mut first.body, more.body) {
                (Body::Routing(entries), Body::Routing(rest)) => entries.extend(rest),
                (_, body) => {
                    debug!(address = %conn.device().address, ?body, "unexpected routing frame");
                }
            }
        }
        Ok(())
    }

    /// First notification answering `opcode`, or `None` once `within` runs out
    async fn await_reply(
        &self,
        conn: &mut ScopedConnection<T::Link>,
        opcode: Opcode,
        within: Duration,
    ) -> Result<Option<Notification>> {
        let generation = conn.device().generation;
        let deadline = Instant::now() + within;

        loop {
            let bytes = match timeout_at(deadline, conn.notification()).await {
                Err(_) => return Ok(None),
                Ok(Ok(Some(bytes))) => bytes,
                Ok(Ok(None)) => return Err(TransportError::Closed.into()),
                Ok(Err(e)) => return Err(e.into()),
            };

            let notification = decode(&bytes, generation)?;
            let answers = notification.opcode == opcode
                || matches!(
                    &notification.body,
                    Body::Relayed { opcode: inner, .. } if *inner == opcode
                );
            if answers {
                return Ok(Some(notification));
            }
            debug!(
                address = %conn.device().address,
                opcode = ?notification.opcode,
                "ignoring unrelated notification"
            );
        }
    }
}

fn check_status(address: MacAddress, n: &Notification, sequence: u64) -> Result<()> {
    match n.status {
        Status::Ok => Ok(()),
        Status::StaleSequence => Err(Error::ReplayRejected { address, sequence }),
        status => Err(Error::Device { address, opcode: n.opcode, status }),
    }
}
