//! Best-effort broadcast through one connected bulb
//!
//! The proxy is the first target in resolution order. It relays one proxy
//! packet to every listed address over the mesh; only the proxy's own
//! acknowledgment is ever observed.

use std::time::Duration;

use ilumi_proto::{Command, DialectError, MacAddress, Opcode, ProxyMessage, encode};
use serde::Serialize;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::engine::{Engine, Sent};
use crate::error::{Error, ErrorKind, Result};
use crate::result::{Delivery, ExecutionResult, TargetOutcome};
use crate::topology::DeviceIdentity;
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastPolicy {
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for BroadcastPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, retry_delay: Duration::from_millis(250) }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attempt {
    /// Counters consumed by this attempt: the relayed packet's first, then
    /// the proxy's own
    pub sequences: Vec<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BroadcastReport {
    pub proxy: MacAddress,
    pub recipients: Vec<MacAddress>,
    pub attempts: Vec<Attempt>,
    pub accepted: bool,
}

impl BroadcastReport {
    pub fn last_error(&self) -> Option<&str> {
        self.attempts.last().and_then(|a| a.error.as_deref())
    }

    /// Same shape as a sequential run. Recipients other than the proxy are
    /// marked as relayed: the proxy accepting says nothing about them.
    pub fn into_result(self) -> ExecutionResult {
        let mut result = ExecutionResult::new();
        let failure = self.attempts.last().filter(|_| !self.accepted).cloned();

        for address in &self.recipients {
            let delivery = if *address == self.proxy { Delivery::Proxy } else { Delivery::Relayed };
            let outcome = match &failure {
                None => TargetOutcome::ok(delivery, Vec::new()),
                Some(attempt) => TargetOutcome {
                    success: false,
                    error: attempt.error.clone(),
                    kind: attempt.kind,
                    delivery,
                    replies: Vec::new(),
                },
            };
            result.record(*address, outcome);
        }
        result
    }
}

/// Commands a proxy can relay without expecting anything back
fn relayable(command: &Command) -> bool {
    !command.is_query()
        && !matches!(
            command,
            Command::DefinePattern(_)
                | Command::StartPattern { .. }
                | Command::DataChunk(_)
                | Command::Proxy(_)
        )
}

impl<T: Transport> Engine<T> {
    /// Broadcast `command` to `targets` through the first of them.
    ///
    /// Errors are returned only when nothing was transmitted: no targets,
    /// a command that cannot be relayed, or mixed platform generations.
    pub async fn broadcast(
        &self,
        targets: &[DeviceIdentity],
        command: &Command,
        policy: BroadcastPolicy,
    ) -> Result<BroadcastReport> {
        let Some(proxy) = targets.first() else {
            return Err(Error::NoTargets);
        };
        if !relayable(command) {
            return Err(Error::NotRelayable(command.opcode()));
        }
        if let Some(other) = targets.iter().find(|t| t.generation != proxy.generation) {
            let mismatch =
                DialectError::Mismatch { encoded: proxy.generation, device: other.generation };
            return Err(mismatch.into());
        }
        proxy.generation.require(command.opcode())?;
        proxy.generation.require(Opcode::ProxyMessage)?;

        let mut recipients: Vec<MacAddress> = Vec::with_capacity(targets.len());
        for target in targets {
            if !recipients.contains(&target.address) {
                recipients.push(target.address);
            }
        }

        let mut report = BroadcastReport {
            proxy: proxy.address,
            recipients,
            attempts: Vec::new(),
            accepted: false,
        };

        let max_attempts = policy.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            let mut sequences = Vec::new();
            let outcome = self.relay_once(proxy, command, &report.recipients, &mut sequences).await;

            match outcome {
                Ok(()) => {
                    info!(
                        proxy = %proxy.address,
                        attempt,
                        recipients = report.recipients.len(),
                        "proxy accepted broadcast"
                    );
                    report.attempts.push(Attempt { sequences, error: None, kind: None });
                    report.accepted = true;
                    break;
                }
                Err(e) => {
                    let retry = e.is_retryable() && attempt < max_attempts;
                    warn!(
                        proxy = %proxy.address,
                        attempt,
                        error = %e,
                        retry,
                        "broadcast attempt failed"
                    );
                    report.attempts.push(Attempt {
                        sequences,
                        error: Some(e.to_string()),
                        kind: Some(e.kind()),
                    });
                    if !retry {
                        break;
                    }
                    sleep(policy.retry_delay).await;
                }
            }
        }

        Ok(report)
    }

    async fn relay_once(
        &self,
        proxy: &DeviceIdentity,
        command: &Command,
        recipients: &[MacAddress],
        sequences: &mut Vec<u64>,
    ) -> Result<()> {
        let mut conn = self.lease().acquire(proxy).await?;
        let mut sent = Sent::default();

        let outcome = async {
            // every recipient sees the inner packet, so its counter must be
            // fresh for all of them
            let (header, counter) =
                self.sessions().next_shared_header(&proxy.address, recipients)?;
            sent.counters.push(counter);
            let inner = encode(command, header, proxy.generation)?;
            let message = ProxyMessage::new(recipients.to_vec(), inner)?;
            self.transmit_into(&mut conn, &Command::Proxy(message), &mut sent).await
        }
        .await;

        sequences.extend(&sent.counters);
        if let Err(e) = conn.release().await {
            warn!(proxy = %proxy.address, error = %e, "disconnect failed");
        }
        outcome
    }

    /// Broadcast and fold the report into the common result shape
    pub async fn run_mesh(&self, targets: &[DeviceIdentity], command: &Command) -> ExecutionResult {
        if targets.is_empty() {
            return ExecutionResult::new();
        }

        let policy = BroadcastPolicy {
            max_attempts: self.config().mesh_attempts,
            retry_delay: self.config().mesh_retry_delay(),
        };
        match self.broadcast(targets, command, policy).await {
            Ok(report) => report.into_result(),
            Err(e) => {
                warn!(error = %e, "broadcast rejected before sending");
                let mut result = ExecutionResult::new();
                for target in targets {
                    let delivery = if target.address == targets[0].address {
                        Delivery::Proxy
                    } else {
                        Delivery::Relayed
                    };
                    result.record(target.address, TargetOutcome::failed(delivery, &e));
                }
                result
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::mock::MockTransport;
    use crate::session::Sessions;
    use ilumi_proto::{
        Color, Generation, NetworkKey, Power, Status, parse_command, reassemble, wire_sequence,
    };

    fn device(last: u8) -> DeviceIdentity {
        DeviceIdentity::ad_hoc(MacAddress([0xAA, 0, 0, 0, 0, last]))
    }

    fn engine(mock: MockTransport) -> Engine<MockTransport> {
        Engine::new(mock, Sessions::in_memory(NetworkKey(42)), EngineConfig::default())
    }

    /// The proxy message as the proxy received it, chunked or not
    fn proxied(mock: &MockTransport, proxy: MacAddress) -> ProxyMessage {
        let parsed: Vec<Command> = mock
            .writes_to(proxy)
            .iter()
            .map(|b| parse_command(b, Generation::Gen2).unwrap().1)
            .collect();
        let chunks: Vec<_> = parsed
            .iter()
            .filter_map(|c| match c {
                Command::DataChunk(chunk) => Some(*chunk),
                _ => None,
            })
            .collect();
        let whole = if chunks.is_empty() {
            parsed.into_iter().next()
        } else {
            Some(parse_command(&reassemble(&chunks).unwrap(), Generation::Gen2).unwrap().1)
        };
        match whole {
            Some(Command::Proxy(message)) => message,
            other => panic!("expected a proxy packet, got {other:?}"),
        }
    }

    fn policy(max_attempts: u32) -> BroadcastPolicy {
        BroadcastPolicy { max_attempts, retry_delay: Duration::from_millis(100) }
    }

    #[tokio::test(start_paused = true)]
    async fn only_the_proxy_is_contacted() {
        let targets: Vec<_> = (1..=3).map(device).collect();
        let mock = MockTransport::new();
        let engine = engine(mock.clone());

        let command = Command::TurnOn(Power::default());
        let report = engine.broadcast(&targets, &command, policy(3)).await.unwrap();

        assert!(report.accepted);
        assert_eq!(report.attempts.len(), 1);
        assert_eq!(mock.connects(), vec![targets[0].address]);

        let message = proxied(&mock, targets[0].address);
        assert_eq!(message.targets(), &report.recipients[..]);
        let (inner_header, inner) = parse_command(message.inner(), Generation::Gen2).unwrap();
        assert_eq!(inner, Command::TurnOn(Power::default()));
        assert_eq!(inner_header.network_key, NetworkKey(42));

        let result = report.into_result();
        assert_eq!(result.len(), 3);
        assert!(result.all_succeeded());
        assert_eq!(result.get(&targets[0].address).unwrap().delivery, Delivery::Proxy);
        assert_eq!(result.get(&targets[2].address).unwrap().delivery, Delivery::Relayed);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_bounded_with_fresh_sequences() {
        let targets: Vec<_> = (1..=2).map(device).collect();
        let mock = MockTransport::new().fail_writes(targets[0].address, 10);
        let engine = engine(mock.clone());

        let command = Command::TurnOff(Power::default());
        let report = engine.broadcast(&targets, &command, policy(3)).await.unwrap();

        assert!(!report.accepted);
        assert_eq!(report.attempts.len(), 3);
        assert_eq!(mock.connects().len(), 3);
        let all: Vec<u64> = report.attempts.iter().flat_map(|a| a.sequences.clone()).collect();
        assert!(all.windows(2).all(|w| w[0] < w[1]), "sequences {all:?}");
        assert!(report.last_error().unwrap().contains("injected"));

        let result = report.into_result();
        assert_eq!(result.failed(), 2);
        assert_eq!(result.get(&targets[1].address).unwrap().kind, Some(ErrorKind::Transport));
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_on_a_later_attempt() {
        let targets: Vec<_> = (1..=2).map(device).collect();
        let mock = MockTransport::new().fail_writes(targets[0].address, 1);
        let engine = engine(mock.clone());

        let candle = Command::CandleMode(Color::rgbw(255, 190, 0, 29, 255));
        let report = engine.broadcast(&targets, &candle, policy(3)).await.unwrap();
        assert!(report.accepted);
        assert_eq!(report.attempts.len(), 2);
        assert!(report.attempts[0].sequences.last() < report.attempts[1].sequences.first());
    }

    #[tokio::test(start_paused = true)]
    async fn replay_rejection_is_not_retried() {
        let targets: Vec<_> = (1..=2).map(device).collect();
        let mock = MockTransport::new().ack_with(Status::StaleSequence, Generation::Gen2);
        let engine = engine(mock.clone());

        let command = Command::TurnOn(Power::default());
        let report = engine.broadcast(&targets, &command, policy(3)).await.unwrap();
        assert!(!report.accepted);
        assert_eq!(report.attempts.len(), 1);
        assert_eq!(report.attempts[0].kind, Some(ErrorKind::ReplayRejected));
    }

    #[tokio::test(start_paused = true)]
    async fn mixed_generations_are_rejected_up_front() {
        let targets = vec![device(1), device(2).with_generation(Generation::Gen1)];
        let mock = MockTransport::new();
        let engine = engine(mock.clone());

        let command = Command::TurnOn(Power::default());
        let err = engine.broadcast(&targets, &command, policy(3)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Dialect);
        assert!(mock.connects().is_empty());

        let result = engine.run_mesh(&targets, &Command::TurnOn(Power::default())).await;
        assert_eq!(result.len(), 2);
        assert!(result.iter().all(|(_, o)| o.kind == Some(ErrorKind::Dialect)));
        assert!(engine.run_mesh(&[], &Command::GetBulbColor).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn long_inner_packets_are_chunked() {
        let targets: Vec<_> = (1..=4).map(device).collect();
        let mock = MockTransport::new();
        let engine = engine(mock.clone());

        let report = engine
            .broadcast(&targets, &Command::SetColorAcked(Color::rgbw(1, 2, 3, 4, 5)), policy(1))
            .await
            .unwrap();
        assert!(report.accepted);

        let chunks = mock.writes_to(targets[0].address).len();
        assert!(chunks > 1);
        assert_eq!(proxied(&mock, targets[0].address).targets().len(), 4);
        // inner packet, outer packet, then one counter per chunk
        assert_eq!(report.attempts[0].sequences.len(), 2 + chunks);
    }

    #[tokio::test(start_paused = true)]
    async fn recipients_never_see_a_stale_counter() {
        let (a, b) = (device(1), device(2));
        let mock = MockTransport::new();
        let engine = engine(mock.clone());
        for _ in 0..5 {
            engine.sessions().next_sequence(&b.address).unwrap();
        }

        let targets = [a.clone(), b.clone()];
        let mut relayed = Vec::new();
        for _ in 0..3 {
            let report = engine
                .broadcast(&targets, &Command::TurnOn(Power::default()), policy(1))
                .await
                .unwrap();
            assert!(report.accepted);
            relayed.push(report.attempts[0].sequences[0]);
        }
        // the first relayed packet already clears what B saw directly
        assert_eq!(relayed[0], 5);
        assert!(relayed.windows(2).all(|w| w[0] < w[1]), "{relayed:?}");

        let result = engine.run(&[b.clone()], |_| Command::TurnOff(Power::default())).await;
        assert!(result.all_succeeded());
        let direct = mock.writes_to(b.address);
        assert_eq!(direct.len(), 1);
        let (header, _) = parse_command(&direct[0], Generation::Gen2).unwrap();
        assert_eq!(header.sequence, wire_sequence(relayed[2] + 1));
    }
}
