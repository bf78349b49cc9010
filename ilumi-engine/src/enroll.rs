//! Commissioning bulbs into and out of a mesh network, and handing them to
//! the DFU bootloader

use ilumi_proto::{Body, Command, DecodeError, DeviceInfo, MacAddress, NetworkKey, Opcode};
use rand::Rng;
use tracing::{info, warn};

use crate::engine::Engine;
use crate::error::Result;
use crate::result::{Delivery, ExecutionResult, TargetOutcome};
use crate::topology::DeviceIdentity;
use crate::transport::Transport;

/// Group every enrolled bulb is commissioned into
pub const MESH_GROUP_ID: u16 = 1;

/// A fresh key for a new mesh network
pub fn generate_network_key() -> NetworkKey {
    NetworkKey(rand::thread_rng().gen_range(1_000..=999_999))
}

/// Key the bootloader checks before accepting a DFU session
pub fn generate_dfu_key() -> u32 {
    rand::random()
}

impl<T: Transport> Engine<T> {
    /// Ask a bulb that may not be enrolled who it is. The returned identity
    /// carries the generation its model number implies.
    pub async fn identify(&self, address: MacAddress) -> Result<(DeviceIdentity, DeviceInfo)> {
        let unknown = DeviceIdentity::ad_hoc(address);
        let replies = self.send(&unknown, &[Command::GetDeviceInfo]).await?;
        let info = replies
            .iter()
            .find_map(|n| match n.body {
                Body::DeviceInfo(info) => Some(info),
                _ => None,
            })
            .ok_or(DecodeError::Unexpected(Opcode::GetDeviceInfo))?;

        info!(%address, model = info.model_number, generation = %info.generation(), "identified");
        Ok((unknown.with_generation(info.generation()), info))
    }

    /// Commission `device` into the mesh keyed by `network_key`, then move
    /// its session to that key. The session counter starts over.
    pub async fn commission(
        &self,
        device: &DeviceIdentity,
        network_key: NetworkKey,
        node_id: u16,
        group_id: u16,
    ) -> Result<()> {
        let command = Command::Commission { network_key, node_id, group_id };
        self.send(device, &[command]).await?;
        self.sessions().rotate_key(&device.address, network_key)?;
        info!(address = %device.address, node_id, group_id, "commissioned");
        Ok(())
    }

    /// Return every target to its factory, uncommissioned state
    pub async fn unenroll(&self, targets: &[DeviceIdentity]) -> ExecutionResult {
        let mut result = ExecutionResult::new();
        for device in targets {
            if result.get(&device.address).is_some() {
                continue;
            }
            let outcome = self
                .commission(device, NetworkKey(0), 0, 0)
                .await
                .map(|()| Vec::new());
            if let Err(e) = &outcome {
                warn!(address = %device.address, error = %e, "unenroll failed");
            }
            result.record(device.address, TargetOutcome::from_result(Delivery::Direct, &outcome));
        }
        result
    }

    /// Reboot `targets` into the bootloader. They stop answering normal
    /// commands until new firmware is flashed.
    pub async fn enter_bootloader(
        &self,
        targets: &[DeviceIdentity],
        dfu_key: u32,
    ) -> ExecutionResult {
        self.run(targets, |_| Command::EnterBootloader { dfu_key }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::mock::MockTransport;
    use crate::session::Sessions;
    use ilumi_proto::{Generation, Notification, Power, Status, parse_command};

    fn device(last: u8) -> DeviceIdentity {
        DeviceIdentity::ad_hoc(MacAddress([0xAA, 0, 0, 0, 0, last]))
    }

    fn engine(mock: MockTransport) -> Engine<MockTransport> {
        Engine::new(mock, Sessions::in_memory(NetworkKey(77)), EngineConfig::default())
    }

    fn info(model_number: u8) -> DeviceInfo {
        DeviceInfo {
            firmware_version: 0x0102,
            bootloader_version: 0x0001,
            commission_status: 0,
            model_number,
            reset_reason: 0,
            ble_stack_version: 0x0800,
        }
    }

    #[test]
    fn generated_keys_stay_in_range() {
        for _ in 0..100 {
            let NetworkKey(key) = generate_network_key();
            assert!((1_000..=999_999).contains(&key));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn identify_reads_the_generation() {
        for (model, generation) in [(65, Generation::Gen2), (3, Generation::Gen1)] {
            let mock = MockTransport::new().respond(move |w| {
                if w.bytes[5] != 40 {
                    return vec![];
                }
                let n = Notification {
                    opcode: Opcode::GetDeviceInfo,
                    status: Status::Ok,
                    body: Body::DeviceInfo(info(model)),
                };
                vec![n.to_bytes(Generation::Gen2).unwrap()]
            });
            let (identity, found) = engine(mock).identify(device(1).address).await.unwrap();
            assert_eq!(identity.generation, generation);
            assert_eq!(found.model_number, model);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn commission_moves_the_session_to_the_new_key() {
        let mock = MockTransport::new();
        let engine = engine(mock.clone());
        let a = device(1);
        engine.send(&a, &[Command::TurnOn(Power::default())]).await.unwrap();

        engine.commission(&a, NetworkKey(4242), 7, MESH_GROUP_ID).await.unwrap();

        let writes = mock.writes_to(a.address);
        let (header, command) = parse_command(&writes[1], Generation::Gen2).unwrap();
        // sent under the old key
        assert_eq!(header.network_key, NetworkKey(77));
        assert_eq!(
            command,
            Command::Commission { network_key: NetworkKey(4242), node_id: 7, group_id: 1 }
        );
        let state = engine.sessions().state(&a.address).unwrap();
        assert_eq!(state.network_key, NetworkKey(4242));
        assert_eq!(state.sequence, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_commission_keeps_the_old_key() {
        let a = device(1);
        let mock = MockTransport::new().ack_with(Status::Failed, Generation::Gen2);
        let engine = engine(mock);

        let err = engine.commission(&a, NetworkKey(4242), 7, MESH_GROUP_ID).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Device);
        assert_eq!(engine.sessions().state(&a.address).unwrap().network_key, NetworkKey(77));
    }

    #[tokio::test(start_paused = true)]
    async fn unenroll_resets_each_target() {
        let targets: Vec<_> = (1..=3).map(device).collect();
        let mock = MockTransport::new().fail_connect(targets[1].address);
        let engine = engine(mock.clone());

        let result = engine.unenroll(&targets).await;

        assert_eq!(result.len(), 3);
        assert_eq!(result.failed(), 1);
        assert!(!result.get(&targets[1].address).unwrap().success);
        for target in [&targets[0], &targets[2]] {
            let writes = mock.writes_to(target.address);
            let (_, command) = parse_command(&writes[0], Generation::Gen2).unwrap();
            assert_eq!(
                command,
                Command::Commission { network_key: NetworkKey(0), node_id: 0, group_id: 0 }
            );
            let state = engine.sessions().state(&target.address).unwrap();
            assert_eq!(state.network_key, NetworkKey(0));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn bootloader_entry_carries_the_key() {
        let mock = MockTransport::new();
        let engine = engine(mock.clone());
        let a = device(1);

        let result = engine.enter_bootloader(&[a.clone()], 0xA1B2_C3D4).await;
        assert!(result.all_succeeded());
        let writes = mock.writes_to(a.address);
        let (_, command) = parse_command(&writes[0], Generation::Gen2).unwrap();
        assert_eq!(command, Command::EnterBootloader { dfu_key: 0xA1B2_C3D4 });
    }
}
