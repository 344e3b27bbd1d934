//! End-to-end protocol exercises.
//!
//! Each test drives the real connection task over an in-memory duplex
//! pipe, acting as the station firmware on the other end: raw frames in,
//! raw frames out, with the engine's public operations called alongside.

use std::sync::Arc;
use std::time::Duration;

use powercab_core::dispatcher::run_connection;
use powercab_core::{
    Engine, EngineConfig, EngineError, MemoryStorage, OrderStatus, PowerbankStatus, Storage,
    StationStatus,
};
use powercab_proto::{
    BorrowCode, BorrowCommand, BorrowResult, Command, Frame, LoginPacket, ReturnReply,
    ReturnRequest, SlotAbnormalReport, SlotReading, EMPTY_TERMINAL_ID,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

const SECRET: &[u8] = b"station-secret";

/// The station side of one connection.
struct TestStation {
    stream: DuplexStream,
    vsn: u8,
    secret: Vec<u8>,
}

impl TestStation {
    fn connect(engine: &Arc<Engine>, socket_id: u64) -> TestStation {
        TestStation::connect_with_secret(engine, socket_id, SECRET)
    }

    fn connect_with_secret(engine: &Arc<Engine>, socket_id: u64, secret: &[u8]) -> TestStation {
        let (client, server) = tokio::io::duplex(4096);
        let engine = engine.clone();
        tokio::spawn(run_connection(
            engine,
            server,
            socket_id,
            "127.0.0.1:5000".parse().unwrap(),
        ));
        TestStation {
            stream: client,
            vsn: 1,
            secret: secret.to_vec(),
        }
    }

    async fn send(&mut self, command: Command, payload: &[u8]) {
        let buf = Frame::encode(command, self.vsn, payload, &self.secret);
        self.stream.write_all(&buf).await.unwrap();
    }

    async fn send_raw(&mut self, buf: &[u8]) {
        self.stream.write_all(buf).await.unwrap();
    }

    async fn recv(&mut self) -> Frame {
        let mut len = [0u8; 2];
        self.stream.read_exact(&mut len).await.unwrap();
        let declared = u16::from_be_bytes(len) as usize;
        let mut buf = vec![0u8; 2 + declared];
        buf[..2].copy_from_slice(&len);
        self.stream.read_exact(&mut buf[2..]).await.unwrap();
        Frame::decode(&buf).unwrap()
    }

    /// Receive frames until one matches `command`, ignoring others (the
    /// server interleaves ICCID and inventory queries with replies).
    async fn recv_command(&mut self, command: Command) -> Frame {
        for _ in 0..8 {
            let frame = self.recv().await;
            if frame.command == command {
                return frame;
            }
        }
        panic!("no {} frame received", command);
    }

    /// True when the server closed its end of the pipe.
    async fn closed(&mut self) -> bool {
        let mut byte = [0u8; 1];
        matches!(self.stream.read(&mut byte).await, Ok(0) | Err(_))
    }

    async fn login(&mut self, box_id: &str, remain_num: u8, readings: Vec<SlotReading>) {
        let login = LoginPacket {
            box_id: box_id.to_string(),
            slots_declared: 5,
            remain_num,
            readings,
        };
        self.send(Command::Login, &login.to_payload()).await;
        let ack = self.recv_command(Command::Login).await;
        assert_eq!(ack.payload, vec![1]);
    }
}

fn reading(slot: u8, terminal_id: &str) -> SlotReading {
    SlotReading {
        slot,
        terminal_id: terminal_id.to_string(),
        level: 80,
        voltage: 4100,
        temperature: 26,
    }
}

fn engine_with_station(config: EngineConfig) -> (Arc<Engine>, Arc<MemoryStorage>, i64) {
    let storage = Arc::new(MemoryStorage::new());
    let station = storage.provision_station("STN001", 5, SECRET, None);
    let engine = Engine::new(config, storage.clone());
    (engine, storage, station.id)
}

#[tokio::test]
async fn test_login_syncs_inventory_and_goes_active() {
    let (engine, storage, station_id) = engine_with_station(EngineConfig::default());
    let mut station = TestStation::connect(&engine, 1);

    station
        .login(
            "STN001",
            4,
            vec![reading(1, "PB000001"), reading(2, EMPTY_TERMINAL_ID)],
        )
        .await;

    let stored = storage.get_station(station_id).await.unwrap();
    assert_eq!(stored.status, StationStatus::Active);
    assert_eq!(stored.remain_num, 4);
    assert!(stored.last_seen.is_some());

    let rows = storage.get_station_powerbanks(station_id).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].slot, 1);

    let bank = storage
        .get_powerbank_by_serial("PB000001")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(bank.status, PowerbankStatus::Unknown);
    assert!(engine.is_station_online(station_id));
}

#[tokio::test]
async fn test_login_backfills_iccid() {
    let (engine, storage, station_id) = engine_with_station(EngineConfig::default());
    let mut station = TestStation::connect(&engine, 1);

    let login = LoginPacket {
        box_id: "STN001".to_string(),
        slots_declared: 5,
        remain_num: 5,
        readings: vec![],
    };
    station.send(Command::Login, &login.to_payload()).await;
    station.recv_command(Command::QueryIccid).await;
    station
        .send(Command::QueryIccid, b"89430301234567890123")
        .await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    let stored = storage.get_station(station_id).await.unwrap();
    assert_eq!(stored.iccid.as_deref(), Some("89430301234567890123"));
}

#[tokio::test]
async fn test_unprovisioned_station_is_dropped_without_reply() {
    let storage = Arc::new(MemoryStorage::new());
    let engine = Engine::new(EngineConfig::default(), storage.clone());
    let mut station = TestStation::connect(&engine, 1);

    let login = LoginPacket {
        box_id: "GHOST01".to_string(),
        slots_declared: 5,
        remain_num: 5,
        readings: vec![],
    };
    station.send(Command::Login, &login.to_payload()).await;
    assert!(station.closed().await);

    // The row exists for an operator to activate later.
    let (ghost, secret) = storage.get_or_create_station("GHOST01", 5).await.unwrap();
    assert_eq!(ghost.status, StationStatus::Pending);
    assert!(secret.is_none());
}

#[tokio::test]
async fn test_heartbeat_echo() {
    let (engine, storage, station_id) = engine_with_station(EngineConfig::default());
    let mut station = TestStation::connect(&engine, 1);
    station.login("STN001", 5, vec![]).await;

    station.send(Command::Heartbeat, &[]).await;
    let beat = station.recv_command(Command::Heartbeat).await;
    assert!(beat.payload.is_empty());
    assert!(beat.verify_token(SECRET));

    tokio::time::sleep(Duration::from_millis(50)).await;
    let stored = storage.get_station(station_id).await.unwrap();
    assert!(stored.last_seen.is_some());
}

#[tokio::test]
async fn test_borrow_success_updates_order_and_occupancy() {
    let (engine, storage, station_id) = engine_with_station(EngineConfig::default());
    let mut station = TestStation::connect(&engine, 1);
    station
        .login("STN001", 4, vec![reading(1, "PB000001")])
        .await;

    let bank = storage
        .get_powerbank_by_serial("PB000001")
        .await
        .unwrap()
        .unwrap();

    let borrow = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.request_borrow(station_id, bank.id, 77).await })
    };

    let frame = station.recv_command(Command::BorrowPowerBank).await;
    let command = BorrowCommand::parse(&frame.payload).unwrap();
    assert_eq!(command.slot, 1);

    let result = BorrowResult {
        order_id: command.order_id,
        slot: command.slot,
        result: BorrowCode::Ok,
        terminal_id: "PB000001".to_string(),
    };
    station
        .send(Command::BorrowPowerBank, &result.to_payload())
        .await;

    let order_id = borrow.await.unwrap().unwrap();
    let order = storage.get_order(order_id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Borrow);
    assert!(order.completed_at.is_none());

    // The slot freed up.
    assert!(storage
        .get_station_powerbank(station_id, 1)
        .await
        .unwrap()
        .is_none());
    assert_eq!(
        storage.get_station(station_id).await.unwrap().remain_num,
        5
    );
}

#[tokio::test]
async fn test_borrow_timeout_leaves_state_unchanged() {
    let config = EngineConfig::default().with_borrow_timeout(Duration::from_millis(100));
    let (engine, storage, station_id) = engine_with_station(config);
    let mut station = TestStation::connect(&engine, 1);
    station
        .login("STN001", 4, vec![reading(1, "PB000001")])
        .await;

    let bank = storage
        .get_powerbank_by_serial("PB000001")
        .await
        .unwrap()
        .unwrap();

    // The station receives the command but never answers.
    let err = engine
        .request_borrow(station_id, bank.id, 77)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Timeout));

    // Unknown outcome: nothing is rolled back, nothing is confirmed.
    assert!(storage
        .get_station_powerbank(station_id, 1)
        .await
        .unwrap()
        .is_some());
    assert_eq!(
        storage.get_station(station_id).await.unwrap().remain_num,
        4
    );
    let order = storage.get_order(1).await.unwrap();
    assert_eq!(order.status, OrderStatus::Pending);
}

#[tokio::test]
async fn test_borrow_result_from_another_station_is_ignored() {
    let config = EngineConfig::default().with_borrow_timeout(Duration::from_millis(200));
    let storage = Arc::new(MemoryStorage::new());
    let first = storage.provision_station("STN001", 5, SECRET, None);
    storage.provision_station("STN002", 5, b"other-secret", None);
    let engine = Engine::new(config, storage.clone());

    let mut station_a = TestStation::connect(&engine, 1);
    station_a
        .login("STN001", 4, vec![reading(1, "PB000001")])
        .await;
    let mut station_b = TestStation::connect_with_secret(&engine, 2, b"other-secret");
    station_b.login("STN002", 5, vec![]).await;

    let bank = storage
        .get_powerbank_by_serial("PB000001")
        .await
        .unwrap()
        .unwrap();
    let borrow = {
        let engine = engine.clone();
        let station_id = first.id;
        tokio::spawn(async move { engine.request_borrow(station_id, bank.id, 77).await })
    };

    let frame = station_a.recv_command(Command::BorrowPowerBank).await;
    let command = BorrowCommand::parse(&frame.payload).unwrap();

    // The other cabinet forges a success for the first one's order, signed
    // with its own perfectly valid key. It must not complete the waiter.
    let forged = BorrowResult {
        order_id: command.order_id,
        slot: command.slot,
        result: BorrowCode::Ok,
        terminal_id: "PB000001".to_string(),
    };
    station_b
        .send(Command::BorrowPowerBank, &forged.to_payload())
        .await;

    let err = borrow.await.unwrap().unwrap_err();
    assert!(matches!(err, EngineError::Timeout));

    // The first station's state is untouched.
    assert!(storage
        .get_station_powerbank(first.id, 1)
        .await
        .unwrap()
        .is_some());
    assert_eq!(
        storage.get_station(first.id).await.unwrap().remain_num,
        4
    );
    assert_eq!(
        storage.get_order(1).await.unwrap().status,
        OrderStatus::Pending
    );
}

#[tokio::test]
async fn test_borrow_of_unseated_bank_is_rejected_locally() {
    let (engine, storage, station_id) = engine_with_station(EngineConfig::default());
    let mut station = TestStation::connect(&engine, 1);
    station.login("STN001", 5, vec![]).await;

    let bank = storage
        .create_powerbank("PB000009", PowerbankStatus::Active)
        .await
        .unwrap();
    let err = engine
        .request_borrow(station_id, bank.id, 77)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PowerbankNotPresent(_, _)));
}

#[tokio::test]
async fn test_return_of_unknown_serial_into_empty_slot() {
    let (engine, storage, station_id) = engine_with_station(EngineConfig::default());
    let mut station = TestStation::connect(&engine, 1);
    station.login("STN001", 5, vec![]).await;

    let req = ReturnRequest {
        slot: 2,
        terminal_id: "PB000099".to_string(),
    };
    station
        .send(Command::ReturnPowerBank, &req.to_payload())
        .await;
    let frame = station.recv_command(Command::ReturnPowerBank).await;
    let reply = ReturnReply::parse(&frame.payload).unwrap();
    assert_eq!(reply.slot, 2);
    assert_eq!(reply.result, powercab_proto::ReturnCode::Ok);

    // A never-seen serial is accepted and registered as unknown.
    let bank = storage
        .get_powerbank_by_serial("PB000099")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(bank.status, PowerbankStatus::Unknown);

    let row = storage
        .get_station_powerbank(station_id, 2)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.powerbank_id, bank.id);
    assert_eq!(
        storage.get_station(station_id).await.unwrap().remain_num,
        4
    );
}

#[tokio::test]
async fn test_return_into_occupied_slot_is_refused() {
    let (engine, storage, station_id) = engine_with_station(EngineConfig::default());
    let mut station = TestStation::connect(&engine, 1);
    station
        .login("STN001", 4, vec![reading(1, "PB000001")])
        .await;

    let req = ReturnRequest {
        slot: 1,
        terminal_id: "PB000002".to_string(),
    };
    station
        .send(Command::ReturnPowerBank, &req.to_payload())
        .await;
    let frame = station.recv_command(Command::ReturnPowerBank).await;
    let reply = ReturnReply::parse(&frame.payload).unwrap();
    assert_eq!(reply.result, powercab_proto::ReturnCode::SlotOccupied);

    // The stored row is untouched.
    let row = storage
        .get_station_powerbank(station_id, 1)
        .await
        .unwrap()
        .unwrap();
    let original = storage
        .get_powerbank_by_serial("PB000001")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.powerbank_id, original.id);
    assert_eq!(
        storage.get_station(station_id).await.unwrap().remain_num,
        4
    );
}

#[tokio::test]
async fn test_return_closes_open_loan() {
    let (engine, storage, station_id) = engine_with_station(EngineConfig::default());
    let mut station = TestStation::connect(&engine, 1);
    station.login("STN001", 5, vec![]).await;

    let bank = storage
        .create_powerbank("PB000001", PowerbankStatus::Active)
        .await
        .unwrap();
    let order = storage
        .create_order(station_id, 77, bank.id, OrderStatus::Borrow)
        .await
        .unwrap();

    let req = ReturnRequest {
        slot: 3,
        terminal_id: "PB000001".to_string(),
    };
    station
        .send(Command::ReturnPowerBank, &req.to_payload())
        .await;
    let frame = station.recv_command(Command::ReturnPowerBank).await;
    assert_eq!(
        ReturnReply::parse(&frame.payload).unwrap().result,
        powercab_proto::ReturnCode::Ok
    );

    let closed = storage.get_order(order.id).await.unwrap();
    assert_eq!(closed.status, OrderStatus::Return);
    assert!(closed.completed_at.is_some());
}

#[tokio::test]
async fn test_error_return_marks_bank_broken() {
    let (engine, storage, station_id) = engine_with_station(EngineConfig::default());
    let mut station = TestStation::connect(&engine, 1);
    station.login("STN001", 5, vec![]).await;

    let bank = storage
        .create_powerbank("PB000001", PowerbankStatus::Active)
        .await
        .unwrap();
    let order = storage
        .create_order(station_id, 77, bank.id, OrderStatus::Borrow)
        .await
        .unwrap();

    let waiter = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .request_error_return(station_id, 77, 4, Some(Duration::from_secs(2)))
                .await
        })
    };
    // Let the waiter register before the unit is seated.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let req = ReturnRequest {
        slot: 3,
        terminal_id: "PB000001".to_string(),
    };
    station
        .send(Command::ReturnPowerBank, &req.to_payload())
        .await;
    let frame = station.recv_command(Command::ReturnPowerBank).await;
    assert_eq!(
        ReturnReply::parse(&frame.payload).unwrap().result,
        powercab_proto::ReturnCode::Ok
    );

    assert_eq!(waiter.await.unwrap().unwrap(), order.id);
    let closed = storage.get_order(order.id).await.unwrap();
    assert_eq!(closed.status, OrderStatus::ReturnDamage);
    let broken = storage
        .get_powerbank_by_serial("PB000001")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(broken.status, PowerbankStatus::UserReportedBroken);
    assert!(storage
        .get_station_powerbank(station_id, 3)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_suspicious_budget_closes_connection() {
    let config = EngineConfig::default().with_max_suspicious(2);
    let (engine, _storage, _station_id) = engine_with_station(config);
    let mut station = TestStation::connect(&engine, 1);
    station.login("STN001", 5, vec![]).await;

    // Corrupt the checksum byte; each one counts against the budget.
    let mut bad = Frame::encode(Command::Heartbeat, 1, &[], SECRET);
    bad[4] ^= 0xFF;
    station.send_raw(&bad).await;
    station.send_raw(&bad).await;
    station.send_raw(&bad).await;

    assert!(station.closed().await);
}

#[tokio::test]
async fn test_valid_frame_resets_suspicious_budget() {
    let config = EngineConfig::default().with_max_suspicious(2);
    let (engine, _storage, _station_id) = engine_with_station(config);
    let mut station = TestStation::connect(&engine, 1);
    station.login("STN001", 5, vec![]).await;

    let mut bad = Frame::encode(Command::Heartbeat, 1, &[], SECRET);
    bad[4] ^= 0xFF;

    station.send_raw(&bad).await;
    station.send_raw(&bad).await;
    station.send(Command::Heartbeat, &[]).await;
    station.recv_command(Command::Heartbeat).await;

    // Budget is back to zero, so two more malformed frames still fit.
    station.send_raw(&bad).await;
    station.send_raw(&bad).await;
    station.send(Command::Heartbeat, &[]).await;
    station.recv_command(Command::Heartbeat).await;
}

#[tokio::test]
async fn test_opcode_before_login_is_suspicious() {
    let config = EngineConfig::default().with_max_suspicious(1);
    let (engine, _storage, _station_id) = engine_with_station(config);
    let mut station = TestStation::connect(&engine, 1);

    station.send(Command::Heartbeat, &[]).await;
    station.send(Command::Heartbeat, &[]).await;
    assert!(station.closed().await);
}

#[tokio::test]
async fn test_oversized_frame_closes_immediately() {
    let (engine, _storage, _station_id) = engine_with_station(EngineConfig::default());
    let mut station = TestStation::connect(&engine, 1);
    station.login("STN001", 5, vec![]).await;

    // A length word past the cap is unrecoverable.
    station.send_raw(&0x7FFFu16.to_be_bytes()).await;
    assert!(station.closed().await);
}

#[tokio::test]
async fn test_duplicate_login_evicts_older_connection() {
    let (engine, _storage, station_id) = engine_with_station(EngineConfig::default());

    let mut first = TestStation::connect(&engine, 1);
    first.login("STN001", 5, vec![]).await;
    assert!(engine.is_station_online(station_id));

    let mut second = TestStation::connect(&engine, 2);
    second.login("STN001", 5, vec![]).await;

    assert!(first.closed().await);
    assert!(engine.is_station_online(station_id));

    // The surviving connection still serves traffic.
    second.send(Command::Heartbeat, &[]).await;
    second.recv_command(Command::Heartbeat).await;
}

#[tokio::test]
async fn test_force_eject_round_trip() {
    let (engine, storage, station_id) = engine_with_station(EngineConfig::default());
    let mut station = TestStation::connect(&engine, 1);
    station
        .login("STN001", 4, vec![reading(1, "PB000001")])
        .await;

    let eject = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.force_eject(station_id, 1).await })
    };

    let frame = station.recv_command(Command::ForceEject).await;
    assert_eq!(frame.payload, vec![1]);
    station.send(Command::ForceEject, &[1, 1]).await;

    eject.await.unwrap().unwrap();
    assert!(storage
        .get_station_powerbank(station_id, 1)
        .await
        .unwrap()
        .is_none());
    assert_eq!(
        storage.get_station(station_id).await.unwrap().remain_num,
        5
    );
}

#[tokio::test]
async fn test_admin_volume_round_trip() {
    let (engine, _storage, station_id) = engine_with_station(EngineConfig::default());
    let mut station = TestStation::connect(&engine, 1);
    station.login("STN001", 5, vec![]).await;

    let query = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.query_voice_volume(station_id).await })
    };
    station.recv_command(Command::QueryVoiceVolume).await;
    station.send(Command::QueryVoiceVolume, &[7]).await;
    assert_eq!(query.await.unwrap().unwrap(), 7);
}

#[tokio::test]
async fn test_slot_abnormal_report_marks_bank_system_error() {
    let (engine, storage, _station_id) = engine_with_station(EngineConfig::default());
    let mut station = TestStation::connect(&engine, 1);
    station
        .login("STN001", 4, vec![reading(1, "PB000001")])
        .await;

    let report = SlotAbnormalReport {
        slot: 1,
        error_code: 3,
        terminal_id: "PB000001".to_string(),
    };
    station
        .send(Command::SlotAbnormalReport, &report.to_payload())
        .await;
    let ack = station.recv_command(Command::SlotAbnormalReport).await;
    assert_eq!(ack.payload, vec![1]);

    let bank = storage
        .get_powerbank_by_serial("PB000001")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(bank.status, PowerbankStatus::SystemError);
}

#[tokio::test]
async fn test_admin_restart_and_address_round_trips() {
    let (engine, _storage, station_id) = engine_with_station(EngineConfig::default());
    let mut station = TestStation::connect(&engine, 1);
    station.login("STN001", 5, vec![]).await;

    let restart = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.restart_cabinet(station_id).await })
    };
    let frame = station.recv_command(Command::RestartCabinet).await;
    assert!(frame.payload.is_empty());
    station.send(Command::RestartCabinet, &[1]).await;
    restart.await.unwrap().unwrap();

    let set = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .set_server_address(station_id, "tcp://cab.example.net:7020")
                .await
        })
    };
    let frame = station.recv_command(Command::SetServerAddress).await;
    assert_eq!(frame.payload, b"tcp://cab.example.net:7020");
    station.send(Command::SetServerAddress, &[1]).await;
    set.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_operations_fail_fast_when_station_offline() {
    let (engine, storage, station_id) = engine_with_station(EngineConfig::default());
    let bank = storage
        .create_powerbank("PB000001", PowerbankStatus::Active)
        .await
        .unwrap();

    let err = engine
        .request_borrow(station_id, bank.id, 77)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::StationOffline(_)));

    let err = engine.force_eject(station_id, 1).await.unwrap_err();
    assert!(matches!(err, EngineError::StationOffline(_)));
}
