//! Per-opcode handlers for station-originated frames.
//!
//! The read loop hands each verified frame to [`dispatch`], which decodes
//! the typed payload and routes it. Handlers either produce a reply frame
//! for the same opcode, complete a pending request in the coordinator, or
//! both. The protocol is lenient by design: a handler failure never tears
//! the connection down.

use std::sync::Arc;

use chrono::Utc;
use powercab_proto::{
    CodecError, Command, EjectCommand, EjectResult, Frame, InventoryReport, LoginPacket,
    ReturnCode, ReturnReply, ReturnRequest, SlotAbnormalReport, StationPacket,
    EMPTY_TERMINAL_ID,
};
use tracing::{debug, info, warn};

use crate::coordinator::{ErrorReturnTicket, PendingKey, StationReply};
use crate::engine::Engine;
use crate::error::EngineError;
use crate::reconciler::reconcile_station;
use crate::session::StationConnection;
use crate::types::{
    OrderStatus, Powerbank, PowerbankId, PowerbankStatus, StationId, StationPowerbank,
    StationStatus,
};

/// What the read loop should do with a handled frame.
pub(crate) enum HandlerOutcome {
    /// Encode a reply for this opcode and queue it.
    Reply(Command, Vec<u8>),
    /// Frame consumed, nothing to send.
    None,
    /// Close the connection without replying (unprovisioned or blocked
    /// station).
    Drop,
    /// The payload was structurally invalid; count it against the
    /// suspicious budget.
    Suspicious(CodecError),
}

/// Decode a station frame and route it to its opcode handler.
pub(crate) async fn dispatch(
    engine: &Engine,
    conn: &Arc<StationConnection>,
    frame: &Frame,
) -> Result<HandlerOutcome, EngineError> {
    let packet = match StationPacket::decode(frame.command, &frame.payload) {
        Ok(packet) => packet,
        Err(e) => return Ok(HandlerOutcome::Suspicious(e)),
    };

    match packet {
        StationPacket::Login(login) => handle_login(engine, conn, frame, login).await,
        StationPacket::Heartbeat => handle_heartbeat(engine, conn).await,
        StationPacket::ReturnRequest(req) => handle_return(engine, conn, req).await,
        StationPacket::BorrowResult(result) => {
            let station_id = conn.station_id().ok_or(EngineError::ConnectionClosed)?;
            let completed = engine
                .coordinator()
                .complete(
                    &PendingKey::Borrow {
                        order_id: result.order_id as i64,
                    },
                    station_id,
                    StationReply::Borrow(result.clone()),
                )
                .await;
            if !completed {
                warn!(
                    order_id = result.order_id,
                    slot = result.slot,
                    "late borrow result, no waiter"
                );
            }
            Ok(HandlerOutcome::None)
        }
        StationPacket::InventoryReport(report) => {
            handle_inventory_report(engine, conn, report).await
        }
        StationPacket::EjectResult(result) => handle_eject_result(engine, conn, result).await,
        StationPacket::SlotAbnormal(report) => handle_slot_abnormal(engine, conn, report).await,
        StationPacket::Iccid(iccid) => handle_iccid(engine, conn, iccid).await,
        StationPacket::ServerAddress(address) => {
            complete_admin(
                engine,
                conn,
                Command::QueryServerAddress,
                StationReply::Text(address),
            )
            .await
        }
        StationPacket::SetServerAddressAck(code) => {
            complete_admin(
                engine,
                conn,
                Command::SetServerAddress,
                StationReply::Ack(code),
            )
            .await
        }
        StationPacket::RestartAck(code) => {
            complete_admin(engine, conn, Command::RestartCabinet, StationReply::Ack(code)).await
        }
        StationPacket::SetVolumeAck(code) => {
            complete_admin(engine, conn, Command::SetVoiceVolume, StationReply::Ack(code)).await
        }
        StationPacket::VolumeReport(volume) => {
            complete_admin(
                engine,
                conn,
                Command::QueryVoiceVolume,
                StationReply::Volume(volume),
            )
            .await
        }
    }
}

/// `0x60`: resolve the box id, verify the token against the station's
/// provisioned key, evict any duplicate connection, and run a full
/// inventory resync from the declared slot list.
async fn handle_login(
    engine: &Engine,
    conn: &Arc<StationConnection>,
    frame: &Frame,
    login: LoginPacket,
) -> Result<HandlerOutcome, EngineError> {
    let (station, secret) = engine
        .storage()
        .get_or_create_station(&login.box_id, login.slots_declared)
        .await?;

    let secret = match secret {
        Some(secret)
            if station.status != StationStatus::Pending
                && station.status != StationStatus::Blocked =>
        {
            secret
        }
        _ => {
            // Unprovisioned or blocked: the row exists for the operator to
            // activate, but the device gets nothing back.
            info!(
                box_id = %login.box_id,
                station_id = station.id,
                status = %station.status,
                "login from non-activated station, dropping connection"
            );
            return Ok(HandlerOutcome::Drop);
        }
    };

    if !frame.verify_token(&secret) {
        return Ok(HandlerOutcome::Suspicious(CodecError::BadToken));
    }

    if let Some(evicted) = engine.registry().bind_station(station.id, conn) {
        if let Some(old_station) = evicted.station_id() {
            engine.coordinator().cancel_for_station(old_station).await;
        }
    }
    conn.authenticate(&login.box_id, station.id, secret);

    // Maintenance is operator-owned; a reconnect must not clear it.
    if station.status != StationStatus::Maintenance {
        engine
            .storage()
            .update_station_status(station.id, StationStatus::Active)
            .await?;
    }
    engine
        .storage()
        .update_station_last_seen(station.id, Utc::now())
        .await?;

    let eject_slots = {
        let lock = engine.station_lock(station.id);
        let _guard = lock.lock().await;
        let outcome = reconcile_station(engine.storage(), &station, &login.readings, true).await?;
        engine
            .storage()
            .set_station_remain(station.id, login.remain_num)
            .await?;
        outcome.eject_slots
    };
    send_ejects(engine, conn, station.id, &eject_slots).await;

    if station.iccid.is_none() {
        if let Err(e) = engine
            .send_frame(conn, Command::QueryIccid, frame.vsn, &[])
            .await
        {
            debug!(station_id = station.id, error = %e, "ICCID backfill query failed");
        }
    }

    info!(
        station_id = station.id,
        box_id = %login.box_id,
        slots = login.slots_declared,
        remain = login.remain_num,
        "station logged in"
    );
    Ok(HandlerOutcome::Reply(Command::Login, vec![1]))
}

/// `0x61`: refresh the liveness deadline and echo an empty heartbeat.
async fn handle_heartbeat(
    engine: &Engine,
    conn: &Arc<StationConnection>,
) -> Result<HandlerOutcome, EngineError> {
    conn.mark_heartbeat();
    if let Some(station_id) = conn.station_id() {
        engine
            .storage()
            .update_station_last_seen(station_id, Utc::now())
            .await?;
    }
    Ok(HandlerOutcome::Reply(Command::Heartbeat, Vec::new()))
}

/// `0x66`: a user seated a bank. Either completes a pending error-return
/// or runs the normal return flow; the station blocks on the reply code.
async fn handle_return(
    engine: &Engine,
    conn: &Arc<StationConnection>,
    req: ReturnRequest,
) -> Result<HandlerOutcome, EngineError> {
    let station_id = conn.station_id().ok_or(EngineError::ConnectionClosed)?;
    let reply = |code: ReturnCode| {
        HandlerOutcome::Reply(
            Command::ReturnPowerBank,
            ReturnReply {
                slot: req.slot,
                result: code,
            }
            .to_payload(),
        )
    };

    if req.terminal_id.is_empty() || req.terminal_id == EMPTY_TERMINAL_ID {
        return Ok(reply(ReturnCode::Rejected));
    }

    let lock = engine.station_lock(station_id);
    let _guard = lock.lock().await;

    let bank = lookup_or_create_bank(engine, &req.terminal_id).await?;
    if engine
        .storage()
        .get_station_powerbank(station_id, req.slot)
        .await?
        .is_some()
    {
        // The stored map says something already sits there; refuse and let
        // the inventory resync sort out who is right. A pending
        // error-return stays registered for the station's retry.
        warn!(station_id, slot = req.slot, "return into occupied slot refused");
        return Ok(reply(ReturnCode::SlotOccupied));
    }

    if let Some(ticket) = engine.coordinator().take_error_return(station_id).await {
        return complete_error_return(engine, station_id, &req, &bank, ticket)
            .await
            .map(|_| reply(ReturnCode::Ok));
    }

    if let Some(order) = engine
        .storage()
        .find_open_loan_for_powerbank(bank.id)
        .await?
    {
        engine
            .storage()
            .update_order_status(order.id, OrderStatus::Return, Some(Utc::now()))
            .await?;
        info!(order_id = order.id, station_id, slot = req.slot, "loan closed by return");
    } else {
        debug!(
            station_id,
            serial = %req.terminal_id,
            "return with no open loan, accepting anyway"
        );
    }

    seat_bank(engine, station_id, req.slot, bank.id).await?;
    drop(_guard);

    // The return event carries no charge readings; ask the station for a
    // fresh report to fill them in.
    if let Err(e) = engine
        .send_frame(conn, Command::QueryInventory, 0, &[])
        .await
    {
        debug!(station_id, error = %e, "post-return inventory query failed");
    }
    Ok(reply(ReturnCode::Ok))
}

/// Error-return completion: the order closes as a damage return and the
/// bank is pulled from circulation.
async fn complete_error_return(
    engine: &Engine,
    station_id: StationId,
    req: &ReturnRequest,
    bank: &Powerbank,
    ticket: ErrorReturnTicket,
) -> Result<(), EngineError> {
    engine
        .storage()
        .update_powerbank_status(bank.id, PowerbankStatus::UserReportedBroken)
        .await?;
    engine
        .storage()
        .update_order_status(ticket.order_id, OrderStatus::ReturnDamage, Some(Utc::now()))
        .await?;
    seat_bank(engine, station_id, req.slot, bank.id).await?;

    info!(
        order_id = ticket.order_id,
        user_id = ticket.user_id,
        error_type_id = ticket.error_type_id,
        station_id,
        slot = req.slot,
        "damage return completed"
    );
    let _ = ticket.tx.send(StationReply::Return(req.clone()));
    Ok(())
}

/// `0x64`: targeted resync from a spontaneous or solicited report.
async fn handle_inventory_report(
    engine: &Engine,
    conn: &Arc<StationConnection>,
    report: InventoryReport,
) -> Result<HandlerOutcome, EngineError> {
    let station_id = conn.station_id().ok_or(EngineError::ConnectionClosed)?;
    let station = engine.storage().get_station(station_id).await?;

    let outcome = {
        let lock = engine.station_lock(station_id);
        let _guard = lock.lock().await;
        reconcile_station(engine.storage(), &station, &report.readings, false).await?
    };
    send_ejects(engine, conn, station_id, &outcome.eject_slots).await;

    engine
        .coordinator()
        .complete(
            &PendingKey::Inventory { station_id },
            station_id,
            StationReply::Inventory(outcome),
        )
        .await;
    Ok(HandlerOutcome::None)
}

/// `0x80`: asynchronous eject result. On success the slot's row is
/// removed, which frees it.
async fn handle_eject_result(
    engine: &Engine,
    conn: &Arc<StationConnection>,
    result: EjectResult,
) -> Result<HandlerOutcome, EngineError> {
    let station_id = conn.station_id().ok_or(EngineError::ConnectionClosed)?;

    if result.ok {
        let lock = engine.station_lock(station_id);
        let _guard = lock.lock().await;
        if engine
            .storage()
            .delete_station_powerbank(station_id, result.slot)
            .await?
        {
            engine.storage().adjust_station_remain(station_id, 1).await?;
        }
        info!(station_id, slot = result.slot, "slot ejected");
    } else {
        warn!(station_id, slot = result.slot, "station failed to eject slot");
    }

    engine
        .coordinator()
        .complete(
            &PendingKey::Eject {
                station_id,
                slot: result.slot,
            },
            station_id,
            StationReply::Eject(result),
        )
        .await;
    Ok(HandlerOutcome::None)
}

/// `0x83`: the station flags a seated bank as faulty.
async fn handle_slot_abnormal(
    engine: &Engine,
    conn: &Arc<StationConnection>,
    report: SlotAbnormalReport,
) -> Result<HandlerOutcome, EngineError> {
    let station_id = conn.station_id().ok_or(EngineError::ConnectionClosed)?;

    if report.terminal_id != EMPTY_TERMINAL_ID {
        let bank = lookup_or_create_bank(engine, &report.terminal_id).await?;
        engine
            .storage()
            .update_powerbank_status(bank.id, PowerbankStatus::SystemError)
            .await?;
        warn!(
            station_id,
            slot = report.slot,
            error_code = report.error_code,
            powerbank_id = bank.id,
            "slot abnormal report"
        );
    } else {
        warn!(
            station_id,
            slot = report.slot,
            error_code = report.error_code,
            "slot abnormal report for empty slot"
        );
    }
    Ok(HandlerOutcome::Reply(Command::SlotAbnormalReport, vec![1]))
}

/// `0x69`: ICCID backfill after login.
async fn handle_iccid(
    engine: &Engine,
    conn: &Arc<StationConnection>,
    iccid: String,
) -> Result<HandlerOutcome, EngineError> {
    let station_id = conn.station_id().ok_or(EngineError::ConnectionClosed)?;
    engine.storage().set_station_iccid(station_id, &iccid).await?;
    debug!(station_id, %iccid, "stored station ICCID");

    complete_admin(engine, conn, Command::QueryIccid, StationReply::Text(iccid)).await
}

async fn complete_admin(
    engine: &Engine,
    conn: &Arc<StationConnection>,
    command: Command,
    reply: StationReply,
) -> Result<HandlerOutcome, EngineError> {
    let station_id = conn.station_id().ok_or(EngineError::ConnectionClosed)?;
    let completed = engine
        .coordinator()
        .complete(&PendingKey::Admin { station_id, command }, station_id, reply)
        .await;
    if !completed {
        debug!(station_id, %command, "unsolicited admin reply");
    }
    Ok(HandlerOutcome::None)
}

async fn lookup_or_create_bank(
    engine: &Engine,
    serial: &str,
) -> Result<Powerbank, EngineError> {
    match engine.storage().get_powerbank_by_serial(serial).await? {
        Some(bank) => Ok(bank),
        None => {
            let bank = engine
                .storage()
                .create_powerbank(serial, PowerbankStatus::Unknown)
                .await?;
            info!(powerbank_id = bank.id, %serial, "created unknown power bank");
            Ok(bank)
        }
    }
}

/// Seat a bank in a slot: occupancy row plus free-slot counter.
async fn seat_bank(
    engine: &Engine,
    station_id: StationId,
    slot: u8,
    powerbank_id: PowerbankId,
) -> Result<(), EngineError> {
    engine
        .storage()
        .upsert_station_powerbank(StationPowerbank {
            station_id,
            slot,
            powerbank_id,
            level: 0,
            voltage: 0,
            temperature: 0,
            last_update: Utc::now(),
        })
        .await?;
    engine.storage().adjust_station_remain(station_id, -1).await?;
    Ok(())
}

async fn send_ejects(
    engine: &Engine,
    conn: &Arc<StationConnection>,
    station_id: StationId,
    slots: &[u8],
) {
    for &slot in slots {
        let payload = EjectCommand { slot }.to_payload();
        if let Err(e) = engine
            .send_frame(conn, Command::ForceEject, 0, &payload)
            .await
        {
            warn!(station_id, slot, error = %e, "failed to send org-mismatch eject");
        }
    }
}
