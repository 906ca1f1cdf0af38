//! Command handlers, keyed by `(EntryState, CommandKind)`.
//!
//! [`lookup`] is the whole transition table: a pair with no handler is a
//! protocol violation, reported to the coordinator as
//! [`RelinkError::UnexpectedCommand`]. Handlers only ever run on the
//! coordinator thread.

use {
    crate::{
        command::{CommandBody, CommandKind, HandshakeAck},
        entry::{Entry, EntryState, Transition},
        error::{RelinkError, Result},
    },
    log::*,
};

/// A transition function for one `(state, kind)` pair.
pub type Handler = fn(&mut Entry, CommandBody, &mut Transition) -> Result<()>;

/// Find the handler for `kind` arriving while the entry is in `state`.
pub fn lookup(state: EntryState, kind: CommandKind) -> Option<Handler> {
    use {CommandKind as K, EntryState as S};

    let handler: Handler = match (state, kind) {
        // New-connection handshake.
        (S::Init, K::NewConn) => connectee_new_conn,
        (S::ConnectorNewConnSent, K::AckNewConn) => connector_new_conn_ack,
        (S::ConnecteeNewConnAck1Sent, K::AckNewConn) => connectee_new_conn_ack,

        // Join handshake.
        (S::Dead | S::DeadClosing, K::JoinConn) => connectee_join,
        (S::ConnectorJoinSent, K::AckJoinConn) => connector_join_ack1,
        (S::ConnecteeJoinAck1Sent, K::AckJoinConn) => connectee_join_ack2,
        (S::ConnectorJoinWaitDataRequest, K::DataRequestOnReconnect) => connector_resync,
        (S::ConnecteeJoinDataRequestSent, K::AckDataRequestOnReconnect) => connectee_resync_done,
        (S::ConnectorJoinWaitReady, K::AckJoinConn) => connector_join_ack3,

        // Join-close handshake.
        (S::Dead | S::DeadClosing, K::JoinCloseConn) => connectee_join_close,
        (S::ConnectorJoinCloseSent, K::AckJoinCloseConn) => connector_join_close_ack,
        (S::ConnecteeJoinCloseAck1Sent, K::AckJoinCloseConn) => connectee_join_close_ack,

        // Data flow.
        (s, K::Data) if s.carries_data() => data,
        (s, K::DataReceived) if s.carries_data() => data_received,
        (s, K::DataRequest) if s.carries_data() => data_request,

        // Close handshake.
        (S::Established, K::CloseConn) => close_conn,
        (s, K::CloseConn) if s.is_closing() => close_conn,
        (s, K::AckCloseConn) if s.is_closing() => ack_close_conn,
        (s, K::CloseDataRequest) if s.is_closing() => close_data_request,
        (s, K::AckCloseDataRequest) if s.is_closing() => ack_close_data_request,
        (s, K::ReadyToClose) if s.is_closing() => ready_to_close,
        (s, K::AckReadyToClose) if s.is_closing() => ack_ready_to_close,

        _ => return None,
    };
    Some(handler)
}

/// Run the handler for `body` against `entry`.
pub fn dispatch(entry: &mut Entry, body: CommandBody) -> Result<Transition> {
    let state = entry.state();
    let kind = body.kind();
    let handler = lookup(state, kind).ok_or(RelinkError::UnexpectedCommand { kind, state })?;
    let mut t = Transition::default();
    handler(entry, body, &mut t)?;
    Ok(t)
}

fn mismatch(entry: &Entry, body: &CommandBody) -> RelinkError {
    RelinkError::UnexpectedCommand {
        kind: body.kind(),
        state: entry.state(),
    }
}

fn step_of(entry: &Entry, body: &CommandBody) -> Result<u8> {
    match body {
        CommandBody::AckNewConn(HandshakeAck { step })
        | CommandBody::AckJoinConn(HandshakeAck { step })
        | CommandBody::AckJoinCloseConn(HandshakeAck { step }) => Ok(*step),
        other => Err(mismatch(entry, other)),
    }
}

fn expect_step(entry: &Entry, body: &CommandBody, expected: u8) -> Result<()> {
    let step = step_of(entry, body)?;
    if step != expected {
        return Err(mismatch(entry, body));
    }
    Ok(())
}

// ── New connection ──────────────────────────────────────────────────────────

fn connectee_new_conn(entry: &mut Entry, body: CommandBody, t: &mut Transition) -> Result<()> {
    let CommandBody::NewConn(target) = &body else {
        return Err(mismatch(entry, &body));
    };
    debug!(
        "{}: new connection for {}:{}",
        entry.triplet(),
        target.host,
        target.port
    );
    entry.set_state(EntryState::ConnecteeNewConnAck1Sent);
    t.send(CommandBody::AckNewConn(HandshakeAck { step: 1 }));
    Ok(())
}

fn connector_new_conn_ack(entry: &mut Entry, body: CommandBody, t: &mut Transition) -> Result<()> {
    expect_step(entry, &body, 1)?;
    t.send(CommandBody::AckNewConn(HandshakeAck { step: 2 }));
    entry.become_established(t);
    Ok(())
}

fn connectee_new_conn_ack(entry: &mut Entry, body: CommandBody, t: &mut Transition) -> Result<()> {
    expect_step(entry, &body, 2)?;
    entry.become_established(t);
    Ok(())
}

// ── Join ────────────────────────────────────────────────────────────────────

fn connectee_join(entry: &mut Entry, _body: CommandBody, t: &mut Transition) -> Result<()> {
    entry.accept_join(false)?;
    entry.set_state(EntryState::ConnecteeJoinAck1Sent);
    t.send(CommandBody::AckJoinConn(HandshakeAck { step: 1 }));
    Ok(())
}

fn connector_join_ack1(entry: &mut Entry, body: CommandBody, t: &mut Transition) -> Result<()> {
    if step_of(entry, &body)? == 0 {
        entry.lose(t);
        return Ok(());
    }
    expect_step(entry, &body, 1)?;
    entry.set_state(EntryState::ConnectorJoinWaitDataRequest);
    t.send(CommandBody::AckJoinConn(HandshakeAck { step: 2 }));
    Ok(())
}

fn connectee_join_ack2(entry: &mut Entry, body: CommandBody, t: &mut Transition) -> Result<()> {
    expect_step(entry, &body, 2)?;
    entry.set_state(EntryState::ConnecteeJoinDataRequestSent);
    t.send(entry.resync_request());
    Ok(())
}

fn connector_resync(entry: &mut Entry, body: CommandBody, t: &mut Transition) -> Result<()> {
    let CommandBody::DataRequestOnReconnect(wanted) = body else {
        return Err(mismatch(entry, &body));
    };
    entry.set_state(EntryState::ConnectorJoinWaitReady);
    entry.rewind_to(wanted.packet_id, t);
    t.send(entry.resync_reply());
    Ok(())
}

fn connectee_resync_done(entry: &mut Entry, body: CommandBody, t: &mut Transition) -> Result<()> {
    let CommandBody::AckDataRequestOnReconnect(wanted) = body else {
        return Err(mismatch(entry, &body));
    };
    entry.rewind_to(wanted.packet_id, t);
    t.send(CommandBody::AckJoinConn(HandshakeAck { step: 3 }));
    t.recovered = true;
    entry.become_established(t);
    Ok(())
}

fn connector_join_ack3(entry: &mut Entry, body: CommandBody, t: &mut Transition) -> Result<()> {
    expect_step(entry, &body, 3)?;
    t.recovered = true;
    entry.become_established(t);
    Ok(())
}

// ── Join-close ──────────────────────────────────────────────────────────────

fn connectee_join_close(entry: &mut Entry, _body: CommandBody, t: &mut Transition) -> Result<()> {
    entry.accept_join(true)?;
    entry.set_state(EntryState::ConnecteeJoinCloseAck1Sent);
    t.send(CommandBody::AckJoinCloseConn(HandshakeAck { step: 1 }));
    Ok(())
}

fn connector_join_close_ack(entry: &mut Entry, body: CommandBody, t: &mut Transition) -> Result<()> {
    if step_of(entry, &body)? == 0 {
        debug!("{}: peer already finished the close", entry.triplet());
        entry.finish_close_remotely(t);
        return Ok(());
    }
    expect_step(entry, &body, 1)?;
    t.send(CommandBody::AckJoinCloseConn(HandshakeAck { step: 2 }));
    t.recovered = true;
    entry.resume_closing(t);
    Ok(())
}

fn connectee_join_close_ack(entry: &mut Entry, body: CommandBody, t: &mut Transition) -> Result<()> {
    expect_step(entry, &body, 2)?;
    t.recovered = true;
    entry.resume_closing(t);
    Ok(())
}

// ── Data ────────────────────────────────────────────────────────────────────

fn data(entry: &mut Entry, body: CommandBody, t: &mut Transition) -> Result<()> {
    let CommandBody::Data(packet) = body else {
        return Err(mismatch(entry, &body));
    };
    entry.on_data(packet, t);
    Ok(())
}

fn data_received(entry: &mut Entry, body: CommandBody, t: &mut Transition) -> Result<()> {
    let CommandBody::DataReceived(acked) = body else {
        return Err(mismatch(entry, &body));
    };
    entry.on_acked(acked.packet_id, t);
    Ok(())
}

fn data_request(entry: &mut Entry, body: CommandBody, t: &mut Transition) -> Result<()> {
    let CommandBody::DataRequest(wanted) = body else {
        return Err(mismatch(entry, &body));
    };
    debug!(
        "{}: peer requests retransmission from {}",
        entry.triplet(),
        wanted.packet_id
    );
    entry.rewind_to(wanted.packet_id, t);
    Ok(())
}

// ── Close ───────────────────────────────────────────────────────────────────

fn close_conn(entry: &mut Entry, _body: CommandBody, t: &mut Transition) -> Result<()> {
    entry.enter_closing_from_peer(t);
    Ok(())
}

fn ack_close_conn(entry: &mut Entry, _body: CommandBody, t: &mut Transition) -> Result<()> {
    entry.request_close_data(t);
    Ok(())
}

fn close_data_request(entry: &mut Entry, body: CommandBody, t: &mut Transition) -> Result<()> {
    let CommandBody::CloseDataRequest(wanted) = body else {
        return Err(mismatch(entry, &body));
    };
    entry.answer_close_data_request(wanted.packet_id, t);
    Ok(())
}

fn ack_close_data_request(entry: &mut Entry, body: CommandBody, t: &mut Transition) -> Result<()> {
    let CommandBody::AckCloseDataRequest(final_packet) = body else {
        return Err(mismatch(entry, &body));
    };
    entry.on_peer_final(final_packet, t);
    Ok(())
}

fn ready_to_close(entry: &mut Entry, _body: CommandBody, t: &mut Transition) -> Result<()> {
    entry.on_peer_ready(t);
    Ok(())
}

fn ack_ready_to_close(entry: &mut Entry, _body: CommandBody, t: &mut Transition) -> Result<()> {
    entry.on_ready_acked(t);
    Ok(())
}

/// Reply a connectee sends on an unbound link for a connection it does not
/// know: a handshake acknowledgment with step 0.
pub fn unknown_connection_reply(kind: CommandKind) -> Option<CommandBody> {
    let unknown = HandshakeAck { step: 0 };
    match kind {
        CommandKind::JoinConn => Some(CommandBody::AckJoinConn(unknown)),
        CommandKind::JoinCloseConn => Some(CommandBody::AckJoinCloseConn(unknown)),
        _ => None,
    }
}
