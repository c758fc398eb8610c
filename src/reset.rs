use tracing::debug;

use crate::message::ControlKind;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum HandshakeState {
    /// asking the remote side to reset, waiting for it to answer
    Reset,
    /// the remote side asked for a reset: confirm it once, then done
    ResetOk,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum HandshakeProgress {
    Pending,
    Complete,
}

/// Resynchronization of both ends of the tunnel.
///
/// The initiating side sends RESET at every send opportunity. The other side answers with a single
///  RESET_OK. Either side is done after seeing or sending RESET_OK, and then wipes its session state.
///  A lost RESET_OK is harmless: the initiator keeps sending RESET, and the other side (which is no
///  longer in a handshake) simply goes through the answering part once more.
#[derive(Debug)]
pub struct ResetHandshake {
    state: HandshakeState,
}

impl ResetHandshake {
    pub fn initiate() -> ResetHandshake {
        debug!("initiating reset handshake");
        ResetHandshake {
            state: HandshakeState::Reset,
        }
    }

    pub fn answer() -> ResetHandshake {
        debug!("answering reset request");
        ResetHandshake {
            state: HandshakeState::ResetOk,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// the control datagram to send at the next send opportunity
    pub fn control_kind(&self) -> ControlKind {
        match self.state {
            HandshakeState::Reset => ControlKind::Reset,
            HandshakeState::ResetOk => ControlKind::ResetOk,
        }
    }

    /// to be called after the datagram returned by [ResetHandshake::control_kind] was sent
    pub fn on_sent(&self) -> HandshakeProgress {
        match self.state {
            HandshakeState::Reset => HandshakeProgress::Pending,
            HandshakeState::ResetOk => HandshakeProgress::Complete,
        }
    }

    pub fn on_control(&mut self, kind: ControlKind) -> HandshakeProgress {
        match kind {
            ControlKind::Reset => {
                if self.state == HandshakeState::Reset {
                    debug!("remote side requested a reset as well, confirming");
                }
                self.state = HandshakeState::ResetOk;
                HandshakeProgress::Pending
            }
            ControlKind::ResetOk => HandshakeProgress::Complete,
        }
    }
}
