//! Pure connection transitions: `(state, event) -> (state, effects)`.
//!
//! Nothing in this module performs I/O. The runner in `machine.rs` applies
//! transitions under its lock and executes the returned effects afterwards.

use std::time::Duration;

use strum_macros::Display;
use tokio::sync::oneshot;
use tracing::trace;

use crate::apdu::{ApduResponse, DisconnectionHeuristic, GET_APP_AND_VERSION};
use crate::error::DeviceExchangeError;

pub(crate) type ExchangeResult = Result<ApduResponse, DeviceExchangeError>;

/// Externally visible state of a connection.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Display)]
pub enum ConnectionStateKind {
    Connected,
    SendingApdu,
    WaitingForReconnection,
    WaitingForReconnectionWithQueuedSendApdu,
    Terminated,
}

/// Tag for one adapter dispatch. Outcomes with a stale tag are ignored.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, derive_more::Display)]
pub(crate) struct ExchangeId(u64);

#[derive(Debug, Default)]
pub(crate) struct ExchangeIds {
    last: u64,
}

impl ExchangeIds {
    pub(crate) fn next(&mut self) -> ExchangeId {
        self.last += 1;
        ExchangeId(self.last)
    }
}

/// Single-use continuation of an admitted `send_apdu` call.
#[derive(Debug)]
pub(crate) struct Responder(oneshot::Sender<ExchangeResult>);

impl Responder {
    pub(crate) fn new(sender: oneshot::Sender<ExchangeResult>) -> Self {
        Self(sender)
    }

    pub(crate) fn respond(self, result: ExchangeResult) {
        if self.0.send(result).is_err() {
            trace!("caller stopped waiting for the APDU response");
        }
    }
}

#[derive(Debug)]
pub(crate) struct ApduRequest {
    pub(crate) apdu: Vec<u8>,
    pub(crate) triggers_disconnection: bool,
    pub(crate) abort_timeout: Option<Duration>,
    pub(crate) responder: Responder,
}

#[derive(Debug)]
pub(crate) enum ConnectionState {
    Connected,
    SendingApdu {
        request: ApduRequest,
        exchange: ExchangeId,
    },
    WaitingForReconnection,
    WaitingForReconnectionWithQueuedSendApdu {
        request: ApduRequest,
    },
    Terminated,
}

impl ConnectionState {
    pub(crate) fn kind(&self) -> ConnectionStateKind {
        match self {
            Self::Connected => ConnectionStateKind::Connected,
            Self::SendingApdu { .. } => ConnectionStateKind::SendingApdu,
            Self::WaitingForReconnection => ConnectionStateKind::WaitingForReconnection,
            Self::WaitingForReconnectionWithQueuedSendApdu { .. } => {
                ConnectionStateKind::WaitingForReconnectionWithQueuedSendApdu
            }
            Self::Terminated => ConnectionStateKind::Terminated,
        }
    }
}

#[derive(Debug)]
pub(crate) enum Event {
    SendApduCalled(ApduRequest),
    ApduResponseReceived {
        exchange: ExchangeId,
        response: ApduResponse,
    },
    ApduSendingError {
        exchange: ExchangeId,
        error: DeviceExchangeError,
    },
    DeviceAttached,
    DeviceDetached,
    ReconnectionTimedOut,
    CloseConnectionCalled,
}

impl Event {
    fn name(&self) -> &'static str {
        match self {
            Self::SendApduCalled(_) => "send_apdu_called",
            Self::ApduResponseReceived { .. } => "apdu_response_received",
            Self::ApduSendingError { .. } => "apdu_sending_error",
            Self::DeviceAttached => "device_attached",
            Self::DeviceDetached => "device_detached",
            Self::ReconnectionTimedOut => "reconnection_timed_out",
            Self::CloseConnectionCalled => "close_connection_called",
        }
    }
}

#[derive(Debug)]
pub(crate) enum Effect {
    /// Hand the APDU to the adapter; report the outcome tagged with `exchange`.
    Dispatch {
        exchange: ExchangeId,
        apdu: Vec<u8>,
        abort_timeout: Option<Duration>,
    },
    /// Send the probe, then run `then` once the probe has settled.
    DispatchProbe {
        exchange: ExchangeId,
        apdu: Vec<u8>,
        then: Box<Effect>,
    },
    Respond {
        responder: Responder,
        result: ExchangeResult,
    },
    StartTimer,
    CancelTimer,
    RequestReconnection,
    /// Close the adapter, then run the termination hook.
    CloseAdapter,
}

#[derive(Debug)]
pub(crate) struct Transition {
    pub(crate) state: ConnectionState,
    pub(crate) effects: Vec<Effect>,
}

impl Transition {
    fn to(state: ConnectionState, effects: Vec<Effect>) -> Self {
        Self { state, effects }
    }

    fn terminate(mut effects: Vec<Effect>) -> Self {
        effects.extend([Effect::CancelTimer, Effect::CloseAdapter]);
        Self::to(ConnectionState::Terminated, effects)
    }
}

pub(crate) struct TransitionContext<'a> {
    pub(crate) heuristic: &'a dyn DisconnectionHeuristic,
    pub(crate) exchange_ids: &'a mut ExchangeIds,
}

fn respond(request: ApduRequest, result: ExchangeResult) -> Effect {
    Effect::Respond {
        responder: request.responder,
        result,
    }
}

fn dispatch(request: ApduRequest, exchange_ids: &mut ExchangeIds) -> (ConnectionState, Effect) {
    let exchange = exchange_ids.next();
    let effect = Effect::Dispatch {
        exchange,
        apdu: request.apdu.clone(),
        abort_timeout: request.abort_timeout,
    };
    (ConnectionState::SendingApdu { request, exchange }, effect)
}

fn start_waiting(mut effects: Vec<Effect>) -> Transition {
    effects.extend([Effect::StartTimer, Effect::RequestReconnection]);
    Transition::to(ConnectionState::WaitingForReconnection, effects)
}

/// Applies one event.
pub(crate) fn transition(
    state: ConnectionState,
    event: Event,
    context: &mut TransitionContext<'_>,
) -> Transition {
    use ConnectionState as S;
    use DeviceExchangeError as E;
    use Event as Ev;

    match (state, event) {
        (S::Connected, Ev::SendApduCalled(request)) => {
            let (state, effect) = dispatch(request, context.exchange_ids);
            Transition::to(state, vec![effect])
        }
        (S::Connected, Ev::DeviceDetached) => start_waiting(Vec::new()),
        (S::Connected, Ev::CloseConnectionCalled) => Transition::terminate(Vec::new()),

        (
            S::SendingApdu { request, exchange },
            Ev::ApduResponseReceived {
                exchange: received,
                response,
            },
        ) if received == exchange => {
            let expects_disconnect = response.is_success()
                && (request.triggers_disconnection
                    || context.heuristic.triggers_disconnection(&request.apdu));
            if expects_disconnect {
                let probe = Effect::DispatchProbe {
                    exchange: context.exchange_ids.next(),
                    apdu: GET_APP_AND_VERSION.to_vec(),
                    then: Box::new(respond(request, Ok(response))),
                };
                start_waiting(vec![probe])
            } else {
                Transition::to(S::Connected, vec![respond(request, Ok(response))])
            }
        }
        (
            S::SendingApdu { request, exchange },
            Ev::ApduSendingError {
                exchange: received,
                error,
            },
        ) if received == exchange => {
            Transition::to(S::Connected, vec![respond(request, Err(error))])
        }
        (S::SendingApdu { request, .. }, Ev::DeviceDetached) => {
            start_waiting(vec![respond(request, Err(E::DeviceDisconnectedWhileSending))])
        }
        (S::SendingApdu { request, .. }, Ev::CloseConnectionCalled) => {
            Transition::terminate(vec![respond(request, Err(E::DeviceDisconnectedWhileSending))])
        }

        (S::WaitingForReconnection, Ev::DeviceAttached) => {
            Transition::to(S::Connected, vec![Effect::CancelTimer])
        }
        (S::WaitingForReconnection, Ev::SendApduCalled(request)) => Transition::to(
            S::WaitingForReconnectionWithQueuedSendApdu { request },
            Vec::new(),
        ),
        (S::WaitingForReconnection, Ev::ReconnectionTimedOut | Ev::CloseConnectionCalled) => {
            Transition::terminate(Vec::new())
        }

        (S::WaitingForReconnectionWithQueuedSendApdu { request }, Ev::DeviceAttached) => {
            let (state, effect) = dispatch(request, context.exchange_ids);
            Transition::to(state, vec![Effect::CancelTimer, effect])
        }
        (S::WaitingForReconnectionWithQueuedSendApdu { request }, Ev::ReconnectionTimedOut) => {
            Transition::terminate(vec![respond(
                request,
                Err(E::DeviceDisconnectedBeforeSendingApdu),
            )])
        }
        (S::WaitingForReconnectionWithQueuedSendApdu { request }, Ev::CloseConnectionCalled) => {
            Transition::terminate(vec![respond(request, Err(E::DeviceDisconnectedWhileSending))])
        }

        (
            state @ (S::SendingApdu { .. } | S::WaitingForReconnectionWithQueuedSendApdu { .. }),
            Ev::SendApduCalled(request),
        ) => Transition::to(state, vec![respond(request, Err(E::AlreadySendingApdu))]),

        (S::Terminated, Ev::SendApduCalled(request)) => Transition::to(
            S::Terminated,
            vec![respond(request, Err(E::DeviceDisconnectedWhileSending))],
        ),

        (state, event) => {
            trace!(state = %state.kind(), event = event.name(), "ignoring event");
            Transition::to(state, Vec::new())
        }
    }
}
