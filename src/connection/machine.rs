use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bon::Builder;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use super::sender::DeviceApduSender;
use super::state::{
    ApduRequest, ConnectionState, ConnectionStateKind, Effect, Event, ExchangeId, ExchangeIds,
    ExchangeResult, Responder, Transition, TransitionContext, transition,
};
use crate::apdu::{ApduResponse, DisconnectionHeuristic, KnownDisconnectingCommands};
use crate::error::DeviceExchangeError;

/// Called once after the machine entered `Terminated` and closed the adapter.
pub type TerminationHook = Arc<dyn Fn() + Send + Sync>;

/// Called when the machine starts waiting for the device, with the time the
/// transport has to bring it back.
pub type ReconnectionHook = Arc<dyn Fn(Duration) + Send + Sync>;

/// Inputs for [`ConnectionStateMachine::new`].
#[derive(Builder)]
pub struct ConnectionStateMachineParams<S: DeviceApduSender> {
    #[builder(into)]
    device_id: String,
    sender: Arc<S>,
    timeout_duration: Duration,
    #[builder(default = default_heuristic())]
    heuristic: Arc<dyn DisconnectionHeuristic>,
    on_terminated: Option<TerminationHook>,
    try_to_reconnect: Option<ReconnectionHook>,
}

fn default_heuristic() -> Arc<dyn DisconnectionHeuristic> {
    Arc::new(KnownDisconnectingCommands)
}

/// Future returned by [`ConnectionStateMachine::send_apdu`].
///
/// Admission was already decided when the call returned; awaiting only
/// observes the outcome.
#[derive(Debug)]
#[must_use = "the APDU outcome is only observable by awaiting the response"]
pub struct PendingResponse {
    receiver: oneshot::Receiver<ExchangeResult>,
}

impl Future for PendingResponse {
    type Output = Result<ApduResponse, DeviceExchangeError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|outcome| {
                outcome.unwrap_or(Err(DeviceExchangeError::DeviceDisconnectedWhileSending))
            })
    }
}

/// Transport-agnostic connection core.
///
/// Guarantees at most one in-flight exchange, holds one request across a
/// reconnection window, and terminates when the device does not come back in
/// time. Cloning yields another handle to the same connection.
pub struct ConnectionStateMachine<S: DeviceApduSender> {
    shared: Arc<Shared<S>>,
}

impl<S: DeviceApduSender> Clone for ConnectionStateMachine<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: DeviceApduSender> fmt::Debug for ConnectionStateMachine<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionStateMachine")
            .field("device_id", &self.shared.device_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

struct Shared<S> {
    device_id: String,
    sender: Arc<S>,
    timeout_duration: Duration,
    heuristic: Arc<dyn DisconnectionHeuristic>,
    on_terminated: Option<TerminationHook>,
    try_to_reconnect: Option<ReconnectionHook>,
    core: Mutex<Core>,
}

struct Core {
    state: ConnectionState,
    exchange_ids: ExchangeIds,
    timer: Option<CancellationToken>,
    timer_generation: u64,
}

impl<S: DeviceApduSender> ConnectionStateMachine<S> {
    #[must_use]
    pub fn new(params: ConnectionStateMachineParams<S>) -> Self {
        let ConnectionStateMachineParams {
            device_id,
            sender,
            timeout_duration,
            heuristic,
            on_terminated,
            try_to_reconnect,
        } = params;

        Self {
            shared: Arc::new(Shared {
                device_id,
                sender,
                timeout_duration,
                heuristic,
                on_terminated,
                try_to_reconnect,
                core: Mutex::new(Core {
                    state: ConnectionState::Connected,
                    exchange_ids: ExchangeIds::default(),
                    timer: None,
                    timer_generation: 0,
                }),
            }),
        }
    }

    /// Submits one APDU.
    ///
    /// Admission is decided before this returns: from `Connected` the APDU is
    /// dispatched, while waiting for reconnection it is queued, and while an
    /// exchange is in flight or queued the returned future resolves with
    /// [`DeviceExchangeError::AlreadySendingApdu`].
    pub fn send_apdu(
        &self,
        apdu: impl Into<Vec<u8>>,
        triggers_disconnection: bool,
        abort_timeout: Option<Duration>,
    ) -> PendingResponse {
        let (sender, receiver) = oneshot::channel();
        let request = ApduRequest {
            apdu: apdu.into(),
            triggers_disconnection,
            abort_timeout,
            responder: Responder::new(sender),
        };
        self.shared.dispatch(Event::SendApduCalled(request));
        PendingResponse { receiver }
    }

    /// Signals that the platform reports the device connected again.
    pub fn event_device_attached(&self) {
        self.shared.dispatch(Event::DeviceAttached);
    }

    /// Signals that the platform reports the device gone.
    pub fn event_device_detached(&self) {
        self.shared.dispatch(Event::DeviceDetached);
    }

    /// Terminates the connection and releases the transport.
    pub fn close_connection(&self) {
        self.shared.dispatch(Event::CloseConnectionCalled);
    }

    #[must_use]
    pub fn state(&self) -> ConnectionStateKind {
        self.shared.core.lock().state.kind()
    }

    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.shared.device_id
    }

    #[must_use]
    pub fn sender(&self) -> &Arc<S> {
        &self.shared.sender
    }

    #[must_use]
    pub fn dependencies(&self) -> S::Dependencies {
        self.shared.sender.dependencies()
    }

    pub fn set_dependencies(&self, dependencies: S::Dependencies) {
        self.shared.sender.set_dependencies(dependencies);
    }

    /// Runs the adapter's connection setup.
    ///
    /// # Errors
    ///
    /// Returns the adapter's setup failure.
    pub async fn setup_connection(&self) -> Result<(), DeviceExchangeError> {
        self.shared.sender.setup_connection().await
    }
}

impl<S: DeviceApduSender> Shared<S> {
    fn dispatch(self: &Arc<Self>, event: Event) {
        let effects = {
            let mut core = self.core.lock();
            self.apply_locked(&mut core, event)
        };
        self.run_effects(effects);
    }

    fn reconnection_timer_fired(self: &Arc<Self>, generation: u64) {
        let effects = {
            let mut core = self.core.lock();
            if core.timer_generation != generation || core.timer.is_none() {
                trace!(generation, "ignoring stale reconnection timer");
                return;
            }
            core.timer = None;
            self.apply_locked(&mut core, Event::ReconnectionTimedOut)
        };
        self.run_effects(effects);
    }

    // Timer effects are handled here so that start/cancel order follows
    // transition order. Everything else runs after the lock is released.
    fn apply_locked(self: &Arc<Self>, core: &mut Core, event: Event) -> Vec<Effect> {
        let state = std::mem::replace(&mut core.state, ConnectionState::Terminated);
        let from = state.kind();
        let mut context = TransitionContext {
            heuristic: self.heuristic.as_ref(),
            exchange_ids: &mut core.exchange_ids,
        };
        let Transition { state, effects } = transition(state, event, &mut context);
        let to = state.kind();
        core.state = state;
        if from != to {
            debug!(device_id = %self.device_id, %from, %to, "connection state changed");
        }

        effects
            .into_iter()
            .filter_map(|effect| match effect {
                Effect::StartTimer => {
                    self.start_timer(core);
                    None
                }
                Effect::CancelTimer => {
                    if let Some(timer) = core.timer.take() {
                        timer.cancel();
                        trace!("cancelled reconnection timer");
                    }
                    None
                }
                effect => Some(effect),
            })
            .collect()
    }

    fn start_timer(self: &Arc<Self>, core: &mut Core) {
        if let Some(previous) = core.timer.take() {
            previous.cancel();
        }
        core.timer_generation += 1;
        let generation = core.timer_generation;
        let token = CancellationToken::new();
        core.timer = Some(token.clone());

        let shared = Arc::clone(self);
        let timeout = self.timeout_duration;
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = tokio::time::sleep(timeout) => shared.reconnection_timer_fired(generation),
            }
        });
        trace!(generation, ?timeout, "started reconnection timer");
    }

    fn run_effects(self: &Arc<Self>, effects: Vec<Effect>) {
        for effect in effects {
            self.run_effect(effect);
        }
    }

    fn run_effect(self: &Arc<Self>, effect: Effect) {
        match effect {
            Effect::Dispatch {
                exchange,
                apdu,
                abort_timeout,
            } => {
                let sender = Arc::clone(&self.sender);
                let in_flight = tokio::spawn(async move {
                    // The flag is only honoured by the state machine itself.
                    sender.send_apdu(&apdu, false, abort_timeout).await
                });
                let shared = Arc::clone(self);
                tokio::spawn(async move {
                    let outcome = in_flight.await.unwrap_or_else(|join_error| {
                        Err(DeviceExchangeError::unknown(join_error.to_string()))
                    });
                    let event = match outcome {
                        Ok(response) => Event::ApduResponseReceived { exchange, response },
                        Err(error) => Event::ApduSendingError { exchange, error },
                    };
                    shared.dispatch(event);
                });
            }
            Effect::DispatchProbe {
                exchange,
                apdu,
                then,
            } => {
                let shared = Arc::clone(self);
                tokio::spawn(async move { shared.probe_then(exchange, apdu, *then).await });
            }
            Effect::Respond { responder, result } => responder.respond(result),
            Effect::RequestReconnection => {
                if let Some(hook) = &self.try_to_reconnect {
                    hook(self.timeout_duration);
                }
            }
            Effect::CloseAdapter => {
                let shared = Arc::clone(self);
                tokio::spawn(async move {
                    shared.sender.close_connection().await;
                    info!(device_id = %shared.device_id, "connection terminated");
                    if let Some(hook) = &shared.on_terminated {
                        hook();
                    }
                });
            }
            Effect::StartTimer | Effect::CancelTimer => {
                warn!("timer effect reached the unlocked runner");
            }
        }
    }

    #[instrument(skip(self, apdu, then), level = "debug")]
    async fn probe_then(self: Arc<Self>, exchange: ExchangeId, apdu: Vec<u8>, then: Effect) {
        let limit = self.timeout_duration;
        let probe = self.sender.send_apdu(&apdu, false, Some(limit));
        match tokio::time::timeout(limit, probe).await {
            Ok(Ok(response)) => trace!(status_word = response.status_word(), "probe answered"),
            Ok(Err(error)) => trace!(%error, "probe failed"),
            Err(_) => debug!(timeout = ?limit, "probe unanswered"),
        }
        // The caller is answered only after the probe has been through the adapter.
        self.run_effect(then);
    }
}
