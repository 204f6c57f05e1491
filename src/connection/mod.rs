mod machine;
mod sender;
mod state;

pub use self::machine::{
    ConnectionStateMachine, ConnectionStateMachineParams, PendingResponse, ReconnectionHook,
    TerminationHook,
};
pub use self::sender::DeviceApduSender;
pub use self::state::ConnectionStateKind;
