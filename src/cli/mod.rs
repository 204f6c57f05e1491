pub(crate) mod command;
pub(crate) mod exchange;
pub(crate) mod ui;

pub use self::command::{Args, Command, FakeArgs, LogLevel, OutputFormat, RunSettings, SendArgs};
