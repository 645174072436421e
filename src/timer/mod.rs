pub mod background;
pub mod client;
pub mod commands;
pub mod controller;
pub mod state;
pub mod store;

pub use background::{BackgroundRefresh, IntervalWake, ManualWake, PeriodicWake, WakeOutcome};
pub use client::{ClientError, HttpSessionApi, SessionApi, StartRequest, StopRequest};
pub use controller::{TimerController, TimerSnapshot};
pub use state::{ClientTimerState, TimerStatus};
pub use store::TimerStore;
