//! Timer subsystem: a priority queue of logical timers multiplexed onto a
//! single one-shot OS alarm.

pub mod alarm;
pub mod mux;
pub mod queue;

pub use alarm::{unblock_signal, Alarm, ALARM_SIGNO};
#[cfg(target_os = "linux")]
pub use alarm::TimerFdAlarm;
pub use mux::{AlarmSink, TimerMux, TimerService};
pub use queue::{TimerId, TimerNode, TimerQueue};
