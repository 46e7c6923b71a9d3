//! Local notification alarms: wake timers, scheduling and reboot recovery.

pub mod recovery;
pub mod scheduler;
pub mod wake;

pub use recovery::{RebootRecovery, RecoveryReport};
pub use scheduler::{AlarmScheduler, INVALID_REQUEST_ID, LocalNotificationRequest, MessageDispatcher};
pub use wake::{TokioWakeTimer, WakeEvent, WakeTimer};
