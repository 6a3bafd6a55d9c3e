//! Fault reporting for consumer callbacks

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use tracing::error;

use crate::capture::ConnectionInfo;
use crate::error::Error;

/// Which consumer callback faulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackKind {
    Frame,
    Drop,
}

/// A consumer callback that returned an error or panicked.
#[derive(Debug)]
pub struct DeliveryFault {
    pub kind: CallbackKind,
    pub connection: ConnectionInfo,
    /// Always [`Error::ConsumerFault`].
    pub error: Error,
}

impl DeliveryFault {
    pub fn sequence(&self) -> u64 {
        match self.error {
            Error::ConsumerFault { sequence, .. } => sequence,
            _ => 0,
        }
    }
}

/// Where consumer faults go. Called on whichever thread ran the callback.
pub trait Diagnostics: Send + Sync {
    fn report(&self, fault: &DeliveryFault);
}

impl<F> Diagnostics for F
where
    F: Fn(&DeliveryFault) + Send + Sync,
{
    fn report(&self, fault: &DeliveryFault) {
        self(fault)
    }
}

/// Logs faults through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDiagnostics;

impl Diagnostics for TracingDiagnostics {
    fn report(&self, fault: &DeliveryFault) {
        error!(
            kind = ?fault.kind,
            connection = %fault.connection,
            "{}",
            fault.error
        );
    }
}

/// Run a consumer callback, turning both `Err` and panics into a message.
pub(crate) fn guarded<F>(callback: F) -> std::result::Result<(), String>
where
    F: FnOnce() -> color_eyre::Result<()>,
{
    match panic::catch_unwind(AssertUnwindSafe(callback)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(report)) => Err(format!("{report:#}")),
        Err(payload) => Err(panic_message(payload.as_ref())),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panicked: {msg}")
    } else {
        "panicked with a non-string payload".to_string()
    }
}
