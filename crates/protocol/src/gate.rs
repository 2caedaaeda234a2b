//! One-shot completion gate.
//!
//! A gate is split into a [`GateSignal`] (moved to whoever completes the work)
//! and either a [`GateWaiter`] or a bound callback. `GateSignal::signal`
//! consumes the signal half, so a gate cannot be signaled twice. Dropping an
//! unsignaled `GateSignal` releases the other side with `None` so a waiting
//! thread can never deadlock on a lost gate.

use std::fmt;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError, bounded};

type Notify<T> = Box<dyn FnOnce(Option<T>) + Send>;

pub struct GateSignal<T> {
    label: &'static str,
    notify: Option<Notify<T>>,
}

impl<T> GateSignal<T> {
    /// Bind the signal to a callback instead of a waiter.
    ///
    /// The callback runs exactly once, on the thread that signals or drops the gate.
    pub fn with_callback<F>(label: &'static str, callback: F) -> Self
    where
        F: FnOnce(Option<T>) + Send + 'static,
    {
        Self {
            label,
            notify: Some(Box::new(callback)),
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn signal(mut self, value: T) {
        let notify = self
            .notify
            .take()
            .unwrap_or_else(|| panic!("protocol violation: gate '{}' signaled twice", self.label));
        notify(Some(value));
    }

    /// Release the other side without a value (shutdown or rejected work).
    pub fn abandon(mut self) {
        if let Some(notify) = self.notify.take() {
            tracing::debug!(gate = self.label, "completion gate abandoned");
            notify(None);
        }
    }
}

impl<T> Drop for GateSignal<T> {
    fn drop(&mut self) {
        if let Some(notify) = self.notify.take() {
            tracing::warn!(gate = self.label, "completion gate dropped unsignaled");
            notify(None);
        }
    }
}

impl<T> fmt::Debug for GateSignal<T> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("GateSignal")
            .field("label", &self.label)
            .field("armed", &self.notify.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum GateWaitError {
    #[error("completion gate '{label}' not signaled within {timeout:?}")]
    Timeout {
        label: &'static str,
        timeout: Duration,
    },
    #[error("completion gate '{label}' is still pending")]
    Pending { label: &'static str },
}

#[derive(Debug)]
pub struct GateWaiter<T> {
    label: &'static str,
    receiver: Receiver<Option<T>>,
}

impl<T> GateWaiter<T> {
    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Block until the gate is signaled. Returns `None` if it was abandoned.
    pub fn wait(self) -> Option<T> {
        self.receiver.recv().ok().flatten()
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Result<Option<T>, GateWaitError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(value) => Ok(value),
            Err(RecvTimeoutError::Timeout) => Err(GateWaitError::Timeout {
                label: self.label,
                timeout,
            }),
            Err(RecvTimeoutError::Disconnected) => Ok(None),
        }
    }

    pub fn try_wait(&self) -> Result<Option<T>, GateWaitError> {
        match self.receiver.try_recv() {
            Ok(value) => Ok(value),
            Err(TryRecvError::Empty) => Err(GateWaitError::Pending { label: self.label }),
            Err(TryRecvError::Disconnected) => Ok(None),
        }
    }
}

/// Create a gate whose completion is observed by blocking on the returned waiter.
pub fn completion_gate<T>(label: &'static str) -> (GateSignal<T>, GateWaiter<T>)
where
    T: Send + 'static,
{
    let (sender, receiver) = bounded(1);
    let signal = GateSignal::with_callback(label, move |value| {
        // The waiter may already be gone; the gate is released either way.
        let _ = sender.send(value);
    });
    (signal, GateWaiter { label, receiver })
}
