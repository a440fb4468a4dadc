use tokio::sync::watch;

/// Caller side of a session's cancellation flag.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Session side of the cancellation flag. Checked between exchanges only, so
/// an exchange already on the air always runs to completion.
#[derive(Debug, Clone)]
pub struct CancellationSignal {
    rx: watch::Receiver<bool>,
}

impl CancellationSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }
}

pub fn cancellation() -> (CancelHandle, CancellationSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancellationSignal { rx })
}
