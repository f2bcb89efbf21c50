use tokio_util::sync::CancellationToken;

/// One-shot broadcast notification. Once fired it stays fired, any number of tasks can wait for
/// it. A fired signal is never reset, a new one has to be allocated instead.
#[derive(Clone, Debug, Default)]
pub struct Signal {
    token: CancellationToken,
}

impl Signal {
    pub fn new() -> Self {
        Signal::default()
    }

    /// Fires the signal. Firing it again has no effect.
    pub fn fire(&self) {
        self.token.cancel();
    }

    pub fn is_fired(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn wait(&self) {
        self.token.cancelled().await
    }
}
