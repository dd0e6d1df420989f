use std::sync::{Arc, LazyLock};

use courier_common::{Signal, internal, logging};
use courier_dispatch::{DispatchProcessor, SystemClock};
use courier_smtp::SmtpMailTransport;
use tokio::sync::broadcast;

use crate::config::Courier;

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!(level = INFO, "CTRL+C entered -- Enter it again to force shutdown");
        }
        _ = terminate.recv() => {
            internal!(level = INFO, "Terminate Signal received, shutting down");
        }
    };

    let mut receiver = SHUTDOWN_BROADCAST.subscribe();

    SHUTDOWN_BROADCAST.send(Signal::Shutdown)?;

    loop {
        tokio::select! {
            sig = receiver.recv() => {
                match sig {
                    Ok(s) => tracing::debug!("Received {s:?}"),
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(e) => tracing::debug!("Received: {e:?}"),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }

    Ok(())
}

impl Courier {
    /// Run the dispatch daemon until it is asked to stop.
    ///
    /// # Errors
    ///
    /// This function will return an error if the broker cannot be recovered
    /// or the processor fails to start.
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init();

        internal!(level = INFO, "Controller running");

        let broker = self.broker.into_recovered_broker()?;
        let mail = Arc::new(SmtpMailTransport::new(self.smtp));
        let processor = DispatchProcessor::new(broker, mail, self.dispatch, Arc::new(SystemClock));

        let ret = tokio::select! {
            r = processor.serve(SHUTDOWN_BROADCAST.subscribe()) => {
                r.map_err(anyhow::Error::from)
            }
            r = shutdown() => {
                r
            }
        };

        internal!(level = INFO, "Shutting down...");

        ret
    }
}
