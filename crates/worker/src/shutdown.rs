use checkmill_engine::PoolController;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};

enum Sig {
    Stop,
    Status,
}

/// Translate process signals into pool actions.
///
/// SIGINT/SIGTERM request a graceful stop; a second one exits immediately
/// with status 2. SIGUSR1 logs the current pool status.
pub fn spawn_signal_handler(controller: PoolController) {
    tokio::spawn(async move {
        let Ok(mut term) = signal(SignalKind::terminate()) else { return };
        let Ok(mut int) = signal(SignalKind::interrupt()) else { return };
        let Ok(mut usr1) = signal(SignalKind::user_defined1()) else { return };

        let mut stopping = false;
        loop {
            let sig = tokio::select! {
                _ = term.recv() => Sig::Stop,
                _ = int.recv() => Sig::Stop,
                _ = usr1.recv() => Sig::Status,
            };
            match sig {
                Sig::Status => {
                    let snap = controller.snapshot();
                    info!(
                        population = snap.population,
                        in_flight = snap.in_flight,
                        shutdown = snap.shutdown,
                        "pool status"
                    );
                }
                Sig::Stop if !stopping => {
                    stopping = true;
                    info!("shutdown requested, letting running checks finish (send again to exit immediately)");
                    controller.request_stop();
                }
                Sig::Stop => {
                    error!("second shutdown signal, exiting immediately");
                    std::process::exit(2);
                }
            }
        }
    });
}
