//! Host shutdown signals.
//!
//! SIGINT, SIGTERM and SIGQUIT all mean "tear the monitor down and exit".

use std::io;

use tokio::signal::unix::SignalKind;
use tokio::signal::unix::signal;

/// Wait for the first shutdown signal and return its name.
pub async fn shutdown_signal() -> io::Result<&'static str> {
    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|()| "SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
        _ = quit.recv() => Ok("SIGQUIT"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::time::Duration;

    async fn raised(signum: libc::c_int) -> &'static str {
        let listening = shutdown_signal();
        tokio::pin!(listening);

        // Polling once registers the listeners
        assert!(
            tokio::time::timeout(Duration::from_millis(50), &mut listening)
                .await
                .is_err()
        );

        // SAFETY: raise only delivers a signal to this process, and tokio's
        // handler for it is installed above.
        assert_eq!(unsafe { libc::raise(signum) }, 0);

        tokio::time::timeout(Duration::from_secs(5), listening)
            .await
            .expect("signal not observed")
            .unwrap()
    }

    #[tokio::test]
    #[serial]
    async fn test_sigquit_requests_shutdown() {
        assert_eq!(raised(libc::SIGQUIT).await, "SIGQUIT");
    }

    #[tokio::test]
    #[serial]
    async fn test_sigterm_requests_shutdown() {
        assert_eq!(raised(libc::SIGTERM).await, "SIGTERM");
    }
}
