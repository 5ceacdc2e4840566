use ferrite::logging;
use std::env;
use std::io;
use std::os::unix::net::UnixDatagram;
use std::time::Duration;

/// Supervisor keepalive in the systemd style: when the hosting supervisor
/// provides `WATCHDOG_USEC` and `NOTIFY_SOCKET`, the daemon proves liveness
/// every half-interval.
pub struct Watchdog {
    socket_path: Option<String>,
    interval: Option<Duration>,
}

impl Watchdog {
    pub fn from_env() -> Watchdog {
        let interval = env::var("WATCHDOG_USEC")
            .ok()
            .and_then(|raw| raw.parse::<u64>().ok())
            .filter(|&usec| usec > 0)
            .map(Duration::from_micros);

        let socket_path = env::var("NOTIFY_SOCKET").ok().filter(|path| {
            // Abstract-namespace sockets are not reachable through the
            // portable API; skip them rather than half-work.
            !path.starts_with('@')
        });

        Watchdog {
            socket_path,
            interval,
        }
    }

    #[inline]
    pub fn enabled(&self) -> bool {
        self.socket_path.is_some() && self.interval.is_some()
    }

    #[inline]
    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// How often to trigger: half the supervisor interval.
    pub fn kick_interval(&self) -> Option<Duration> {
        self.interval.map(|interval| interval / 2)
    }

    /// Emit one keepalive trigger.
    pub fn kick(&self, log: &logging::Logger) -> io::Result<()> {
        let path = match self.socket_path {
            Some(ref path) => path,
            None => return Ok(()),
        };

        let socket = UnixDatagram::unbound()?;
        match socket.send_to(b"WATCHDOG=1", path) {
            Ok(_) => Ok(()),
            Err(error) => {
                logging::warn!(log, "watchdog notify failed"; "error" => %error);
                Err(error)
            }
        }
    }

    /// Notify the supervisor the daemon is up.
    pub fn notify_ready(&self, log: &logging::Logger) {
        if let Some(ref path) = self.socket_path {
            if let Ok(socket) = UnixDatagram::unbound() {
                if let Err(error) = socket.send_to(b"READY=1", path) {
                    logging::warn!(log, "ready notify failed"; "error" => %error);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_without_env() {
        // Scoped to values this test controls; the harness does not set
        // supervisor variables.
        let watchdog = Watchdog {
            socket_path: None,
            interval: None,
        };

        assert!(!watchdog.enabled());
        assert!(watchdog.kick_interval().is_none());
        assert!(watchdog.kick(&ferrite::logging::discard()).is_ok());
    }

    #[test]
    fn test_kick_interval_is_half() {
        let watchdog = Watchdog {
            socket_path: Some("/tmp/notify".to_string()),
            interval: Some(Duration::from_secs(10)),
        };

        assert_eq!(watchdog.kick_interval(), Some(Duration::from_secs(5)));
        assert!(watchdog.enabled());
    }

    #[test]
    fn test_kick_reaches_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notify.sock");
        let receiver = UnixDatagram::bind(&path).unwrap();

        let watchdog = Watchdog {
            socket_path: Some(path.to_string_lossy().to_string()),
            interval: Some(Duration::from_secs(2)),
        };

        watchdog.kick(&ferrite::logging::discard()).unwrap();

        let mut buf = [0u8; 32];
        let (count, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..count], b"WATCHDOG=1");
    }
}
