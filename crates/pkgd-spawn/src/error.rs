#[derive(thiserror::Error, Debug)]
pub enum SpawnError {
    #[error("failed to spawn '{argv0}': {source}")]
    Spawn {
        argv0: String,
        #[source]
        source: std::io::Error,
    },

    #[error("wrote {wrote}/{length} bytes to dispatcher stdin")]
    ShortWrite { wrote: usize, length: usize },

    #[error("failed to write to dispatcher stdin: {0}")]
    Write(#[source] std::io::Error),

    #[error("failed to send signal {signal} to pid {pid}: {source}")]
    Signal {
        pid: i32,
        signal: i32,
        #[source]
        source: std::io::Error,
    },

    #[error("dispatcher has already finished")]
    AlreadyFinished,

    #[error("already sending exit to the dispatcher")]
    ExitInProgress,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_spawn() {
        let err = SpawnError::Spawn {
            argv0: "pkgd-spawn-test-xxx.sh".into(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        let msg = err.to_string();
        assert!(
            msg.starts_with("failed to spawn 'pkgd-spawn-test-xxx.sh':"),
            "got: {msg}"
        );
    }

    #[test]
    fn test_display_short_write() {
        let err = SpawnError::ShortWrite {
            wrote: 3,
            length: 10,
        };
        assert_eq!(err.to_string(), "wrote 3/10 bytes to dispatcher stdin");
    }

    #[test]
    fn test_display_signal() {
        let err = SpawnError::Signal {
            pid: 1234,
            signal: libc::SIGQUIT,
            source: std::io::Error::from_raw_os_error(libc::EPERM),
        };
        let msg = err.to_string();
        assert!(msg.contains("signal 3"), "got: {msg}");
        assert!(msg.contains("pid 1234"), "got: {msg}");
    }

    #[test]
    fn test_display_protocol_misuse() {
        assert_eq!(
            SpawnError::AlreadyFinished.to_string(),
            "dispatcher has already finished"
        );
        assert_eq!(
            SpawnError::ExitInProgress.to_string(),
            "already sending exit to the dispatcher"
        );
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SpawnError>();
    }
}
