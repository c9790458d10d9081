// ABOUTME: Readiness-protocol sender for Primus.
// ABOUTME: Fire-and-forget KEY=VALUE datagrams to the socket named by NOTIFY_SOCKET.

use std::env;
use std::ffi::{OsStr, OsString};
use std::os::linux::net::SocketAddrExt;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::net::{SocketAddr, UnixDatagram};

/// Environment variable carrying the notify socket address.
pub const NOTIFY_SOCKET_ENV: &str = "NOTIFY_SOCKET";

/// Capacity of sockaddr_un's sun_path, including the terminating NUL.
const SUN_PATH_MAX: usize = 108;

/// Outcome of a successful [`notify`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// No socket binding was present; the protocol is not in use.
    NotConfigured,
    /// The full payload was handed to the kernel in one datagram.
    Delivered,
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// The state string was empty. Nothing was sent.
    #[error("readiness state must not be empty")]
    EmptyState,

    /// The binding is neither an absolute filesystem path nor an
    /// abstract-namespace name.
    #[error("unsupported notify socket address: {0:?}")]
    UnsupportedAddress(OsString),

    /// The binding does not fit in sockaddr_un.
    #[error("notify socket path too long ({len} bytes, max {max})")]
    PathTooLong { len: usize, max: usize },

    /// The kernel accepted fewer bytes than the payload. The message must
    /// go out in one datagram or not at all.
    #[error("short notify write: {sent} of {len} bytes")]
    ShortWrite { sent: usize, len: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Send a readiness state line to the socket named by `NOTIFY_SOCKET`.
///
/// `state` is one or more newline-separated `KEY=VALUE` lines, minimally
/// `READY=1`. A trailing newline is added if missing. With no binding in
/// the environment this is a successful no-op, not an error.
///
/// `unset_env` clears the binding after the attempt, so a forked child
/// cannot replay the notification.
pub fn notify(unset_env: bool, state: &str) -> Result<Delivery, NotifyError> {
    let addr = env::var_os(NOTIFY_SOCKET_ENV);
    if unset_env && addr.is_some() {
        // SAFETY: callers of this library are single-threaded daemons; no
        // other thread reads the environment concurrently.
        unsafe { env::remove_var(NOTIFY_SOCKET_ENV) };
    }
    notify_to(addr.as_deref(), state)
}

/// Same as [`notify`] but with the socket address passed explicitly.
pub fn notify_to(addr: Option<&OsStr>, state: &str) -> Result<Delivery, NotifyError> {
    if state.is_empty() {
        return Err(NotifyError::EmptyState);
    }

    let Some(addr) = addr else {
        return Ok(Delivery::NotConfigured);
    };

    let bytes = addr.as_bytes();
    if bytes.len() >= SUN_PATH_MAX {
        return Err(NotifyError::PathTooLong {
            len: bytes.len(),
            max: SUN_PATH_MAX - 1,
        });
    }

    let sock = UnixDatagram::unbound()?;
    match bytes.first() {
        Some(b'/') => sock.connect(addr)?,
        Some(b'@') => {
            let target = SocketAddr::from_abstract_name(&bytes[1..])?;
            sock.connect_addr(&target)?;
        }
        _ => return Err(NotifyError::UnsupportedAddress(addr.to_os_string())),
    }

    let mut payload = state.as_bytes().to_vec();
    if !payload.ends_with(b"\n") {
        payload.push(b'\n');
    }

    let sent = sock.send(&payload)?;
    if sent != payload.len() {
        return Err(NotifyError::ShortWrite {
            sent,
            len: payload.len(),
        });
    }

    Ok(Delivery::Delivered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;

    #[test]
    fn empty_state_is_rejected_before_any_io() {
        let addr = OsString::from("/nonexistent/notify.sock");
        let err = notify_to(Some(&addr), "").unwrap_err();
        assert!(matches!(err, NotifyError::EmptyState));
    }

    #[test]
    fn missing_binding_is_a_noop() {
        let out = notify_to(None, "READY=1").unwrap();
        assert_eq!(out, Delivery::NotConfigured);
    }

    #[test]
    fn relative_path_is_unsupported() {
        let addr = OsString::from("run/notify.sock");
        let err = notify_to(Some(&addr), "READY=1").unwrap_err();
        assert!(matches!(err, NotifyError::UnsupportedAddress(_)));
    }

    #[test]
    fn overlong_path_fails_before_connect() {
        let addr = OsString::from(format!("/{}", "x".repeat(200)));
        let err = notify_to(Some(&addr), "READY=1").unwrap_err();
        assert!(matches!(err, NotifyError::PathTooLong { .. }));
    }

    #[test]
    fn path_at_limit_fails() {
        // Exactly SUN_PATH_MAX bytes: one byte too many for the NUL.
        let addr = OsString::from(format!("/{}", "x".repeat(SUN_PATH_MAX - 1)));
        let err = notify_to(Some(&addr), "READY=1").unwrap_err();
        assert!(matches!(err, NotifyError::PathTooLong { .. }));
    }

    #[test]
    fn delivers_payload_to_filesystem_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notify.sock");
        let receiver = UnixDatagram::bind(&path).unwrap();

        let out = notify_to(Some(path.as_os_str()), "READY=1").unwrap();
        assert_eq!(out, Delivery::Delivered);

        let mut buf = [0u8; 64];
        let n = receiver.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"READY=1\n");
    }

    #[test]
    fn does_not_duplicate_trailing_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notify.sock");
        let receiver = UnixDatagram::bind(&path).unwrap();

        notify_to(Some(path.as_os_str()), "STOPPING=1\n").unwrap();

        let mut buf = [0u8; 64];
        let n = receiver.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"STOPPING=1\n");
    }

    #[test]
    fn delivers_to_abstract_namespace_socket() {
        let name = format!("primus-notify-test-{}", std::process::id());
        let bound = SocketAddr::from_abstract_name(name.as_bytes()).unwrap();
        let receiver = UnixDatagram::bind_addr(&bound).unwrap();

        let addr = OsString::from(format!("@{name}"));
        let out = notify_to(Some(&addr), "READY=1").unwrap();
        assert_eq!(out, Delivery::Delivered);

        let mut buf = [0u8; 64];
        let n = receiver.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"READY=1\n");
    }

    #[test]
    fn multiline_state_goes_out_as_one_datagram() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notify.sock");
        let receiver = UnixDatagram::bind(&path).unwrap();

        notify_to(Some(path.as_os_str()), "READY=1\nSTATUS=up").unwrap();

        let mut buf = [0u8; 64];
        let n = receiver.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"READY=1\nSTATUS=up\n");
    }
}
