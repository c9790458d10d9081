// ABOUTME: Readiness datagram listener on the init notify socket.
// ABOUTME: Non-blocking receive with sender credentials; each datagram is idempotent.

use std::io::IoSliceMut;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixDatagram;
use std::path::Path;

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::socket::{recvmsg, setsockopt, sockopt, ControlMessageOwned, MsgFlags, UnixCredentials};
use tracing::warn;

/// One received notify datagram. `pid` comes from SCM_CREDENTIALS, which
/// the kernel attaches because the socket has SO_PASSCRED set; it is what
/// ties the assertion to a supervised service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub pid: Option<i32>,
    pub text: String,
}

impl Datagram {
    /// The non-empty KEY=VALUE lines of the payload.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.text.lines().filter(|line| !line.is_empty())
    }
}

pub struct NotifyListener {
    sock: UnixDatagram,
}

impl NotifyListener {
    pub fn bind(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        // A stale socket from a previous boot would make bind fail.
        let _ = std::fs::remove_file(path);

        let sock = UnixDatagram::bind(path)
            .with_context(|| format!("failed to bind notify socket {}", path.display()))?;
        sock.set_nonblocking(true)
            .context("failed to make notify socket non-blocking")?;
        setsockopt(&sock, sockopt::PassCred, &true)
            .context("failed to enable credential passing on notify socket")?;

        Ok(Self { sock })
    }

    /// Pull every datagram currently queued. Never blocks.
    pub fn drain(&self) -> Vec<Datagram> {
        let mut out = Vec::new();

        loop {
            let mut buf = [0u8; 1024];
            let mut cmsg = nix::cmsg_space!(UnixCredentials);
            let mut iov = [IoSliceMut::new(&mut buf)];

            match recvmsg::<()>(
                self.sock.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg),
                MsgFlags::empty(),
            ) {
                Ok(msg) => {
                    let pid = msg.cmsgs().ok().and_then(|mut cmsgs| {
                        cmsgs.find_map(|c| match c {
                            ControlMessageOwned::ScmCredentials(creds) => Some(creds.pid()),
                            _ => None,
                        })
                    });
                    let data: Vec<u8> = msg
                        .iovs()
                        .next()
                        .map(|slice| slice.to_vec())
                        .unwrap_or_default();
                    out.push(Datagram {
                        pid,
                        text: String::from_utf8_lossy(&data).into_owned(),
                    });
                }
                Err(Errno::EAGAIN) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    warn!(error = %e, "notify socket receive failed");
                    break;
                }
            }
        }

        out
    }
}
