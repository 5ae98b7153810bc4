//! Device acquisition and reader tasks
//!
//! Owns the source terminal handle and the pseudoterminal endpoints, and
//! spawns the blocking reader task behind each handle. Readers forward
//! everything over a single channel; all routing happens on the engine
//! task that drains it.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{FromRawFd, IntoRawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::libc;
use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt};
use nix::sys::termios::{self, SetArg};
use tokio::sync::mpsc;

/// Upper bound on one read from any handle. A tuning constant: routing
/// operates on whatever one read returns, in order.
pub const READ_BUFFER_SIZE: usize = 255;

/// Which handle a chunk of bytes came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    Source,
    Endpoint(usize),
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Source => write!(f, "source terminal"),
            Origin::Endpoint(index) => write!(f, "endpoint {index}"),
        }
    }
}

/// One event on the engine channel.
#[derive(Debug)]
pub enum Event {
    /// Bytes read from a handle, exactly as one read returned them.
    Data(Origin, Vec<u8>),
    /// The peer closed the handle (zero-length read). Reported as its own
    /// condition, never as an empty data chunk.
    Closed(Origin),
    /// A read failed after the handle was opened successfully.
    Failed(Origin, io::Error),
}

/// The source terminal device, opened read/write.
#[derive(Debug)]
pub struct SourcePort {
    file: File,
}

impl SourcePort {
    /// Open the source device. The terminal is switched to raw mode so the
    /// line discipline cannot rewrite bytes (echo, newline translation)
    /// and break the byte-exact forwarding contract.
    pub fn open(path: &str) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY)
            .open(path)
            .with_context(|| format!("failed to open source terminal {path}"))?;
        set_raw(&file)?;
        Ok(Self { file })
    }

    pub fn clone_reader(&self) -> io::Result<File> {
        self.file.try_clone()
    }

    pub fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.file.write_all(bytes)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// One allocated pseudoterminal endpoint.
///
/// The master side stays with this process; the slave device path is what
/// gets reported at startup for other processes to open.
pub struct PtyEndpoint {
    master: File,
    path: PathBuf,
    // Keeps the slave side open for the process lifetime so the master
    // never reports hangup while no external client holds the endpoint.
    #[allow(dead_code)]
    slave: File,
}

impl PtyEndpoint {
    /// Allocate a fresh pseudoterminal (openpt, grantpt, unlockpt) and
    /// resolve its slave device path.
    pub fn allocate() -> Result<Self> {
        let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY)
            .context("posix_openpt failed")?;
        grantpt(&master).context("grantpt failed")?;
        unlockpt(&master).context("unlockpt failed")?;
        let path = PathBuf::from(ptsname_r(&master).context("ptsname failed")?);

        // SAFETY: into_raw_fd transfers ownership of the master fd.
        let master = unsafe { File::from_raw_fd(master.into_raw_fd()) };

        let slave = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY)
            .open(&path)
            .with_context(|| format!("failed to open endpoint slave {}", path.display()))?;
        // Raw mode, same reasoning as for the source device.
        set_raw(&slave)?;

        Ok(Self {
            master,
            path,
            slave,
        })
    }

    /// Externally-addressable path other processes open to use this
    /// endpoint.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn clone_reader(&self) -> io::Result<File> {
        self.master.try_clone()
    }

    pub fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.master.write_all(bytes)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.master.flush()
    }
}

/// Put a terminal handle into raw mode. Non-terminal handles are left
/// alone, which keeps regular files usable as a stand-in source in tests.
fn set_raw(file: &File) -> Result<()> {
    let mut attrs = match termios::tcgetattr(file) {
        Ok(attrs) => attrs,
        Err(Errno::ENOTTY) => return Ok(()),
        Err(err) => return Err(err).context("tcgetattr failed"),
    };
    termios::cfmakeraw(&mut attrs);
    termios::tcsetattr(file, SetArg::TCSANOW, &attrs).context("tcsetattr failed")?;
    Ok(())
}

/// Spawn the blocking reader behind one handle. Each chunk read is
/// forwarded to the engine channel; a zero-length read or a read error
/// ends the task after reporting it.
pub fn spawn_reader<R>(mut reader: R, origin: Origin, tx: mpsc::Sender<Event>)
where
    R: Read + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => {
                    let _ = tx.blocking_send(Event::Closed(origin));
                    break;
                }
                Ok(n) => {
                    if tx.blocking_send(Event::Data(origin, buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    let _ = tx.blocking_send(Event::Failed(origin, err));
                    break;
                }
            }
        }
    });
}
