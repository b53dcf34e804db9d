//! Input source and readability check
//!
//! A run reads exactly one input: standard input, a file, or an in-memory buffer handed
//! over by a caller of the library API. Before anything instance-related is created the
//! input is checked for data; an input without data ends the run with "no input".

use crate::error::{LoadError, Result};
use std::fs::File;
use std::io;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tracing::debug;

/// Where the records come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSource {
    Stdin,
    Path(PathBuf),
    Buffer(Vec<u8>),
}

impl InputSource {
    /// Standard input unless a path is given.
    pub fn from_path(path: Option<PathBuf>) -> Self {
        match path {
            Some(path) => InputSource::Path(path),
            None => InputSource::Stdin,
        }
    }

    /// Open the source for this run.
    pub fn open(self) -> Result<OpenInput> {
        let state = match self {
            InputSource::Stdin => Opened::Stdin,
            InputSource::Path(path) => {
                let file = File::open(&path)
                    .map_err(|e| LoadError::resource("open input file", &path, e.to_string()))?;
                debug!(path = %path.display(), "Opened input file");
                Opened::File { path, file }
            },
            InputSource::Buffer(buffer) => Opened::Buffer(buffer),
        };
        Ok(OpenInput { state })
    }
}

#[derive(Debug)]
enum Opened {
    Stdin,
    File { path: PathBuf, file: File },
    Buffer(Vec<u8>),
    Closed,
}

/// An input opened by the run; closed again during cleanup
#[derive(Debug)]
pub struct OpenInput {
    state: Opened,
}

impl OpenInput {
    /// Whether the input has data, waiting at most `timeout` (forever when `None`).
    ///
    /// Regular files and buffers answer immediately from their length. Pipes, terminals
    /// and sockets are polled: readable data means yes, a hang-up without data or an
    /// expired timeout means no.
    pub fn has_data(&self, timeout: Option<Duration>) -> Result<bool> {
        let ready = match &self.state {
            Opened::Stdin => {
                let fd = io::stdin().as_fd().try_clone_to_owned()?;
                readiness(&File::from(fd), timeout)?
            },
            Opened::File { file, .. } => readiness(file, timeout)?,
            Opened::Buffer(buffer) => !buffer.is_empty(),
            Opened::Closed => false,
        };
        Ok(ready)
    }

    /// Standard input for the splitter. A buffer gets a pipe the coordinator feeds.
    pub fn splitter_stdin(&self) -> Result<Stdio> {
        let stdio = match &self.state {
            Opened::Stdin => Stdio::inherit(),
            Opened::File { file, .. } => Stdio::from(file.try_clone()?),
            Opened::Buffer(_) => Stdio::piped(),
            Opened::Closed => Stdio::null(),
        };
        Ok(stdio)
    }

    /// Take the in-memory buffer out for feeding.
    pub fn take_buffer(&mut self) -> Option<Vec<u8>> {
        match &mut self.state {
            Opened::Buffer(buffer) => Some(std::mem::take(buffer)),
            _ => None,
        }
    }

    /// Release whatever this run opened. Standard input is left alone.
    pub fn close(&mut self) {
        if let Opened::File { path, .. } = &self.state {
            debug!(path = %path.display(), "Closing input file");
        }
        self.state = Opened::Closed;
    }
}

fn readiness(file: &File, timeout: Option<Duration>) -> io::Result<bool> {
    let metadata = file.metadata()?;
    if metadata.is_file() {
        return Ok(metadata.len() > 0);
    }
    poll_readable(file.as_raw_fd(), timeout)
}

fn poll_readable(fd: RawFd, timeout: Option<Duration>) -> io::Result<bool> {
    let timeout_ms = match timeout {
        None => -1,
        Some(timeout) => libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX),
    };
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    loop {
        // SAFETY: pollfd is a valid, exclusively borrowed array of one element.
        let rc = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
        match rc {
            -1 => {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    return Err(err);
                }
            },
            0 => return Ok(false),
            _ => return Ok(pollfd.revents & libc::POLLIN != 0),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::FromRawFd;

    fn pipe() -> (File, File) {
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) }
    }

    #[test]
    fn test_buffer_readiness() {
        let empty = InputSource::Buffer(Vec::new()).open().unwrap();
        assert!(!empty.has_data(None).unwrap());

        let mut full = InputSource::Buffer(b"1,2\n".to_vec()).open().unwrap();
        assert!(matches!(full.state, Opened::Buffer(_)));
        assert!(full.has_data(None).unwrap());
        assert_eq!(full.take_buffer().unwrap(), b"1,2\n");
    }

    #[test]
    fn test_regular_file_readiness() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty.csv");
        let full = dir.path().join("full.csv");
        std::fs::write(&empty, "").unwrap();
        std::fs::write(&full, "a\n").unwrap();

        let input = InputSource::Path(empty).open().unwrap();
        assert!(!input.has_data(None).unwrap());
        let input = InputSource::Path(full).open().unwrap();
        assert!(input.has_data(None).unwrap());
    }

    #[test]
    fn test_missing_file_is_resource_error() {
        let err = InputSource::Path(PathBuf::from("/nonexistent/in.csv"))
            .open()
            .unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::Resource);
    }

    #[test]
    fn test_pipe_readiness() {
        let (reader, mut writer) = pipe();
        assert!(!readiness(&reader, Some(Duration::from_millis(10))).unwrap());

        writer.write_all(b"x\n").unwrap();
        assert!(readiness(&reader, Some(Duration::from_millis(10))).unwrap());
    }

    #[test]
    fn test_hang_up_without_data_is_no_input() {
        let (reader, writer) = pipe();
        drop(writer);
        assert!(!readiness(&reader, None).unwrap());
    }

    #[test]
    fn test_close_releases_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.csv");
        std::fs::write(&path, "a\n").unwrap();

        let mut input = InputSource::Path(path).open().unwrap();
        input.close();
        assert!(!input.has_data(None).unwrap());
    }
}
