use {
    super::Server,
    crate::error::{CaecodError, Result},
    nix::{
        errno::Errno,
        unistd::{read, write},
    },
    std::os::fd::{AsFd, BorrowedFd, OwnedFd},
    tracing::debug,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum State {
    Recv,
    Send,
    Close,
}

/// one accepted connection and its response in flight
///
/// `hdr` and `body` borrow the server's prebuilt blocks and the mapped data
/// file; nothing is copied on the way out.
pub(super) struct Conn<'s> {
    fd: OwnedFd,
    pub state: State,
    buf: Vec<u8>,
    filled: usize,
    hdr: &'s [u8],
    hdr_sent: usize,
    body: &'s [u8],
    body_sent: usize,
}

impl<'s> Conn<'s> {
    pub fn new(fd: OwnedFd, inbuffer: usize) -> Self {
        Self {
            fd,
            state: State::Recv,
            buf: vec![0; inbuffer],
            filled: 0,
            hdr: &[],
            hdr_sent: 0,
            body: &[],
            body_sent: 0,
        }
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    /// read until the request line is complete or the socket runs dry
    ///
    /// `Ok(true)` asks the caller to close: peer EOF, or the buffer filled up
    /// without a CRLF in sight. once the line parses, the response is staged
    /// and the state moves to `Send`.
    pub fn fill(&mut self, srv: &'s Server) -> Result<bool> {
        loop {
            if self.filled >= self.buf.len() {
                debug!("request line exceeds input buffer");
                return Ok(true);
            }
            match read(&self.fd, &mut self.buf[self.filled..]) {
                Ok(0) => return Ok(true),
                Ok(n) => {
                    self.filled += n;
                    let Some(end) = find(&self.buf[..self.filled], b"\r\n") else {
                        continue;
                    };
                    let (hdr, body) = srv.content(&self.buf[..end]);
                    self.hdr = hdr;
                    self.body = body;
                    self.hdr_sent = 0;
                    self.body_sent = 0;
                    self.state = State::Send;
                    return Ok(false);
                }
                Err(Errno::EAGAIN) => return Ok(false),
                Err(_) => return Err(CaecodError::ReadError),
            }
        }
    }

    /// push header then body, tolerating short writes
    pub fn drain(&mut self) -> Result<()> {
        while self.hdr_sent < self.hdr.len() {
            match write(&self.fd, &self.hdr[self.hdr_sent..]) {
                Ok(n) => self.hdr_sent += n,
                Err(Errno::EAGAIN) => return Ok(()),
                Err(_) => return Err(CaecodError::WriteError),
            }
        }
        while self.body_sent < self.body.len() {
            match write(&self.fd, &self.body[self.body_sent..]) {
                Ok(n) => self.body_sent += n,
                Err(Errno::EAGAIN) => return Ok(()),
                Err(_) => return Err(CaecodError::WriteError),
            }
        }
        self.state = State::Close;
        Ok(())
    }
}

pub(super) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// match `GET` or `HEAD` (any case), at least one blank, then the path token
///
/// returns `(is_head, path)`; anything else is not a request this server
/// answers.
pub(super) fn parse_request(line: &[u8]) -> Option<(bool, &[u8])> {
    let (is_head, rest) = if line.len() > 3 && line[..3].eq_ignore_ascii_case(b"GET") {
        (false, &line[3..])
    } else if line.len() > 4 && line[..4].eq_ignore_ascii_case(b"HEAD") {
        (true, &line[4..])
    } else {
        return None;
    };

    let blanks = rest.iter().take_while(|&&b| b == b' ' || b == b'\t').count();
    if blanks == 0 {
        return None;
    }
    let rest = &rest[blanks..];

    let end = rest
        .iter()
        .position(|&b| b == b' ' || b == b'\t')
        .unwrap_or(rest.len());
    if end == 0 {
        return None;
    }
    Some((is_head, &rest[..end]))
}
