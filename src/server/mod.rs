mod conn;
mod listen;

use {
    crate::{config::ServerConfig, db::Database, error::Result},
    conn::{Conn, State, find, parse_request},
    hashbrown::HashMap,
    nix::{
        errno::Errno,
        sys::{
            epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout},
            signal::{SigHandler, Signal, SigSet, signal},
            signalfd::{SfdFlags, SignalFd},
            socket::{SockaddrIn, getsockname},
        },
    },
    std::{
        os::fd::{AsRawFd, BorrowedFd, OwnedFd},
        sync::{
            Mutex,
            atomic::{AtomicU32, Ordering},
        },
        thread,
    },
    tracing::{debug, error, info},
};

/// shutdown bit of the shared control word
pub const CTRL_SHUTDOWN: u32 = 1;

const DEFAULT_BACKLOG: i32 = 1024;
/// epoll wait bound so every worker revisits the control word
const POLL_INTERVAL_MS: u16 = 500;

const TOKEN_LISTEN: u64 = u64::MAX;
const TOKEN_SIGNAL: u64 = u64::MAX - 1;

/// the serving half: one database handle, one listen socket, N symmetric
/// workers each running its own readiness loop
///
/// workers share the listener in exclusive-wakeup mode and the signal
/// notifier; everything else they touch is read-only after `bind`.
pub struct Server {
    cfg: ServerConfig,
    db: Database,
    ok_header: Vec<u8>,
    not_found: Vec<u8>,
    listener: OwnedFd,
    sig: Mutex<SignalFd>,
    ctrl: AtomicU32,
    backlog: i32,
}

impl Server {
    /// install signal routing and bind the listen socket
    ///
    /// termination signals are blocked here, before any worker thread exists,
    /// so they surface only through the signal notifier.
    pub fn bind(cfg: ServerConfig, db: Database) -> Result<Self> {
        unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }?;

        let mut mask = SigSet::empty();
        mask.add(Signal::SIGINT);
        mask.add(Signal::SIGTERM);
        mask.add(Signal::SIGQUIT);
        mask.add(Signal::SIGHUP);
        mask.thread_block()?;
        let sig = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)?;

        let backlog = if cfg.backlog > 0 { cfg.backlog } else { DEFAULT_BACKLOG };
        let listener = if cfg.port != 0 {
            listen::tcp4(&cfg.socket, cfg.port, backlog)?
        } else {
            listen::unix(&cfg.socket, backlog)?
        };

        let ok_header = cfg.ok_header();
        let not_found = cfg.not_found();

        Ok(Self {
            cfg,
            db,
            ok_header,
            not_found,
            listener,
            sig: Mutex::new(sig),
            ctrl: AtomicU32::new(0),
            backlog,
        })
    }

    /// bound TCP port, useful when the config asked for port 0 ephemeral
    pub fn local_port(&self) -> Result<u16> {
        Ok(getsockname::<SockaddrIn>(self.listener.as_raw_fd())?.port())
    }

    pub fn request_shutdown(&self) {
        self.ctrl.fetch_or(CTRL_SHUTDOWN, Ordering::Relaxed);
    }

    fn shutting_down(&self) -> bool {
        self.ctrl.load(Ordering::Relaxed) & CTRL_SHUTDOWN != 0
    }

    /// run the worker pool until a termination signal or `request_shutdown`
    pub fn run(&self) -> Result<()> {
        info!(threads = self.cfg.threads, "server started");
        thread::scope(|scope| {
            for id in 0..self.cfg.threads {
                scope.spawn(move || {
                    // a faulted worker only costs its own capacity
                    if let Err(e) = worker(self) {
                        error!(worker = id, error = %e, "worker failed");
                    }
                });
            }
        });
        info!("server stopped");
        Ok(())
    }

    /// resolve one request line to (status block, body bytes)
    ///
    /// a miss, a foreign method or an unparsable line all get the prebuilt
    /// 404. a HEAD hit ends at the stored header terminator.
    fn content(&self, line: &[u8]) -> (&[u8], &[u8]) {
        let miss: (&[u8], &[u8]) = (&self.not_found, &[]);

        let Some((is_head, path)) = parse_request(line) else {
            return miss;
        };
        let Some(payload) = self.db.get(path) else {
            return miss;
        };

        if !is_head {
            return (&self.ok_header, payload);
        }
        match find(payload, b"\r\n\r\n") {
            Some(pos) => (&self.ok_header, &payload[..pos + 4]),
            None => miss,
        }
    }

    /// drain the signal notifier; true when a termination signal arrived
    fn consume_signal(&self) -> bool {
        let sig = self.sig.lock().unwrap();
        let mut terminate = false;
        loop {
            match sig.read_signal() {
                Ok(Some(si)) => {
                    let signo = si.ssi_signo as i32;
                    if signo == Signal::SIGINT as i32
                        || signo == Signal::SIGTERM as i32
                        || signo == Signal::SIGQUIT as i32
                    {
                        terminate = true;
                    } else if signo == Signal::SIGHUP as i32 {
                        info!("reload requested, not supported");
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }
        terminate
    }

    fn signal_fd(&self) -> BorrowedFd<'_> {
        // the raw fd outlives the guard; the SignalFd itself lives in self
        let raw = self.sig.lock().unwrap().as_raw_fd();
        unsafe { BorrowedFd::borrow_raw(raw) }
    }
}

fn worker<'s>(srv: &'s Server) -> Result<()> {
    let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
    epoll.add(
        &srv.listener,
        EpollEvent::new(
            EpollFlags::EPOLLIN | EpollFlags::EPOLLERR | EpollFlags::EPOLLEXCLUSIVE,
            TOKEN_LISTEN,
        ),
    )?;
    epoll.add(
        srv.signal_fd(),
        EpollEvent::new(EpollFlags::EPOLLIN | EpollFlags::EPOLLERR, TOKEN_SIGNAL),
    )?;

    let mut events = vec![EpollEvent::empty(); srv.backlog.max(64) as usize];
    let mut conns: HashMap<u64, Conn<'s>> = HashMap::new();

    while !srv.shutting_down() {
        let n = match epoll.wait(&mut events, EpollTimeout::from(POLL_INTERVAL_MS)) {
            Ok(n) => n,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        };

        for ev in &events[..n] {
            match ev.data() {
                TOKEN_LISTEN => match listen::accept(&srv.listener) {
                    Ok(Some(fd)) => {
                        let token = fd.as_raw_fd() as u64;
                        epoll.add(
                            &fd,
                            EpollEvent::new(
                                EpollFlags::EPOLLIN | EpollFlags::EPOLLRDHUP | EpollFlags::EPOLLERR,
                                token,
                            ),
                        )?;
                        conns.insert(token, Conn::new(fd, srv.cfg.inbuffer));
                    }
                    Ok(None) => {}
                    Err(e) => debug!(error = %e, "accept"),
                },
                TOKEN_SIGNAL => {
                    if srv.consume_signal() {
                        info!("got signal, exiting");
                        srv.request_shutdown();
                    }
                }
                token => {
                    let Some(c) = conns.get_mut(&token) else {
                        continue;
                    };

                    if ev.events().contains(EpollFlags::EPOLLERR) {
                        c.state = State::Close;
                    } else {
                        if ev.events().contains(EpollFlags::EPOLLIN) && c.state == State::Recv {
                            match c.fill(srv) {
                                Ok(false) => {
                                    if c.state == State::Send {
                                        let mut out = EpollEvent::new(
                                            EpollFlags::EPOLLOUT
                                                | EpollFlags::EPOLLRDHUP
                                                | EpollFlags::EPOLLERR,
                                            token,
                                        );
                                        epoll.modify(c.fd(), &mut out)?;
                                    }
                                }
                                Ok(true) => c.state = State::Close,
                                Err(e) => {
                                    debug!(error = %e, "closing connection");
                                    c.state = State::Close;
                                }
                            }
                        }
                        if c.state == State::Send {
                            if let Err(e) = c.drain() {
                                debug!(error = %e, "closing connection");
                                c.state = State::Close;
                            }
                        }
                    }

                    if c.state == State::Close {
                        let c = conns.remove(&token).unwrap();
                        let _ = epoll.delete(c.fd());
                    }
                }
            }
        }
    }

    // cleanup pass: whatever is still live goes down with the worker
    for (_, c) in conns.drain() {
        let _ = epoll.delete(c.fd());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{builder, config::BuildConfig},
        assert2::check as assert,
        std::{
            io::{Read, Write},
            net::TcpStream,
            os::unix::net::UnixStream,
        },
        tempfile::{TempDir, tempdir},
    };

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        find(haystack, needle).is_some()
    }

    fn staged_db() -> (TempDir, std::path::PathBuf) {
        let dir = tempdir().unwrap();
        let body = dir.path().join("body-a");
        std::fs::write(&body, b"hello").unwrap();

        let manifest = dir.path().join("manifest.tsv");
        std::fs::write(
            &manifest,
            format!("/a\t{}\tContent-Type: text/plain\n", body.display()),
        )
        .unwrap();

        let db_dir = dir.path().join("db");
        builder::build(&BuildConfig {
            src: manifest,
            db: db_dir.clone(),
            dedup: false,
        })
        .unwrap();
        (dir, db_dir)
    }

    fn server_config(db: std::path::PathBuf, socket: String, port: u16) -> ServerConfig {
        ServerConfig {
            db,
            socket,
            port,
            threads: 2,
            backlog: 16,
            inbuffer: 1024,
            headers: vec!["Server: caecod-test".into(), "Connection: close".into()],
            h404: vec!["Content-Length: 0".into()],
        }
    }

    fn tcp_request(port: u16, request: &str) -> Vec<u8> {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream.write_all(request.as_bytes()).unwrap();
        let mut out = Vec::new();
        let _ = stream.read_to_end(&mut out);
        out
    }

    #[test]
    fn test_tcp_get_head_and_miss() {
        let (_dir, db_dir) = staged_db();
        let cfg = server_config(db_dir.clone(), "127.0.0.1".into(), 0);
        let server = Server::bind(cfg, Database::open(&db_dir).unwrap()).unwrap();
        let port = server.local_port().unwrap();

        thread::scope(|scope| {
            let running = scope.spawn(|| server.run());

            let reply = tcp_request(port, "GET /a HTTP/1.0\r\n\r\n");
            assert!(reply.starts_with(b"HTTP/1.1 200 OK\r\nServer: caecod-test\r\n"));
            assert!(contains(&reply, b"Content-Type: text/plain\r\n\r\nhello"));

            let reply = tcp_request(port, "HEAD /a HTTP/1.0\r\n\r\n");
            assert!(reply.starts_with(b"HTTP/1.1 200 OK\r\n"));
            assert!(reply.ends_with(b"Content-Type: text/plain\r\n\r\n"));
            assert!(!contains(&reply, b"hello"));

            let reply = tcp_request(port, "GET /does-not-exist HTTP/1.0\r\n\r\n");
            assert!(reply.starts_with(b"HTTP/1.1 404 Not Found\r\n"));
            assert!(reply.ends_with(b"Content-Length: 0\r\n\r\n"));

            let reply = tcp_request(port, "DELETE /a HTTP/1.0\r\n\r\n");
            assert!(reply.starts_with(b"HTTP/1.1 404 Not Found\r\n"));

            server.request_shutdown();
            running.join().unwrap().unwrap();
        });
    }

    #[test]
    fn test_oversized_request_closed_without_reply() {
        let (_dir, db_dir) = staged_db();
        let cfg = server_config(db_dir.clone(), "127.0.0.1".into(), 0);
        let server = Server::bind(cfg, Database::open(&db_dir).unwrap()).unwrap();
        let port = server.local_port().unwrap();

        thread::scope(|scope| {
            let running = scope.spawn(|| server.run());

            let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
            let flood = vec![b'x'; 2048];
            let _ = stream.write_all(&flood);
            let mut out = Vec::new();
            let _ = stream.read_to_end(&mut out);
            assert!(out.is_empty());

            server.request_shutdown();
            running.join().unwrap().unwrap();
        });
    }

    #[test]
    fn test_unix_socket_round_trip() {
        let (_dir, db_dir) = staged_db();
        let sock_dir = tempdir().unwrap();
        let sock_path = sock_dir.path().join("caecod.sock");
        let cfg = server_config(db_dir.clone(), sock_path.to_str().unwrap().into(), 0);
        let server = Server::bind(cfg, Database::open(&db_dir).unwrap()).unwrap();

        thread::scope(|scope| {
            let running = scope.spawn(|| server.run());

            let mut stream = UnixStream::connect(&sock_path).unwrap();
            stream.write_all(b"GET /a HTTP/1.0\r\n\r\n").unwrap();
            let mut out = Vec::new();
            let _ = stream.read_to_end(&mut out);
            assert!(out.starts_with(b"HTTP/1.1 200 OK\r\n"));
            assert!(contains(&out, b"hello"));

            server.request_shutdown();
            running.join().unwrap().unwrap();
        });
    }
}
