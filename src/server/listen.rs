use {
    crate::error::{CaecodError, Result},
    nix::{
        errno::Errno,
        sys::socket::{
            AddressFamily, Backlog, SockFlag, SockProtocol, SockType, SockaddrIn, UnixAddr,
            accept4, bind, listen, setsockopt, socket, sockopt,
        },
    },
    std::{
        fs,
        net::{Ipv4Addr, SocketAddrV4},
        os::{
            fd::{AsRawFd, FromRawFd, OwnedFd},
            unix::fs::PermissionsExt,
        },
    },
    tracing::info,
};

/// non-blocking IPv4 listener; `"*"` binds the wildcard address
pub(super) fn tcp4(host: &str, port: u16, backlog: i32) -> Result<OwnedFd> {
    let fd = socket(
        AddressFamily::Inet,
        SockType::Stream,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        SockProtocol::Tcp,
    )
    .map_err(|_| CaecodError::BindFailed)?;
    setsockopt(&fd, sockopt::ReuseAddr, &true).map_err(|_| CaecodError::BindFailed)?;

    let ip: Ipv4Addr = if host.is_empty() || host == "*" {
        Ipv4Addr::UNSPECIFIED
    } else {
        host.parse().map_err(|_| CaecodError::BindFailed)?
    };
    let addr = SockaddrIn::from(SocketAddrV4::new(ip, port));
    bind(fd.as_raw_fd(), &addr).map_err(|_| CaecodError::BindFailed)?;
    listen(&fd, Backlog::new(backlog).map_err(|_| CaecodError::BindFailed)?)
        .map_err(|_| CaecodError::BindFailed)?;

    info!("listening at http://{host}:{port}");
    Ok(fd)
}

/// non-blocking stream listener on a filesystem path
///
/// a stale path from an earlier run is unlinked first, and the fresh socket
/// is made world-read/write so unprivileged proxies can reach it.
pub(super) fn unix(path: &str, backlog: i32) -> Result<OwnedFd> {
    if path.is_empty() {
        return Err(CaecodError::ConfigInvalid("empty socket path".into()));
    }
    let _ = fs::remove_file(path);

    let fd = socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        None,
    )
    .map_err(|_| CaecodError::BindFailed)?;
    let addr = UnixAddr::new(path).map_err(|_| CaecodError::BindFailed)?;
    bind(fd.as_raw_fd(), &addr).map_err(|_| CaecodError::BindFailed)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o666))?;
    listen(&fd, Backlog::new(backlog).map_err(|_| CaecodError::BindFailed)?)
        .map_err(|_| CaecodError::BindFailed)?;

    info!("listening at unix socket {path}");
    Ok(fd)
}

/// one accept attempt; `None` when the exclusive wakeup lost the race
pub(super) fn accept(listener: &OwnedFd) -> Result<Option<OwnedFd>> {
    match accept4(
        listener.as_raw_fd(),
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
    ) {
        Ok(fd) => Ok(Some(unsafe { OwnedFd::from_raw_fd(fd) })),
        Err(Errno::EAGAIN) => Ok(None),
        Err(_) => Err(CaecodError::AcceptFailed),
    }
}
