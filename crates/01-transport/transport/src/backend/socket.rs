//! Unix datagram backend.
//!
//! Every participant binds one `AF_UNIX` datagram socket inside
//! `<rundir>/.fusion-<index>/`, named by its id in hex. The master always owns
//! id `1`; slaves take the lowest free id from `2` upward and introduce
//! themselves to the master with an ENTER frame. One datagram carries exactly
//! one frame.
//!
//! Socket files left behind by crashed processes are detected by probing:
//! a send to a path nobody listens on fails with `ECONNREFUSED`.

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::retry_eintr;
use crate::ids::{BackendKind, EnterRequest, ParticipantId, Role, Target};
use crate::schema::{self, EnterStatus};
use crate::wire::{Message, MessageKind, MAX_FRAME_LEN};
use crate::{Transport, TransportError, TransportResult};

const ENTER_ATTEMPTS: usize = 3;
const MAX_SLAVE_IDS: u32 = 4096;

enum MasterBind {
    Bound(UnixDatagram),
    Taken,
}

/// Transport over one datagram socket per participant.
pub struct SocketTransport {
    dir: PathBuf,
    path: PathBuf,
    id: ParticipantId,
    socket: UnixDatagram,
    backlog: Mutex<VecDeque<Message>>,
    recv_buf: Mutex<Vec<u8>>,
    left: AtomicBool,
    enter_timeout: Duration,
}

impl SocketTransport {
    /// Directory holding the sockets of world `index`.
    pub fn socket_dir(rundir: &Path, index: u32) -> PathBuf {
        rundir.join(format!(".fusion-{index}"))
    }

    /// Socket path of participant `id`.
    pub fn socket_path(dir: &Path, id: ParticipantId) -> PathBuf {
        dir.join(format!("{:x}", id.raw()))
    }

    /// Enters world `request.world_index` below `rundir`.
    ///
    /// `enter_timeout` bounds the wait for the master's acknowledgement.
    pub fn enter(
        rundir: &Path,
        request: &EnterRequest,
        enter_timeout: Duration,
    ) -> TransportResult<Self> {
        let dir = Self::socket_dir(rundir, request.world_index);
        Self::enter_dir(dir, request, enter_timeout)
    }

    fn enter_dir(
        dir: PathBuf,
        request: &EnterRequest,
        enter_timeout: Duration,
    ) -> TransportResult<Self> {
        for attempt in 0..ENTER_ATTEMPTS {
            if request.role != Role::Slave {
                match bind_master(&dir)? {
                    MasterBind::Bound(socket) => {
                        tracing::debug!("bound master socket in {}", dir.display());
                        return Ok(Self::from_socket(
                            dir.clone(),
                            ParticipantId::MASTER,
                            socket,
                            enter_timeout,
                        ));
                    }
                    MasterBind::Taken if request.role == Role::Master => {
                        return Err(TransportError::MasterExists(request.world_index));
                    }
                    MasterBind::Taken => {}
                }
            }

            match Self::enter_slave(&dir, request, enter_timeout) {
                Err(TransportError::Destroyed) if request.role == Role::Any => {
                    tracing::debug!("master of {} vanished (attempt {attempt})", dir.display());
                    purge_dir(&dir)?;
                }
                Err(TransportError::Destroyed) => {
                    return Err(TransportError::init(format!(
                        "world {} has no master",
                        request.world_index
                    )));
                }
                other => return other,
            }
        }

        Err(TransportError::init(format!(
            "could not settle membership of world {} after {ENTER_ATTEMPTS} attempts",
            request.world_index
        )))
    }

    fn enter_slave(
        dir: &Path,
        request: &EnterRequest,
        enter_timeout: Duration,
    ) -> TransportResult<Self> {
        let (id, socket) = bind_slave(dir)?;
        let transport = Self::from_socket(dir.to_path_buf(), id, socket, enter_timeout);

        let enter = Message::new(MessageKind::Enter, id).with_payload(schema::encode_enter(request)?);
        if let Err(err) = transport.send(Target::Participant(ParticipantId::MASTER), &enter) {
            transport.unlink_own();
            return Err(err);
        }

        match transport.await_ack() {
            Ok((EnterStatus::Ok, _)) => Ok(transport),
            Ok((EnterStatus::VersionMismatch, found)) => {
                transport.unlink_own();
                Err(TransportError::VersionMismatch {
                    expected: request.abi,
                    found,
                })
            }
            Ok((EnterStatus::Refused, _)) => {
                transport.unlink_own();
                Err(TransportError::init("master refused the enter request"))
            }
            Err(err) => {
                transport.unlink_own();
                Err(err)
            }
        }
    }

    fn from_socket(
        dir: PathBuf,
        id: ParticipantId,
        socket: UnixDatagram,
        enter_timeout: Duration,
    ) -> Self {
        let path = Self::socket_path(&dir, id);
        Self {
            dir,
            path,
            id,
            socket,
            backlog: Mutex::new(VecDeque::new()),
            recv_buf: Mutex::new(vec![0; MAX_FRAME_LEN + 8]),
            left: AtomicBool::new(false),
            enter_timeout,
        }
    }

    fn await_ack(&self) -> TransportResult<(EnterStatus, u32)> {
        let deadline = Instant::now() + self.enter_timeout;
        let mut buf = vec![0u8; MAX_FRAME_LEN + 8];
        let result = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break Err(TransportError::Timeout("enter acknowledgement"));
            }
            self.socket.set_read_timeout(Some(remaining))?;

            let len = match retry_eintr(|| self.socket.recv(&mut buf)) {
                Ok(len) => len,
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    break Err(TransportError::Timeout("enter acknowledgement"));
                }
                Err(err) => break Err(err.into()),
            };

            match Message::decode(&buf[..len]) {
                Ok(msg) if msg.kind == MessageKind::EnterAck && msg.sender.is_master() => {
                    break Ok(schema::decode_ack(&msg.payload)?);
                }
                Ok(msg) => self.backlog.lock().push_back(msg),
                Err(err) => tracing::warn!("dropping malformed datagram during enter: {err}"),
            }
        };
        self.socket.set_read_timeout(None)?;
        result
    }

    fn unlink_own(&self) {
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                tracing::warn!("failed to remove {}: {err}", self.path.display());
            }
        }
    }

    fn send_to_path(&self, frame: &[u8], path: &Path) -> TransportResult<()> {
        retry_eintr(|| self.socket.send_to(frame, path))
            .map(|_| ())
            .map_err(TransportError::from_send)
    }

    fn broadcast(&self, frame: &[u8]) -> TransportResult<()> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(raw) = name.to_str().and_then(|s| u32::from_str_radix(s, 16).ok()) else {
                continue;
            };
            if raw == self.id.raw() {
                continue;
            }
            match self.send_to_path(frame, &entry.path()) {
                Ok(()) => {}
                Err(TransportError::Destroyed) => {
                    tracing::debug!("broadcast skipped stale participant {:#x}", raw);
                }
                Err(err) => tracing::warn!("broadcast to {:#x} failed: {err}", raw),
            }
        }
        Ok(())
    }
}

impl Transport for SocketTransport {
    fn kind(&self) -> BackendKind {
        BackendKind::Socket
    }

    fn local_id(&self) -> ParticipantId {
        self.id
    }

    fn send(&self, target: Target, message: &Message) -> TransportResult<()> {
        if self.left.load(Ordering::Acquire) {
            return Err(TransportError::Destroyed);
        }
        let frame = message.encode()?;
        match target {
            Target::Participant(id) => self.send_to_path(&frame, &Self::socket_path(&self.dir, id)),
            Target::Broadcast => self.broadcast(&frame),
        }
    }

    fn recv_blocking(&self) -> TransportResult<Message> {
        if let Some(msg) = self.backlog.lock().pop_front() {
            return Ok(msg);
        }
        if self.left.load(Ordering::Acquire) {
            return Err(TransportError::Destroyed);
        }

        let mut buf = self.recv_buf.lock();
        let len = retry_eintr(|| self.socket.recv(&mut buf[..]))?;
        if len == 0 && self.left.load(Ordering::Acquire) {
            return Err(TransportError::Destroyed);
        }
        Ok(Message::decode(&buf[..len])?)
    }

    fn wake(&self) -> TransportResult<()> {
        let frame = Message::wakeup(self.id).encode()?;
        self.send_to_path(&frame, &self.path)
    }

    fn leave(&self, emergency: bool) -> TransportResult<()> {
        if self.left.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        tracing::debug!(
            "participant {} leaving {} (emergency: {emergency})",
            self.id,
            self.dir.display()
        );
        self.unlink_own();
        if let Err(err) = self.socket.shutdown(std::net::Shutdown::Both) {
            tracing::debug!("socket shutdown: {err}");
        }
        Ok(())
    }

    fn detach(&self) {
        self.left.store(true, Ordering::Release);
    }

    fn remove_backing(&self) -> TransportResult<()> {
        match fs::remove_dir_all(&self.dir) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }

    fn fork(&self, request: &EnterRequest) -> TransportResult<Option<Box<dyn Transport>>> {
        let child = Self::enter_dir(
            self.dir.clone(),
            &request.with_role(Role::Slave),
            self.enter_timeout,
        )?;
        Ok(Some(Box::new(child)))
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        if !self.left.load(Ordering::Acquire) {
            self.unlink_own();
        }
    }
}

fn bind_master(dir: &Path) -> TransportResult<MasterBind> {
    ensure_dir(dir)?;
    let path = SocketTransport::socket_path(dir, ParticipantId::MASTER);
    for _ in 0..2 {
        match UnixDatagram::bind(&path) {
            Ok(socket) => return Ok(MasterBind::Bound(socket)),
            Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
                if socket_alive(&path)? {
                    return Ok(MasterBind::Taken);
                }
                tracing::info!("purging stale world in {}", dir.display());
                purge_dir(dir)?;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(MasterBind::Taken)
}

fn bind_slave(dir: &Path) -> TransportResult<(ParticipantId, UnixDatagram)> {
    if !dir.is_dir() {
        return Err(TransportError::Destroyed);
    }

    let first = ParticipantId::FIRST_SLAVE.raw();
    for raw in first..first + MAX_SLAVE_IDS {
        let id = ParticipantId(raw);
        let path = SocketTransport::socket_path(dir, id);
        match UnixDatagram::bind(&path) {
            Ok(socket) => return Ok((id, socket)),
            Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
                if socket_alive(&path)? {
                    continue;
                }
                fs::remove_file(&path)?;
                match UnixDatagram::bind(&path) {
                    Ok(socket) => return Ok((id, socket)),
                    Err(err) if err.kind() == io::ErrorKind::AddrInUse => continue,
                    Err(err) => return Err(err.into()),
                }
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(TransportError::Destroyed);
            }
            Err(err) => return Err(err.into()),
        }
    }
    Err(TransportError::init(format!(
        "no free participant id in {}",
        dir.display()
    )))
}

/// True when something still listens on `path`.
fn socket_alive(path: &Path) -> TransportResult<bool> {
    let checker = UnixDatagram::unbound()?;
    let frame = Message::wakeup(ParticipantId::KERNEL).encode()?;
    match retry_eintr(|| checker.send_to(&frame, path)) {
        Ok(_) => Ok(true),
        Err(err) => match TransportError::from_send(err) {
            TransportError::Destroyed => Ok(false),
            TransportError::Io(err) => {
                tracing::debug!("liveness check of {} inconclusive: {err}", path.display());
                Ok(true)
            }
            other => Err(other),
        },
    }
}

fn ensure_dir(dir: &Path) -> TransportResult<()> {
    fs::create_dir_all(dir)?;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o777))?;
    Ok(())
}

fn purge_dir(dir: &Path) -> TransportResult<()> {
    match fs::remove_dir_all(dir) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(err.into()),
        _ => {}
    }
    ensure_dir(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn request(role: Role) -> EnterRequest {
        EnterRequest {
            world_index: 0,
            abi: 7,
            pid: std::process::id() as i32,
            role,
        }
    }

    const TIMEOUT: Duration = Duration::from_secs(5);

    /// Answers ENTER frames the way a master's dispatch loop would.
    fn serve_enters(master: Arc<SocketTransport>, count: usize, abi: u32) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            let mut served = 0;
            while served < count {
                let msg = master.recv_blocking().unwrap();
                if msg.kind != MessageKind::Enter {
                    continue;
                }
                let req = schema::decode_enter(&msg.payload).unwrap();
                let status = if req.abi == abi {
                    EnterStatus::Ok
                } else {
                    EnterStatus::VersionMismatch
                };
                let ack = Message::new(MessageKind::EnterAck, ParticipantId::MASTER)
                    .with_payload(schema::encode_ack(status, abi).unwrap());
                master.send(Target::Participant(msg.sender), &ack).unwrap();
                served += 1;
            }
        })
    }

    #[test]
    fn master_then_slave() {
        let rundir = tempfile::tempdir().unwrap();
        let master =
            Arc::new(SocketTransport::enter(rundir.path(), &request(Role::Any), TIMEOUT).unwrap());
        assert_eq!(master.local_id(), ParticipantId::MASTER);

        let server = serve_enters(Arc::clone(&master), 1, 7);
        let slave = SocketTransport::enter(rundir.path(), &request(Role::Any), TIMEOUT).unwrap();
        server.join().unwrap();
        assert_eq!(slave.local_id(), ParticipantId::FIRST_SLAVE);

        let call = Message::new(MessageKind::Call, slave.local_id()).with_object(3);
        slave
            .send(Target::Participant(ParticipantId::MASTER), &call)
            .unwrap();
        assert_eq!(master.recv_blocking().unwrap(), call);
    }

    #[test]
    fn second_master_is_refused() {
        let rundir = tempfile::tempdir().unwrap();
        let _master =
            SocketTransport::enter(rundir.path(), &request(Role::Master), TIMEOUT).unwrap();
        assert!(matches!(
            SocketTransport::enter(rundir.path(), &request(Role::Master), TIMEOUT),
            Err(TransportError::MasterExists(0))
        ));
    }

    #[test]
    fn slave_without_master_fails_to_init() {
        let rundir = tempfile::tempdir().unwrap();
        assert!(matches!(
            SocketTransport::enter(rundir.path(), &request(Role::Slave), TIMEOUT),
            Err(TransportError::Init(_))
        ));
    }

    /// A socket file whose owner died is reclaimed by the next master.
    #[test]
    fn stale_master_socket_is_purged() {
        let rundir = tempfile::tempdir().unwrap();
        let dir = SocketTransport::socket_dir(rundir.path(), 0);
        fs::create_dir_all(&dir).unwrap();
        let stale = UnixDatagram::bind(SocketTransport::socket_path(&dir, ParticipantId::MASTER))
            .unwrap();
        drop(stale);

        let master =
            SocketTransport::enter(rundir.path(), &request(Role::Master), TIMEOUT).unwrap();
        assert_eq!(master.local_id(), ParticipantId::MASTER);
    }

    #[test]
    fn abi_mismatch_is_reported() {
        let rundir = tempfile::tempdir().unwrap();
        let master =
            Arc::new(SocketTransport::enter(rundir.path(), &request(Role::Master), TIMEOUT).unwrap());
        let server = serve_enters(Arc::clone(&master), 1, 7);

        let mut wrong = request(Role::Slave);
        wrong.abi = 8;
        let err = SocketTransport::enter(rundir.path(), &wrong, TIMEOUT).err().unwrap();
        server.join().unwrap();
        assert!(matches!(
            err,
            TransportError::VersionMismatch {
                expected: 8,
                found: 7
            }
        ));
        let dir = SocketTransport::socket_dir(rundir.path(), 0);
        assert!(!SocketTransport::socket_path(&dir, ParticipantId::FIRST_SLAVE).exists());
    }

    #[test]
    fn broadcast_skips_sender() {
        let rundir = tempfile::tempdir().unwrap();
        let master =
            Arc::new(SocketTransport::enter(rundir.path(), &request(Role::Master), TIMEOUT).unwrap());
        let server = serve_enters(Arc::clone(&master), 2, 7);
        let first = SocketTransport::enter(rundir.path(), &request(Role::Slave), TIMEOUT).unwrap();
        let second = SocketTransport::enter(rundir.path(), &request(Role::Slave), TIMEOUT).unwrap();
        server.join().unwrap();

        let leave = Message::new(MessageKind::Leave, first.local_id());
        first.send(Target::Broadcast, &leave).unwrap();
        assert_eq!(master.recv_blocking().unwrap(), leave);
        assert_eq!(second.recv_blocking().unwrap(), leave);
    }

    #[test]
    fn detached_endpoint_keeps_its_socket_file() {
        let rundir = tempfile::tempdir().unwrap();
        let master =
            SocketTransport::enter(rundir.path(), &request(Role::Master), TIMEOUT).unwrap();
        let dir = SocketTransport::socket_dir(rundir.path(), 0);
        master.detach();
        drop(master);
        assert!(SocketTransport::socket_path(&dir, ParticipantId::MASTER).exists());
    }

    #[test]
    fn leave_unblocks_receiver_and_removes_socket() {
        let rundir = tempfile::tempdir().unwrap();
        let master =
            Arc::new(SocketTransport::enter(rundir.path(), &request(Role::Master), TIMEOUT).unwrap());
        let receiver = {
            let master = Arc::clone(&master);
            thread::spawn(move || loop {
                match master.recv_blocking() {
                    Ok(_) => continue,
                    Err(err) => return err,
                }
            })
        };
        thread::sleep(Duration::from_millis(20));
        master.leave(false).unwrap();
        assert!(matches!(
            receiver.join().unwrap(),
            TransportError::Destroyed
        ));
        let dir = SocketTransport::socket_dir(rundir.path(), 0);
        assert!(!SocketTransport::socket_path(&dir, ParticipantId::MASTER).exists());
        master.remove_backing().unwrap();
        assert!(!dir.exists());
    }
}
