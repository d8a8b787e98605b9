//! Kernel-device backend.
//!
//! Membership and routing belong to a device: the fusion character device
//! when it is present, or [`MemoryDeviceHub`], an in-process stand-in with the
//! same open/enter/fork contract. Frames travel through the device unchanged;
//! the reading side reassembles them with a [`FrameReader`].

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use super::retry_eintr;
use crate::ids::{BackendKind, EnterRequest, ParticipantId, Role, Target};
use crate::wire::{align_up, FrameReader, Message, MessageKind, MAX_FRAME_LEN};
use crate::{Transport, TransportError, TransportResult};

/// How a world's device is opened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    /// Only succeeds when nobody owns the world yet.
    Exclusive,
    /// Joins a world that already has a master.
    Shared,
}

/// An opened world device.
pub trait FusionDevice: Send + Sync {
    /// Registers the caller and returns its id.
    fn enter(&self, request: &EnterRequest) -> TransportResult<ParticipantId>;

    /// Queues one encoded frame for `target`.
    fn send(&self, target: Target, frame: &[u8]) -> TransportResult<()>;

    /// Blocks for the next chunk of frame bytes, appending it to `out`.
    ///
    /// `Ok(0)` means the device was closed.
    fn read(&self, out: &mut Vec<u8>) -> TransportResult<usize>;

    /// Completes a fork on a freshly entered device; returns the child's id.
    fn fork(&self, parent: ParticipantId) -> TransportResult<ParticipantId>;

    /// Waits until every queued frame of the world was consumed.
    fn sync(&self, timeout: Duration) -> TransportResult<()>;

    /// Drops the membership of this device's participant.
    fn close(&self);

    /// Lets go of the device in a forked child, leaving the membership to
    /// the parent.
    fn detach(&self) {}

    /// True when the device emits LEAVE frames for departed members.
    fn notifies_departure(&self) -> bool;
}

/// Opens world devices by index.
pub trait DeviceOpener: Send + Sync {
    fn open(&self, index: u32, mode: OpenMode) -> TransportResult<Box<dyn FusionDevice>>;
}

/// Transport backed by a [`FusionDevice`].
pub struct DeviceTransport {
    opener: Arc<dyn DeviceOpener>,
    device: Box<dyn FusionDevice>,
    index: u32,
    id: ParticipantId,
    reader: Mutex<FrameReader>,
    left: AtomicBool,
}

impl DeviceTransport {
    /// Opens and enters world `request.world_index`.
    pub fn enter(opener: Arc<dyn DeviceOpener>, request: &EnterRequest) -> TransportResult<Self> {
        let modes: &[OpenMode] = match request.role {
            Role::Master => &[OpenMode::Exclusive],
            Role::Slave => &[OpenMode::Shared],
            Role::Any => &[OpenMode::Exclusive, OpenMode::Shared],
        };

        let mut last = TransportError::init("no open mode attempted");
        for &mode in modes {
            let device = match opener.open(request.world_index, mode) {
                Ok(device) => device,
                Err(TransportError::MasterExists(index)) if request.role == Role::Any => {
                    tracing::debug!("world {index} has a master, joining as slave");
                    last = TransportError::MasterExists(index);
                    continue;
                }
                Err(err) => return Err(err),
            };

            let role = match mode {
                OpenMode::Exclusive => Role::Master,
                OpenMode::Shared => Role::Slave,
            };
            let id = device.enter(&request.with_role(role))?;
            return Ok(Self::from_device(opener, device, request.world_index, id));
        }
        Err(last)
    }

    fn from_device(
        opener: Arc<dyn DeviceOpener>,
        device: Box<dyn FusionDevice>,
        index: u32,
        id: ParticipantId,
    ) -> Self {
        Self {
            opener,
            device,
            index,
            id,
            reader: Mutex::new(FrameReader::new()),
            left: AtomicBool::new(false),
        }
    }
}

impl Transport for DeviceTransport {
    fn kind(&self) -> BackendKind {
        BackendKind::Device
    }

    fn local_id(&self) -> ParticipantId {
        self.id
    }

    fn send(&self, target: Target, message: &Message) -> TransportResult<()> {
        if self.left.load(Ordering::Acquire) {
            return Err(TransportError::Destroyed);
        }
        self.device.send(target, &message.encode()?)
    }

    fn recv_blocking(&self) -> TransportResult<Message> {
        let mut reader = self.reader.lock();
        let mut chunk = Vec::with_capacity(MAX_FRAME_LEN);
        loop {
            if let Some(next) = reader.next_message() {
                return Ok(next?);
            }
            chunk.clear();
            if self.device.read(&mut chunk)? == 0 {
                return Err(TransportError::Destroyed);
            }
            reader.push(&chunk);
        }
    }

    fn leave(&self, emergency: bool) -> TransportResult<()> {
        if !self.left.swap(true, Ordering::AcqRel) {
            tracing::debug!(
                "participant {} closing device of world {} (emergency: {emergency})",
                self.id,
                self.index
            );
            self.device.close();
        }
        Ok(())
    }

    fn detach(&self) {
        self.left.store(true, Ordering::Release);
        self.device.detach();
    }

    fn fork(&self, request: &EnterRequest) -> TransportResult<Option<Box<dyn Transport>>> {
        let device = self.opener.open(self.index, OpenMode::Shared)?;
        device.enter(&request.with_role(Role::Slave))?;
        let id = device.fork(self.id)?;
        Ok(Some(Box::new(Self::from_device(
            Arc::clone(&self.opener),
            device,
            self.index,
            id,
        ))))
    }

    fn sync(&self, timeout: Duration) -> TransportResult<()> {
        self.device.sync(timeout)
    }

    fn notifies_departure(&self) -> bool {
        self.device.notifies_departure()
    }
}

// ---------------------------------------------------------------------------
// Character device
// ---------------------------------------------------------------------------

const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;
const IOC_TYPE: u32 = b'F' as u32;

const fn ioc(dir: u32, nr: u32, size: usize) -> u32 {
    (dir << 30) | ((size as u32) << 16) | (IOC_TYPE << 8) | nr
}

#[repr(C)]
struct EnterArgs {
    api_major: i32,
    api_minor: i32,
    fusion_id: u32,
}

#[repr(C)]
struct ForkArgs {
    fusion_id: u32,
}

#[repr(C)]
struct SendArgs {
    fusion_id: u32,
    msg_id: i32,
    msg_channel: i32,
    msg_size: i32,
    msg_data: *const libc::c_void,
}

const FUSION_ENTER: u32 = ioc(IOC_READ | IOC_WRITE, 0x00, std::mem::size_of::<EnterArgs>());
const FUSION_FORK: u32 = ioc(IOC_READ | IOC_WRITE, 0x02, std::mem::size_of::<ForkArgs>());
const FUSION_SEND_MESSAGE: u32 = ioc(IOC_WRITE, 0x10, std::mem::size_of::<SendArgs>());
const FUSION_SYNC: u32 = ioc(0, 0x04, 0);

/// Type of kernel messages that carry our frames.
const FMT_SEND: i32 = 0;
/// `{type, id, channel, size}` in front of every kernel message.
const KERNEL_HEADER_LEN: usize = 16;

/// Opens `/dev/fusionN` (or `/dev/fusion/N`).
#[derive(Clone, Debug, Default)]
pub struct CharDeviceOpener {
    override_path: Option<PathBuf>,
}

impl CharDeviceOpener {
    /// Uses an explicit device node instead of the standard locations.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            override_path: Some(path.into()),
        }
    }

    fn candidates(&self, index: u32) -> Vec<PathBuf> {
        match &self.override_path {
            Some(path) => vec![path.clone()],
            None => vec![
                PathBuf::from(format!("/dev/fusion{index}")),
                PathBuf::from(format!("/dev/fusion/{index}")),
            ],
        }
    }
}

impl DeviceOpener for CharDeviceOpener {
    fn open(&self, index: u32, mode: OpenMode) -> TransportResult<Box<dyn FusionDevice>> {
        let flags = match mode {
            OpenMode::Exclusive => libc::O_EXCL,
            OpenMode::Shared => libc::O_APPEND,
        };

        let mut last_err = None;
        for path in self.candidates(index) {
            match OpenOptions::new()
                .read(true)
                .write(true)
                .custom_flags(flags)
                .open(&path)
            {
                Ok(file) => {
                    tracing::debug!("opened {} ({mode:?})", path.display());
                    return Ok(Box::new(CharDevice {
                        file,
                        closed: AtomicBool::new(false),
                    }));
                }
                Err(err) if err.raw_os_error() == Some(libc::EBUSY) => {
                    return Err(TransportError::MasterExists(index));
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => last_err = Some(err),
                Err(err) => return Err(err.into()),
            }
        }

        Err(TransportError::init(match last_err {
            Some(err) => format!("no fusion device for world {index}: {err}"),
            None => format!("no fusion device for world {index}"),
        }))
    }
}

struct CharDevice {
    file: File,
    closed: AtomicBool,
}

impl CharDevice {
    fn ioctl<T>(&self, request: u32, arg: *mut T) -> io::Result<()> {
        device_ioctl(&self.file, request, arg)
    }
}

fn device_ioctl<T>(file: &File, request: u32, arg: *mut T) -> io::Result<()> {
    retry_eintr(|| {
        // SAFETY: `arg` is null or points to a live argument block sized
        // for `request`.
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), request as _, arg) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    })
}

/// Runs a blocking device request on a helper thread and gives up on it
/// after `timeout`. A request that outlives its caller finishes unobserved.
fn run_bounded(
    timeout: Duration,
    what: &'static str,
    request: impl FnOnce() -> io::Result<()> + Send + 'static,
) -> TransportResult<()> {
    let (tx, rx) = crossbeam_channel::bounded(1);
    std::thread::Builder::new()
        .name(format!("fusion-{what}"))
        .spawn(move || {
            if tx.send(request()).is_err() {
                tracing::trace!("device {what} finished after its caller gave up");
            }
        })?;
    match rx.recv_timeout(timeout) {
        Ok(result) => Ok(result?),
        Err(RecvTimeoutError::Timeout) => {
            tracing::warn!("device {what} did not finish within {timeout:?}");
            Err(TransportError::Timeout(what))
        }
        Err(RecvTimeoutError::Disconnected) => Err(TransportError::Io(io::Error::other(
            format!("device {what} request died"),
        ))),
    }
}

impl FusionDevice for CharDevice {
    fn enter(&self, request: &EnterRequest) -> TransportResult<ParticipantId> {
        let mut args = EnterArgs {
            api_major: (request.abi >> 16) as i32,
            api_minor: (request.abi & 0xffff) as i32,
            fusion_id: 0,
        };
        self.ioctl(FUSION_ENTER, &mut args).map_err(|err| {
            if err.raw_os_error() == Some(libc::EPROTO) {
                TransportError::VersionMismatch {
                    expected: request.abi,
                    found: 0,
                }
            } else {
                TransportError::Io(err)
            }
        })?;
        if args.fusion_id == 0 {
            return Err(TransportError::init("device assigned no participant id"));
        }
        Ok(ParticipantId(args.fusion_id))
    }

    fn send(&self, target: Target, frame: &[u8]) -> TransportResult<()> {
        let Target::Participant(id) = target else {
            return Err(TransportError::Unsupported("broadcast on the fusion device"));
        };
        let mut args = SendArgs {
            fusion_id: id.raw(),
            msg_id: 0,
            msg_channel: 0,
            msg_size: frame.len() as i32,
            msg_data: frame.as_ptr().cast(),
        };
        self.ioctl(FUSION_SEND_MESSAGE, &mut args)
            .map_err(|err| match err.raw_os_error() {
                Some(libc::EIDRM) | Some(libc::EINVAL) => TransportError::Destroyed,
                _ => TransportError::Io(err),
            })
    }

    fn read(&self, out: &mut Vec<u8>) -> TransportResult<usize> {
        let mut raw = vec![0u8; MAX_FRAME_LEN + KERNEL_HEADER_LEN];
        let before = out.len();
        while out.len() == before {
            if self.closed.load(Ordering::Acquire) {
                return Ok(0);
            }
            let len = retry_eintr(|| (&self.file).read(&mut raw))?;
            if len == 0 {
                return Ok(0);
            }
            unpack_kernel_messages(&raw[..len], out);
        }
        Ok(out.len() - before)
    }

    fn fork(&self, parent: ParticipantId) -> TransportResult<ParticipantId> {
        let mut args = ForkArgs {
            fusion_id: parent.raw(),
        };
        self.ioctl(FUSION_FORK, &mut args)?;
        Ok(ParticipantId(args.fusion_id))
    }

    fn sync(&self, timeout: Duration) -> TransportResult<()> {
        let file = self.file.try_clone()?;
        run_bounded(timeout, "sync", move || {
            device_ioctl(&file, FUSION_SYNC, std::ptr::null_mut::<u8>())
        })
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn notifies_departure(&self) -> bool {
        false
    }
}

/// Appends the frames carried by `FMT_SEND` messages in `raw` to `out`.
fn unpack_kernel_messages(raw: &[u8], out: &mut Vec<u8>) {
    let field = |at: usize| i32::from_ne_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);
    let mut offset = 0;
    while offset + KERNEL_HEADER_LEN <= raw.len() {
        let kind = field(offset);
        let size = field(offset + 12).max(0) as usize;
        let body = offset + KERNEL_HEADER_LEN;
        if body + size > raw.len() {
            tracing::warn!("truncated kernel message ({size} bytes)");
            return;
        }
        if kind == FMT_SEND {
            out.extend_from_slice(&raw[body..body + size]);
        } else {
            tracing::trace!("ignoring kernel message type {kind}");
        }
        offset = body + align_up(size, 4);
    }
}

// ---------------------------------------------------------------------------
// In-memory device
// ---------------------------------------------------------------------------

struct HubWorld {
    master_open: bool,
    abi: Option<u32>,
    next_id: u32,
    members: HashMap<u32, Sender<Vec<u8>>>,
}

impl Default for HubWorld {
    fn default() -> Self {
        Self {
            master_open: false,
            abi: None,
            next_id: ParticipantId::FIRST_SLAVE.raw(),
            members: HashMap::new(),
        }
    }
}

/// In-process device shared by every handle cloned from it.
///
/// It routes frames between participants living in one process and tells
/// survivors about departures, which is what the kernel module does for
/// separate processes.
#[derive(Clone, Default)]
pub struct MemoryDeviceHub {
    worlds: Arc<Mutex<HashMap<u32, HubWorld>>>,
}

impl MemoryDeviceHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids currently attached to world `index`.
    pub fn members(&self, index: u32) -> Vec<ParticipantId> {
        let worlds = self.worlds.lock();
        let mut ids: Vec<_> = worlds
            .get(&index)
            .map(|world| world.members.keys().map(|id| ParticipantId(*id)).collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }
}

impl DeviceOpener for MemoryDeviceHub {
    fn open(&self, index: u32, mode: OpenMode) -> TransportResult<Box<dyn FusionDevice>> {
        let mut worlds = self.worlds.lock();
        let world = worlds.entry(index).or_default();
        match mode {
            OpenMode::Exclusive if world.master_open => {
                return Err(TransportError::MasterExists(index));
            }
            OpenMode::Exclusive => world.master_open = true,
            OpenMode::Shared if !world.master_open => {
                return Err(TransportError::init(format!("world {index} has no master")));
            }
            OpenMode::Shared => {}
        }
        Ok(Box::new(MemoryDevice {
            hub: self.clone(),
            index,
            master: mode == OpenMode::Exclusive,
            id: AtomicU32::new(0),
            rx: OnceLock::new(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemoryDevice {
    hub: MemoryDeviceHub,
    index: u32,
    master: bool,
    id: AtomicU32,
    rx: OnceLock<Receiver<Vec<u8>>>,
    closed: AtomicBool,
}

impl FusionDevice for MemoryDevice {
    fn enter(&self, request: &EnterRequest) -> TransportResult<ParticipantId> {
        let mut worlds = self.hub.worlds.lock();
        let world = worlds.entry(self.index).or_default();
        let id = if self.master {
            world.abi = Some(request.abi);
            ParticipantId::MASTER
        } else {
            if let Some(abi) = world.abi.filter(|abi| *abi != request.abi) {
                return Err(TransportError::VersionMismatch {
                    expected: request.abi,
                    found: abi,
                });
            }
            let id = ParticipantId(world.next_id);
            world.next_id += 1;
            id
        };

        let (tx, rx) = crossbeam_channel::unbounded();
        self.rx
            .set(rx)
            .map_err(|_| TransportError::init("device entered twice"))?;
        world.members.insert(id.raw(), tx);
        self.id.store(id.raw(), Ordering::Release);
        Ok(id)
    }

    fn send(&self, target: Target, frame: &[u8]) -> TransportResult<()> {
        let me = self.id.load(Ordering::Acquire);
        let worlds = self.hub.worlds.lock();
        let world = worlds.get(&self.index).ok_or(TransportError::Destroyed)?;
        match target {
            Target::Participant(id) => world
                .members
                .get(&id.raw())
                .ok_or(TransportError::Destroyed)?
                .send(frame.to_vec())
                .map_err(|_| TransportError::Destroyed),
            Target::Broadcast => {
                for (id, tx) in &world.members {
                    if *id == me {
                        continue;
                    }
                    if tx.send(frame.to_vec()).is_err() {
                        tracing::trace!("broadcast skipped departed member {id:#x}");
                    }
                }
                Ok(())
            }
        }
    }

    fn read(&self, out: &mut Vec<u8>) -> TransportResult<usize> {
        let rx = self
            .rx
            .get()
            .ok_or(TransportError::Unsupported("read before enter"))?;
        match rx.recv() {
            Ok(frame) => {
                out.extend_from_slice(&frame);
                Ok(frame.len())
            }
            Err(_) => Ok(0),
        }
    }

    fn fork(&self, _parent: ParticipantId) -> TransportResult<ParticipantId> {
        Ok(ParticipantId(self.id.load(Ordering::Acquire)))
    }

    fn sync(&self, timeout: Duration) -> TransportResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let drained = {
                let worlds = self.hub.worlds.lock();
                worlds
                    .get(&self.index)
                    .map(|world| world.members.values().all(|tx| tx.is_empty()))
                    .unwrap_or(true)
            };
            if drained {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(TransportError::Timeout("sync"));
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let id = ParticipantId(self.id.load(Ordering::Acquire));
        let mut worlds = self.hub.worlds.lock();
        let Some(world) = worlds.get_mut(&self.index) else {
            return;
        };
        if self.master {
            world.master_open = false;
        }
        if world.members.remove(&id.raw()).is_some() {
            match Message::new(MessageKind::Leave, id).encode() {
                Ok(frame) => {
                    for (member, tx) in &world.members {
                        if tx.send(frame.clone()).is_err() {
                            tracing::trace!("departure of {id} not delivered to {member:#x}");
                        }
                    }
                }
                Err(err) => tracing::error!("failed to encode departure of {id}: {err}"),
            }
        }
        if world.members.is_empty() && !world.master_open {
            worlds.remove(&self.index);
        }
    }

    fn detach(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn notifies_departure(&self) -> bool {
        true
    }
}

impl Drop for MemoryDevice {
    fn drop(&mut self) {
        self.close();
    }
}
