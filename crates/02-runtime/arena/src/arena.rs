use std::fs::{self, OpenOptions, Permissions};
use std::io;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use fusion_transport::{ParticipantId, RegionInit, SharedRegion};

use crate::calls::CallTable;
use crate::heap::{SharedHeap, ShmBlock};
use crate::layout::{ArenaLayout, WorldHeader, ARENA_BYTES, HEAP_OFFSET};
use crate::participants::{now_us, Member, ParticipantTable};
use crate::reactors::ReactorTable;
use crate::refs::RefTable;
use crate::skirmish::SkirmishTable;
use crate::slot::{CallId, RefId};
use crate::{ArenaError, ArenaResult, ARENA_LAYOUT_VERSION, ARENA_MAGIC, HEAP_BYTES};

const FILE_MODE: u32 = 0o660;
const OPEN_POLL: Duration = Duration::from_millis(1);

/// A zero watch that has to be delivered to the owner of its call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Notification {
    pub owner: ParticipantId,
    pub call: CallId,
    pub arg: i32,
    pub reference: RefId,
}

/// What removing a participant left behind.
#[derive(Debug, Default)]
pub struct Eviction {
    /// Zero watches fired by unwinding the participant's refs.
    pub notifications: Vec<Notification>,
    /// Calls the participant owned, now gone.
    pub calls: Vec<CallId>,
    /// Participants still attached afterwards.
    pub remaining: u32,
}

/// One mapping of a world's shared tables.
pub struct Arena {
    region: SharedRegion,
}

impl Arena {
    /// Creates (or truncates) the backing file at `path` and initialises it.
    pub fn create(path: &Path, index: u32, abi: u32, group: Option<u32>) -> ArenaResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(FILE_MODE)
            .open(path)?;
        file.set_permissions(Permissions::from_mode(FILE_MODE))?;
        if let Some(gid) = group {
            std::os::unix::fs::fchown(&file, None, Some(gid))?;
        }
        file.set_len(ARENA_BYTES as u64)?;

        let arena = Self {
            region: SharedRegion::map_file(&file, ARENA_BYTES)?,
        };
        arena.initialise(index, abi);
        tracing::debug!("created arena for world {index} at {}", path.display());
        Ok(arena)
    }

    /// Maps an arena another participant created, waiting up to `timeout`
    /// for it to be initialised.
    pub fn open(path: &Path, index: u32, abi: u32, timeout: Duration) -> ArenaResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let deadline = Instant::now() + timeout;
        while file.metadata()?.len() < ARENA_BYTES as u64 {
            if Instant::now() >= deadline {
                return Err(ArenaError::NotReady);
            }
            thread::sleep(OPEN_POLL);
        }

        let arena = Self {
            region: SharedRegion::map_file(&file, ARENA_BYTES)?,
        };
        let header = arena.header();
        while !header.is_ready() {
            if Instant::now() >= deadline {
                return Err(ArenaError::NotReady);
            }
            thread::sleep(OPEN_POLL);
        }

        if header.magic() != ARENA_MAGIC {
            return Err(ArenaError::Corrupt("bad magic"));
        }
        if header.layout_version.load(Ordering::Acquire) != ARENA_LAYOUT_VERSION {
            return Err(ArenaError::Corrupt("layout version"));
        }
        if header.world_index() != index {
            return Err(ArenaError::Corrupt("world index"));
        }
        if header.abi() != abi {
            return Err(ArenaError::VersionMismatch {
                expected: abi,
                found: header.abi(),
            });
        }
        Ok(arena)
    }

    /// Private arena for single-process worlds.
    pub fn anonymous(index: u32, abi: u32) -> ArenaResult<Self> {
        let arena = Self {
            region: SharedRegion::anonymous(ARENA_BYTES, 4096, RegionInit::Zeroed)?,
        };
        arena.initialise(index, abi);
        Ok(arena)
    }

    /// Backing file of world `index` under `dir`.
    pub fn core_path(dir: &Path, index: u32) -> PathBuf {
        dir.join(format!("fusion.{index}.core"))
    }

    /// Removes a backing file; a missing file is not an error.
    pub fn unlink(path: &Path) -> ArenaResult<()> {
        match fs::remove_file(path) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }

    fn initialise(&self, index: u32, abi: u32) {
        let header = self.header();
        header.magic.store(ARENA_MAGIC, Ordering::Relaxed);
        header
            .layout_version
            .store(ARENA_LAYOUT_VERSION, Ordering::Relaxed);
        header.abi.store(abi, Ordering::Relaxed);
        header.world_index.store(index, Ordering::Relaxed);
        header.attached.store(0, Ordering::Relaxed);
        header.start_time_us.store(now_us(), Ordering::Relaxed);
        header.root.store(0, Ordering::Relaxed);
        header.heap_top.store(0, Ordering::Relaxed);
        header.ready.store(1, Ordering::Release);
    }

    pub(crate) fn layout(&self) -> &ArenaLayout {
        // SAFETY: the region is page aligned, at least `ARENA_BYTES` long and
        // `ArenaLayout` consists of atomics, for which any bit pattern
        // (including all zeroes) is valid.
        unsafe { &*(self.region.as_ptr() as *const ArenaLayout) }
    }

    pub fn header(&self) -> &WorldHeader {
        &self.layout().header
    }

    pub fn is_file_backed(&self) -> bool {
        self.region.is_file_backed()
    }

    pub fn participants(&self) -> ParticipantTable<'_> {
        let layout = self.layout();
        ParticipantTable {
            slots: &layout.participants,
            header: &layout.header,
        }
    }

    pub fn refs(&self) -> RefTable<'_> {
        RefTable {
            slots: &self.layout().refs,
            roster: self.participants(),
        }
    }

    pub fn calls(&self) -> CallTable<'_> {
        CallTable {
            slots: &self.layout().calls,
        }
    }

    pub fn reactors(&self) -> ReactorTable<'_> {
        let layout = self.layout();
        ReactorTable {
            reactors: &layout.reactors,
            subscriptions: &layout.subscriptions,
        }
    }

    pub fn skirmishes(&self) -> SkirmishTable<'_> {
        SkirmishTable {
            slots: &self.layout().skirmishes,
            roster: self.participants(),
        }
    }

    pub fn heap(&self) -> SharedHeap<'_> {
        SharedHeap {
            top: &self.header().heap_top,
            capacity: HEAP_BYTES,
        }
    }

    /// Address of `block` in this mapping.
    ///
    /// Access to the bytes must be coordinated between participants, for
    /// example through a skirmish.
    pub fn block_ptr(&self, block: ShmBlock) -> ArenaResult<NonNull<u8>> {
        block
            .offset
            .checked_add(block.len as u64)
            .filter(|end| *end <= HEAP_BYTES as u64)
            .ok_or(ArenaError::Invalid("block outside the heap"))?;
        // SAFETY: HEAP_OFFSET + offset + len stays within the mapping.
        let ptr = unsafe {
            self.region
                .as_ptr()
                .add(HEAP_OFFSET + block.offset as usize) as *mut u8
        };
        NonNull::new(ptr).ok_or(ArenaError::Invalid("null block"))
    }

    /// Publishes the world's root block.
    pub fn set_root(&self, block: ShmBlock) {
        self.header().set_root(block.offset);
    }

    pub fn root(&self) -> Option<u64> {
        Some(self.header().root()).filter(|root| *root != 0)
    }

    /// Removes `member` from the world on behalf of `by`.
    ///
    /// Only the first caller for a given member gets `Some`: it unwinds the
    /// member's refs, frees its subscriptions, reactors, calls and skirmish
    /// holds, then its slot.
    pub fn evict(&self, member: &Member, by: &Member) -> Option<Eviction> {
        let participants = self.participants();
        if !participants.mark_gone(member) {
            return None;
        }

        let calls = self.calls();
        let notifications = self
            .refs()
            .unwind(member, by)
            .into_iter()
            .filter_map(|watch| {
                let owner = calls.owner(watch.call).ok()?;
                (owner != member.id).then_some(Notification {
                    owner,
                    call: watch.call,
                    arg: watch.arg,
                    reference: watch.reference,
                })
            })
            .collect();
        let (subscriptions, reactors) = self.reactors().evict(member);
        let released = calls.release_owned(member).into_vec();
        let revoked = calls.revoke_grants(member.id);
        let skirmishes = self.skirmishes().release_owned(member);
        let remaining = participants.release(member);

        tracing::debug!(
            "evicted {}: {} call(s), {revoked} grant(s), {subscriptions} subscription(s), {reactors} reactor(s), {skirmishes} skirmish(es), {remaining} left",
            member.id,
            released.len()
        );
        Some(Eviction {
            notifications,
            calls: released,
            remaining,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Permissions, ShmPool};

    fn me() -> i32 {
        std::process::id() as i32
    }

    #[test]
    fn anonymous_arena_is_ready() {
        let arena = Arena::anonymous(3, 42).unwrap();
        let header = arena.header();
        assert!(header.is_ready());
        assert_eq!(header.world_index(), 3);
        assert_eq!(header.abi(), 42);
        assert_eq!(header.attached(), 0);
        assert!(header.start_time_us() > 0);
        assert_eq!(arena.root(), None);
        assert!(!arena.is_file_backed());
    }

    #[test]
    fn root_block_round_trips_through_the_heap() {
        let arena = Arena::anonymous(0, 1).unwrap();
        let block = arena.heap().alloc(8).unwrap();
        let ptr = arena.block_ptr(block).unwrap();
        // SAFETY: the block is eight bytes inside the heap and unshared.
        unsafe { ptr.as_ptr().cast::<u64>().write_unaligned(0xfeed) };
        arena.set_root(block);

        let root = arena.root().unwrap();
        let again = arena
            .block_ptr(ShmBlock {
                offset: root,
                len: 8,
            })
            .unwrap();
        // SAFETY: same block as above.
        assert_eq!(unsafe { again.as_ptr().cast::<u64>().read_unaligned() }, 0xfeed);
        assert!(arena
            .block_ptr(ShmBlock {
                offset: HEAP_BYTES as u64,
                len: 1
            })
            .is_err());
    }

    /// Eviction reverses refs, fires watches owned by others and frees the
    /// member's own calls.
    #[test]
    fn eviction_cleans_up_after_a_member() {
        let arena = Arena::anonymous(0, 1).unwrap();
        let table = arena.participants();
        let master = table.register(ParticipantId::MASTER, me()).unwrap();
        let slave = table.register(ParticipantId(2), me()).unwrap();

        let watched = arena.refs().create(&master).unwrap();
        let call = arena.calls().create(&master, Permissions::Anyone).unwrap();
        arena.refs().watch(watched, &master, call, 11).unwrap();
        arena.refs().up(watched, &slave).unwrap();

        let own_call = arena.calls().create(&slave, Permissions::Anyone).unwrap();
        let self_watched = arena.refs().create(&slave).unwrap();
        arena.refs().watch(self_watched, &slave, own_call, 0).unwrap();
        arena.refs().up(self_watched, &slave).unwrap();

        let eviction = arena.evict(&slave, &master).unwrap();
        assert_eq!(
            eviction.notifications,
            vec![Notification {
                owner: master.id,
                call,
                arg: 11,
                reference: watched,
            }]
        );
        assert_eq!(eviction.calls, vec![own_call]);
        assert_eq!(eviction.remaining, 1);
        assert_eq!(arena.refs().stat(watched).unwrap(), 0);
        assert!(arena.evict(&slave, &master).is_none());
    }

    /// A slave id handed out again does not inherit the grants of the
    /// participant that used it before.
    #[test]
    fn reused_id_starts_without_grants() {
        let arena = Arena::anonymous(0, 1).unwrap();
        let table = arena.participants();
        let master = table.register(ParticipantId::MASTER, me()).unwrap();
        let slave = table.register(ParticipantId(2), me()).unwrap();
        let call = arena.calls().create(&master, Permissions::Listed).unwrap();
        arena.calls().add_permission(call, &master, slave.id).unwrap();
        assert!(arena.calls().authorize(call, slave.id).is_ok());

        arena.evict(&slave, &master).unwrap();
        let successor = table.register(ParticipantId(2), me()).unwrap();
        assert!(matches!(
            arena.calls().authorize(call, successor.id),
            Err(ArenaError::AccessDenied(2))
        ));
    }

    #[test]
    fn core_path_names_the_world() {
        assert_eq!(
            Arena::core_path(Path::new("/dev/shm"), 2),
            PathBuf::from("/dev/shm/fusion.2.core")
        );
    }
}
