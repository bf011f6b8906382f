use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Execution resource used for tile-local work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ExecutionHw {
    /// Blocks of one operation are processed one after another.
    #[default]
    Cpu,
    /// Blocks of one operation are processed in parallel on the rayon pool.
    Accelerated,
}

/// How the ranks of a group are hosted and talk to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Backend {
    /// One thread per rank; all ranks share one tile storage.
    Threads,
    /// One thread per rank, each with a private copy of the tile storage as
    /// separate processes would have.
    ThreadsPrivateMemory,
    /// One process per rank of the MPI world communicator.
    #[cfg(feature = "use_mpi")]
    Mpi,
}

impl Default for Backend {
    #[cfg(feature = "use_mpi")]
    fn default() -> Self {
        Backend::Mpi
    }

    #[cfg(not(feature = "use_mpi"))]
    fn default() -> Self {
        Backend::Threads
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| Error::Protocol("a rank panicked while holding a group lock".into()))
}

/* #region memory manager */

/// Per-rank accounting of distributed tensor storage.
#[derive(Debug)]
pub struct MemoryManager {
    limit: Option<usize>,
    used: Mutex<Vec<usize>>,
}

impl MemoryManager {
    fn new(nranks: usize, limit: Option<usize>) -> Self {
        Self { limit, used: Mutex::new(vec![0; nranks]) }
    }

    /// Reserve `per_rank[r]` bytes on every rank `r`, all or nothing.
    pub fn reserve(&self, tensor: &str, per_rank: &[usize]) -> Result<()> {
        let mut used = lock(&self.used)?;
        if let Some(limit) = self.limit {
            for (rank, (&in_use, &requested)) in used.iter().zip(per_rank).enumerate() {
                let available = limit.saturating_sub(in_use);
                if requested > available {
                    return Err(Error::Resource { tensor: tensor.to_string(), rank, requested, available });
                }
            }
        }
        used.iter_mut().zip(per_rank).for_each(|(in_use, &requested)| *in_use += requested);
        Ok(())
    }

    pub fn release(&self, per_rank: &[usize]) -> Result<()> {
        let mut used = lock(&self.used)?;
        used.iter_mut().zip(per_rank).for_each(|(in_use, &released)| *in_use = in_use.saturating_sub(released));
        Ok(())
    }

    pub fn in_use(&self, rank: usize) -> Result<usize> {
        Ok(lock(&self.used)?[rank])
    }

    pub fn total_in_use(&self) -> Result<usize> {
        Ok(lock(&self.used)?.iter().sum())
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }
}

/* #endregion */

/* #region transport */

/// Message passing between the ranks of a group.
///
/// Tags are checked on every collective: ranks that arrive with different
/// tags fail with [`Error::Protocol`].
pub(crate) trait Transport {
    fn nranks(&self) -> usize;

    /// Whether every rank reads and writes the same tile storage.
    fn shares_memory(&self) -> bool;

    fn sync(&self, rank: usize, tag: &str) -> Result<()>;

    /// Bytes of `root`, handed to every rank.
    fn broadcast(&self, rank: usize, root: usize, tag: &str, bytes: Vec<u8>) -> Result<Vec<u8>>;

    /// Bytes of every rank, in rank order.
    fn all_gather(&self, rank: usize, tag: &str, bytes: Vec<u8>) -> Result<Vec<Vec<u8>>>;

    /// `rank` failed outside of a collective; the other ranks must not wait for it.
    fn abort(&self, rank: usize, err: &Error);

    /// `rank` finished its work.
    fn depart(&self, rank: usize);
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|err| Error::Protocol(format!("cannot encode message: {err}")))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|err| Error::Protocol(format!("cannot decode message: {err}")))
}

#[derive(Debug)]
struct BarrierState {
    arrived: usize,
    generation: u64,
    tags: Vec<Option<String>>,
    departed: usize,
    failure: Option<Error>,
}

/// Ranks as threads of this process, meeting at a condition variable.
struct ThreadTransport {
    nranks: usize,
    shares_memory: bool,
    state: Mutex<BarrierState>,
    cvar: Condvar,
    slots: Mutex<Vec<Option<Vec<u8>>>>,
}

impl ThreadTransport {
    fn new(nranks: usize, shares_memory: bool) -> Self {
        let state = BarrierState { arrived: 0, generation: 0, tags: vec![None; nranks], departed: 0, failure: None };
        Self { nranks, shares_memory, state: Mutex::new(state), cvar: Condvar::new(), slots: Mutex::new(vec![None; nranks]) }
    }

    fn slot(&self, rank: usize, tag: &str) -> Result<Vec<u8>> {
        lock(&self.slots)?[rank].clone().ok_or_else(|| Error::Protocol(format!("rank {rank} sent nothing for {tag}")))
    }
}

impl Transport for ThreadTransport {
    fn nranks(&self) -> usize {
        self.nranks
    }

    fn shares_memory(&self) -> bool {
        self.shares_memory
    }

    fn sync(&self, rank: usize, tag: &str) -> Result<()> {
        let mut state = lock(&self.state)?;
        if let Some(failure) = &state.failure {
            return Err(failure.clone());
        }
        state.tags[rank] = Some(tag.to_string());
        state.arrived += 1;

        if state.arrived + state.departed == self.nranks {
            let failure = if state.departed > 0 {
                Some(Error::Protocol(format!(
                    "{} rank(s) left the group while others wait at collective {tag:?}",
                    state.departed
                )))
            } else if state.tags.iter().any(|t| t != &state.tags[rank]) {
                let seen = state
                    .tags
                    .iter()
                    .enumerate()
                    .filter_map(|(r, t)| t.as_ref().map(|t| format!("rank {r} at {t:?}")))
                    .collect::<Vec<_>>();
                Some(Error::Protocol(format!("collective call order diverged: {}", seen.join(", "))))
            } else {
                None
            };
            state.arrived = 0;
            state.tags.iter_mut().for_each(|t| *t = None);
            state.generation += 1;
            if let Some(failure) = &failure {
                state.failure = Some(failure.clone());
            }
            self.cvar.notify_all();
            return failure.map_or(Ok(()), Err);
        }

        let generation = state.generation;
        while state.generation == generation && state.failure.is_none() {
            state = self.cvar.wait(state).map_err(|_| Error::Protocol("group barrier poisoned".into()))?;
        }
        match &state.failure {
            Some(failure) => Err(failure.clone()),
            None => Ok(()),
        }
    }

    fn broadcast(&self, rank: usize, root: usize, tag: &str, bytes: Vec<u8>) -> Result<Vec<u8>> {
        if rank == root {
            lock(&self.slots)?[root] = Some(bytes);
        }
        self.sync(rank, &format!("{tag} (publish)"))?;
        let value = self.slot(root, tag);
        self.sync(rank, &format!("{tag} (consume)"))?;
        if rank == root {
            lock(&self.slots)?[root] = None;
        }
        value
    }

    fn all_gather(&self, rank: usize, tag: &str, bytes: Vec<u8>) -> Result<Vec<Vec<u8>>> {
        lock(&self.slots)?[rank] = Some(bytes);
        self.sync(rank, &format!("{tag} (gather)"))?;
        let gathered = (0..self.nranks).map(|r| self.slot(r, tag)).collect::<Result<Vec<_>>>();
        self.sync(rank, &format!("{tag} (release)"))?;
        lock(&self.slots)?[rank] = None;
        gathered
    }

    fn abort(&self, rank: usize, err: &Error) {
        if let Ok(mut state) = self.state.lock() {
            if state.failure.is_none() {
                state.failure = Some(Error::Aborted { rank, reason: err.to_string() });
            }
            self.cvar.notify_all();
        }
    }

    fn depart(&self, _rank: usize) {
        if let Ok(mut state) = self.state.lock() {
            state.departed += 1;
            if state.arrived > 0 && state.arrived + state.departed == self.nranks && state.failure.is_none() {
                state.failure =
                    Some(Error::Protocol(format!("{} rank(s) finished while others wait at a collective", state.departed)));
            }
            self.cvar.notify_all();
        }
    }
}

/* #endregion */

/* #region address space */

/// State shared by the ranks living in one address space.
struct AddressSpace {
    /// Rank that runs work done once per address space.
    leader: usize,
    memory: MemoryManager,
    mailbox: Mutex<Option<Box<dyn Any + Send>>>,
}

impl AddressSpace {
    fn new(leader: usize, nranks: usize, memory_per_rank: Option<usize>) -> Self {
        Self { leader, memory: MemoryManager::new(nranks, memory_per_rank), mailbox: Mutex::new(None) }
    }
}

/* #endregion */

/* #region process group */

/// Fixed-size group of cooperating ranks.
#[derive(Debug, Clone)]
pub struct ProcessGroup {
    nranks: usize,
    designated_writer: usize,
    memory_per_rank: Option<usize>,
    exhw: ExecutionHw,
    backend: Backend,
}

impl ProcessGroup {
    pub fn new(nranks: usize) -> Self {
        Self {
            nranks,
            designated_writer: 0,
            memory_per_rank: None,
            exhw: ExecutionHw::Cpu,
            backend: Backend::Threads,
        }
    }

    /// Rank that performs single-writer file operations.
    pub fn designated_writer(mut self, rank: usize) -> Self {
        self.designated_writer = rank;
        self
    }

    /// Bytes of distributed tensor storage each rank may hold; `None` is unlimited.
    pub fn memory_per_rank(mut self, bytes: Option<usize>) -> Self {
        self.memory_per_rank = bytes;
        self
    }

    pub fn execution_hw(mut self, exhw: ExecutionHw) -> Self {
        self.exhw = exhw;
        self
    }

    pub fn backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn nranks(&self) -> usize {
        self.nranks
    }

    fn check(&self, nranks: usize) -> Result<()> {
        if nranks == 0 {
            return Err(Error::Configuration("process group needs at least one rank".into()));
        }
        if self.designated_writer >= nranks {
            return Err(Error::Configuration(format!(
                "designated writer rank {} outside of a group of {nranks} ranks",
                self.designated_writer
            )));
        }
        Ok(())
    }

    /// Run `f` on every rank and collect the values of the ranks hosted by
    /// this process, in rank order.
    ///
    /// If any rank fails, the group is aborted and the root-cause error is
    /// returned.
    pub fn launch<R, F>(&self, f: F) -> Result<Vec<R>>
    where
        R: Send,
        F: Fn(&ExecutionContext) -> Result<R> + Sync,
    {
        match self.backend {
            Backend::Threads => self.launch_threads(true, f),
            Backend::ThreadsPrivateMemory => self.launch_threads(false, f),
            #[cfg(feature = "use_mpi")]
            Backend::Mpi => self.launch_mpi(f),
        }
    }

    fn launch_threads<R, F>(&self, shares_memory: bool, f: F) -> Result<Vec<R>>
    where
        R: Send,
        F: Fn(&ExecutionContext) -> Result<R> + Sync,
    {
        self.check(self.nranks)?;
        let transport = Arc::new(ThreadTransport::new(self.nranks, shares_memory));
        let shared_space = Arc::new(AddressSpace::new(self.designated_writer, self.nranks, self.memory_per_rank));
        let f = &f;
        let results: Vec<Result<R>> = std::thread::scope(|scope| {
            let handles = (0..self.nranks)
                .map(|rank| {
                    let rank_transport = transport.clone();
                    let space = match shares_memory {
                        true => shared_space.clone(),
                        false => Arc::new(AddressSpace::new(rank, self.nranks, self.memory_per_rank)),
                    };
                    let spawned = std::thread::Builder::new().name(format!("rank-{rank}")).spawn_scoped(scope, move || {
                        let ec = ExecutionContext::new(self, rank, rank_transport.clone(), space);
                        let result = catch_unwind(AssertUnwindSafe(|| f(&ec)))
                            .unwrap_or_else(|_| Err(Error::Protocol(format!("rank {rank} panicked"))));
                        match &result {
                            Ok(_) => rank_transport.depart(rank),
                            Err(err) => rank_transport.abort(rank, err),
                        }
                        result
                    });
                    spawned.map_err(|err| {
                        let err = Error::io(format!("rank-{rank}"), err);
                        transport.abort(rank, &err);
                        err
                    })
                })
                .collect::<Vec<_>>();

            handles
                .into_iter()
                .enumerate()
                .map(|(rank, handle)| {
                    handle?.join().unwrap_or_else(|_| Err(Error::Protocol(format!("rank {rank} could not be joined"))))
                })
                .collect()
        });

        if results.iter().all(|r| r.is_ok()) {
            return results.into_iter().collect();
        }
        let mut errors = results.into_iter().filter_map(|r| r.err()).collect::<Vec<_>>();
        let root = errors.iter().position(|err| !matches!(err.root(), Error::Aborted { .. })).unwrap_or(0);
        Err(errors.swap_remove(root))
    }

    /// The group size is the size of the world communicator; MPI must be
    /// initialized by the caller.
    #[cfg(feature = "use_mpi")]
    fn launch_mpi<R, F>(&self, f: F) -> Result<Vec<R>>
    where
        F: Fn(&ExecutionContext) -> Result<R>,
    {
        let transport = crate::mpiutils::MpiTransport::world()?;
        let (rank, nranks) = (transport.rank(), transport.nranks());
        self.check(nranks)?;
        if nranks != self.nranks && rank == self.designated_writer {
            tracing::warn!("running on {nranks} MPI ranks, {} were requested", self.nranks);
        }
        let transport: Arc<dyn Transport> = Arc::new(transport);
        let space = Arc::new(AddressSpace::new(rank, nranks, self.memory_per_rank));
        let ec = ExecutionContext::new(self, rank, transport.clone(), space);
        let result = catch_unwind(AssertUnwindSafe(|| f(&ec)))
            .unwrap_or_else(|_| Err(Error::Protocol(format!("rank {rank} panicked"))));
        match &result {
            // errors that surfaced from a collective reached every rank already
            Err(err) if !ec.failed_collectively() => transport.abort(rank, err),
            _ => transport.depart(rank),
        }
        result.map(|value| vec![value])
    }
}

/* #endregion */

/* #region execution context */

/// Handle of one rank in a running process group.
pub struct ExecutionContext {
    rank: usize,
    designated_writer: usize,
    exhw: ExecutionHw,
    seq: AtomicUsize,
    failed: AtomicBool,
    transport: Arc<dyn Transport>,
    space: Arc<AddressSpace>,
}

impl ExecutionContext {
    fn new(group: &ProcessGroup, rank: usize, transport: Arc<dyn Transport>, space: Arc<AddressSpace>) -> Self {
        Self {
            rank,
            designated_writer: group.designated_writer,
            exhw: group.exhw,
            seq: AtomicUsize::new(0),
            failed: AtomicBool::new(false),
            transport,
            space,
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn nranks(&self) -> usize {
        self.transport.nranks()
    }

    pub fn designated_writer(&self) -> usize {
        self.designated_writer
    }

    pub fn is_designated_writer(&self) -> bool {
        self.rank == self.designated_writer
    }

    pub fn exhw(&self) -> ExecutionHw {
        self.exhw
    }

    /// Whether all ranks read and write the same tile storage.
    pub fn shares_memory(&self) -> bool {
        self.transport.shares_memory()
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.space.memory
    }

    /// Rank owning the block with the given linear index.
    pub fn owner(&self, linear_block: usize) -> usize {
        linear_block % self.nranks()
    }

    fn next_tag(&self, tag: &str) -> String {
        format!("#{} {tag}", self.seq.fetch_add(1, Ordering::Relaxed))
    }

    fn collectively<T>(&self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.failed.store(true, Ordering::Relaxed);
        }
        result
    }

    fn failed_collectively(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }

    /// Plain barrier.
    pub fn barrier(&self) -> Result<()> {
        self.collective("barrier")
    }

    /// Barrier that also verifies every rank is at the same collective.
    pub fn collective(&self, tag: &str) -> Result<()> {
        self.collectively(self.transport.sync(self.rank, &self.next_tag(tag)))
    }

    /// Run `f` on the designated writer only; every rank receives its result.
    pub fn designated<T, F>(&self, tag: &str, f: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T>,
    {
        let tag = self.next_tag(tag);
        let bytes = match self.is_designated_writer() {
            true => encode(&f()).or_else(|err| encode(&Err::<T, Error>(err)))?,
            false => vec![],
        };
        let bytes = self.collectively(self.transport.broadcast(self.rank, self.designated_writer, &tag, bytes))?;
        self.collectively(decode::<Result<T>>(&bytes)?)
    }

    /// Values of every rank, in rank order.
    pub fn all_gather<T>(&self, tag: &str, value: &T) -> Result<Vec<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        let tag = self.next_tag(tag);
        let gathered = self.collectively(self.transport.all_gather(self.rank, &tag, encode(value)?))?;
        gathered.iter().map(|bytes| decode(bytes)).collect()
    }

    /// Combine local outcomes so that every rank returns the same error.
    ///
    /// The error of the lowest failing rank wins.
    pub fn agree<T>(&self, tag: &str, local: Result<T>) -> Result<T> {
        let outcomes = self.all_gather(tag, &local.as_ref().err().cloned())?;
        match outcomes.into_iter().flatten().next() {
            Some(err) => self.collectively(Err(err)),
            None => local,
        }
    }

    /// Run `f` once per address space; the ranks sharing it receive the same value.
    pub(crate) fn node_local<T, F>(&self, tag: &str, f: F) -> Result<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> Result<T>,
    {
        if !self.shares_memory() {
            return f();
        }
        let is_leader = self.rank == self.space.leader;
        if is_leader {
            let value: Result<T> = f();
            *lock(&self.space.mailbox)? = Some(Box::new(value));
        }
        self.collective(&format!("{tag} (publish)"))?;
        let value = lock(&self.space.mailbox)?
            .as_ref()
            .and_then(|boxed| boxed.downcast_ref::<Result<T>>())
            .cloned()
            .ok_or_else(|| Error::Protocol(format!("no value published for {tag}")))?;
        self.collective(&format!("{tag} (consume)"))?;
        if is_leader {
            lock(&self.space.mailbox)?.take();
        }
        value
    }

    /// Final synchronization before the group is torn down.
    pub fn flush_and_sync(&self) -> Result<()> {
        self.collective("flush_and_sync")?;
        if self.is_designated_writer() {
            let leaked = self.memory().total_in_use()?;
            if leaked > 0 {
                tracing::warn!("{leaked} bytes of distributed tensors still allocated at teardown");
            }
        }
        Ok(())
    }
}

/* #endregion */
