//! An in-process cluster standing in for the message-passing library.
//!
//! One `LocalMpl` handle per rank, threads as ranks. Collectives meet at
//! rendezvous slots keyed by (communicator, per-communicator sequence
//! number); the last arriving rank computes the outcome and wakes the rest.
//! Reductions fold contributions in rank order with wrapping integer
//! arithmetic, like a deterministic native implementation.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Condvar, Mutex},
    time::Duration,
};

use hear::{Datatype, Hear, Mpl, MplError, PendingReduce, ReduceOp, Settings, ThreadLevel};

const COLLECTIVE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommId(u64);

const WORLD: CommId = CommId(0);

#[derive(Debug, Clone)]
enum Payload {
    Reduce {
        data: Vec<u8>,
        dtype: Datatype,
        op: ReduceOp,
    },
    Gather {
        word: u32,
    },
    Bcast {
        word: Option<u32>,
    },
    Split {
        color: i32,
        key: i32,
    },
    Create {
        members: Vec<usize>,
    },
    Dup,
    Free,
}

#[derive(Debug, Clone)]
enum Outcome {
    Bytes(Vec<u8>),
    Words(Vec<u32>),
    Word(u32),
    /// New communicator per contributing rank, indexed by comm rank.
    Comms(Vec<Option<CommId>>),
    Unit,
}

#[derive(Debug, Default)]
struct Slot {
    contributions: BTreeMap<usize, Payload>,
    outcome: Option<Outcome>,
    taken: usize,
}

#[derive(Debug, Default)]
struct Inner {
    /// Membership (world ranks, in comm-rank order) of each live communicator.
    comms: HashMap<CommId, Vec<usize>>,
    slots: HashMap<(CommId, u64), Slot>,
    seqs: HashMap<(CommId, usize), u64>,
    next_comm: u64,
}

#[derive(Debug, Default)]
struct Cluster {
    inner: Mutex<Inner>,
    arrived: Condvar,
}

/// One rank's handle onto the cluster.
#[derive(Debug, Clone)]
pub struct LocalMpl {
    rank: usize,
    cluster: Arc<Cluster>,
}

/// Build an `n`-rank cluster; handle `i` belongs to world rank `i`.
pub fn cluster(n: usize) -> Vec<LocalMpl> {
    let cluster = Arc::new(Cluster::default());
    {
        let mut inner = cluster.inner.lock().unwrap();
        inner.comms.insert(WORLD, (0..n).collect());
        inner.next_comm = 1;
    }
    (0..n)
        .map(|rank| LocalMpl {
            rank,
            cluster: Arc::clone(&cluster),
        })
        .collect()
}

impl LocalMpl {
    fn collective(&self, comm: CommId, payload: Payload) -> (usize, Outcome) {
        let mut inner = self.cluster.inner.lock().unwrap();
        let members = inner
            .comms
            .get(&comm)
            .unwrap_or_else(|| panic!("collective on unknown communicator {comm:?}"))
            .clone();
        let my_comm_rank = members
            .iter()
            .position(|&world| world == self.rank)
            .expect("collective on a communicator this rank is not part of");

        let counter = inner.seqs.entry((comm, self.rank)).or_insert(0);
        let seq = *counter;
        *counter += 1;
        let key = (comm, seq);

        let slot = inner.slots.entry(key).or_default();
        slot.contributions.insert(my_comm_rank, payload);

        if slot.contributions.len() == members.len() {
            let contributions = std::mem::take(&mut slot.contributions);
            let outcome = compute(&mut inner, comm, &members, contributions);
            inner
                .slots
                .get_mut(&key)
                .expect("slot vanished mid-collective")
                .outcome = Some(outcome);
            self.cluster.arrived.notify_all();
        }

        loop {
            if inner
                .slots
                .get(&key)
                .and_then(|slot| slot.outcome.as_ref())
                .is_some()
            {
                break;
            }
            let (guard, timeout) = self
                .cluster
                .arrived
                .wait_timeout(inner, COLLECTIVE_TIMEOUT)
                .unwrap();
            inner = guard;
            assert!(!timeout.timed_out(), "collective timed out: {comm:?} seq {seq}");
        }

        let slot = inner.slots.get_mut(&key).unwrap();
        let outcome = slot.outcome.clone().unwrap();
        slot.taken += 1;
        if slot.taken == members.len() {
            inner.slots.remove(&key);
        }
        (my_comm_rank, outcome)
    }
}

fn compute(
    inner: &mut Inner,
    comm: CommId,
    members: &[usize],
    contributions: BTreeMap<usize, Payload>,
) -> Outcome {
    let first = contributions.values().next().expect("empty collective");
    match first.clone() {
        Payload::Reduce { dtype, op, .. } => {
            let bufs: Vec<Vec<u8>> = contributions
                .into_values()
                .map(|payload| match payload {
                    Payload::Reduce {
                        data,
                        dtype: d,
                        op: o,
                    } => {
                        assert_eq!((d, o), (dtype, op), "mismatched reduction request");
                        data
                    }
                    other => panic!("mismatched collective: {other:?}"),
                })
                .collect();
            Outcome::Bytes(reduce(&bufs, dtype, op))
        }
        Payload::Gather { .. } => {
            let words = contributions
                .into_values()
                .map(|payload| match payload {
                    Payload::Gather { word } => word,
                    other => panic!("mismatched collective: {other:?}"),
                })
                .collect();
            Outcome::Words(words)
        }
        Payload::Bcast { .. } => {
            let word = contributions
                .into_values()
                .find_map(|payload| match payload {
                    Payload::Bcast { word } => word,
                    other => panic!("mismatched collective: {other:?}"),
                })
                .expect("broadcast without a root contribution");
            Outcome::Word(word)
        }
        Payload::Split { .. } => {
            let mut groups: BTreeMap<i32, Vec<(i32, usize)>> = BTreeMap::new();
            for (comm_rank, payload) in contributions {
                match payload {
                    Payload::Split { color, key } => {
                        if color >= 0 {
                            groups.entry(color).or_default().push((key, comm_rank));
                        }
                    }
                    other => panic!("mismatched collective: {other:?}"),
                }
            }
            let mut assignment = vec![None; members.len()];
            for mut group in groups.into_values() {
                group.sort_unstable();
                let new_members = group.iter().map(|&(_, cr)| members[cr]).collect();
                let id = alloc_comm(inner, new_members);
                for &(_, comm_rank) in &group {
                    assignment[comm_rank] = Some(id);
                }
            }
            Outcome::Comms(assignment)
        }
        Payload::Create { members: listed } => {
            for payload in contributions.values() {
                match payload {
                    Payload::Create { members: other } => {
                        assert_eq!(other, &listed, "ranks disagree on the new group")
                    }
                    other => panic!("mismatched collective: {other:?}"),
                }
            }
            let new_members = listed.iter().map(|&cr| members[cr]).collect();
            let id = alloc_comm(inner, new_members);
            let mut assignment = vec![None; members.len()];
            for &comm_rank in &listed {
                assignment[comm_rank] = Some(id);
            }
            Outcome::Comms(assignment)
        }
        Payload::Dup => {
            let id = alloc_comm(inner, members.to_vec());
            Outcome::Comms(vec![Some(id); members.len()])
        }
        Payload::Free => {
            inner.comms.remove(&comm);
            Outcome::Unit
        }
    }
}

fn alloc_comm(inner: &mut Inner, members: Vec<usize>) -> CommId {
    let id = CommId(inner.next_comm);
    inner.next_comm += 1;
    inner.comms.insert(id, members);
    id
}

/// Elementwise fold of the contributions in rank order. Integer overflow
/// wraps, like two's-complement hardware reduction.
fn reduce(bufs: &[Vec<u8>], dtype: Datatype, op: ReduceOp) -> Vec<u8> {
    fn lanes<T, const N: usize>(
        bufs: &[Vec<u8>],
        read: impl Fn([u8; N]) -> T,
        write: impl Fn(T) -> [u8; N],
        combine: impl Fn(T, T) -> T,
    ) -> Vec<u8> {
        let mut out = bufs[0].clone();
        for buf in &bufs[1..] {
            for (acc, next) in out.chunks_exact_mut(N).zip(buf.chunks_exact(N)) {
                let value = combine(
                    read((&*acc).try_into().unwrap()),
                    read(next.try_into().unwrap()),
                );
                acc.copy_from_slice(&write(value));
            }
        }
        out
    }

    match (dtype, op) {
        (Datatype::Int32, ReduceOp::Sum) => {
            lanes::<i32, 4>(bufs, i32::from_ne_bytes, i32::to_ne_bytes, |a, b| {
                a.wrapping_add(b)
            })
        }
        (Datatype::Int32, ReduceOp::Prod) => {
            lanes::<i32, 4>(bufs, i32::from_ne_bytes, i32::to_ne_bytes, |a, b| {
                a.wrapping_mul(b)
            })
        }
        (Datatype::Int32, ReduceOp::Max) => {
            lanes::<i32, 4>(bufs, i32::from_ne_bytes, i32::to_ne_bytes, |a, b| a.max(b))
        }
        (Datatype::Int64, ReduceOp::Sum) => {
            lanes::<i64, 8>(bufs, i64::from_ne_bytes, i64::to_ne_bytes, |a, b| {
                a.wrapping_add(b)
            })
        }
        (Datatype::Int64, ReduceOp::Prod) => {
            lanes::<i64, 8>(bufs, i64::from_ne_bytes, i64::to_ne_bytes, |a, b| {
                a.wrapping_mul(b)
            })
        }
        (Datatype::Int64, ReduceOp::Max) => {
            lanes::<i64, 8>(bufs, i64::from_ne_bytes, i64::to_ne_bytes, |a, b| a.max(b))
        }
        (Datatype::Float32, ReduceOp::Sum) => {
            lanes::<f32, 4>(bufs, f32::from_ne_bytes, f32::to_ne_bytes, |a, b| a + b)
        }
        (Datatype::Float32, ReduceOp::Prod) => {
            lanes::<f32, 4>(bufs, f32::from_ne_bytes, f32::to_ne_bytes, |a, b| a * b)
        }
        (Datatype::Float32, ReduceOp::Max) => {
            lanes::<f32, 4>(bufs, f32::from_ne_bytes, f32::to_ne_bytes, |a, b| a.max(b))
        }
        (Datatype::Float64, ReduceOp::Sum) => {
            lanes::<f64, 8>(bufs, f64::from_ne_bytes, f64::to_ne_bytes, |a, b| a + b)
        }
        (Datatype::Float64, ReduceOp::Prod) => {
            lanes::<f64, 8>(bufs, f64::from_ne_bytes, f64::to_ne_bytes, |a, b| a * b)
        }
        (Datatype::Float64, ReduceOp::Max) => {
            lanes::<f64, 8>(bufs, f64::from_ne_bytes, f64::to_ne_bytes, |a, b| a.max(b))
        }
    }
}

/// A posted reduction. The exchange happens at `wait`, which is where the
/// layer observes completion anyway.
pub struct LocalPending<'a> {
    mpl: &'a LocalMpl,
    sendbuf: &'a [u8],
    recvbuf: &'a mut [u8],
    dtype: Datatype,
    op: ReduceOp,
    comm: CommId,
}

impl PendingReduce for LocalPending<'_> {
    fn wait(self) -> Result<(), MplError> {
        let (_, outcome) = self.mpl.collective(
            self.comm,
            Payload::Reduce {
                data: self.sendbuf.to_vec(),
                dtype: self.dtype,
                op: self.op,
            },
        );
        match outcome {
            Outcome::Bytes(bytes) => {
                self.recvbuf.copy_from_slice(&bytes);
                Ok(())
            }
            other => panic!("mismatched outcome: {other:?}"),
        }
    }
}

impl Mpl for LocalMpl {
    type Comm = CommId;
    type Pending<'a> = LocalPending<'a> where Self: 'a;

    fn init(&self) -> Result<(), MplError> {
        Ok(())
    }

    fn init_thread(&self, required: ThreadLevel) -> Result<ThreadLevel, MplError> {
        Ok(required)
    }

    fn finalize(&self) -> Result<(), MplError> {
        Ok(())
    }

    fn comm_world(&self) -> CommId {
        WORLD
    }

    fn comm_size(&self, comm: CommId) -> Result<usize, MplError> {
        self.cluster
            .inner
            .lock()
            .unwrap()
            .comms
            .get(&comm)
            .map(Vec::len)
            .ok_or(MplError {
                call: "comm_size",
                code: 5,
            })
    }

    fn comm_rank(&self, comm: CommId) -> Result<usize, MplError> {
        self.cluster
            .inner
            .lock()
            .unwrap()
            .comms
            .get(&comm)
            .and_then(|members| members.iter().position(|&world| world == self.rank))
            .ok_or(MplError {
                call: "comm_rank",
                code: 5,
            })
    }

    fn allreduce(
        &self,
        sendbuf: &[u8],
        recvbuf: &mut [u8],
        count: usize,
        dtype: Datatype,
        op: ReduceOp,
        comm: CommId,
    ) -> Result<(), MplError> {
        self.iallreduce(sendbuf, recvbuf, count, dtype, op, comm)?
            .wait()
    }

    fn iallreduce<'a>(
        &'a self,
        sendbuf: &'a [u8],
        recvbuf: &'a mut [u8],
        count: usize,
        dtype: Datatype,
        op: ReduceOp,
        comm: CommId,
    ) -> Result<LocalPending<'a>, MplError> {
        assert_eq!(sendbuf.len(), count * dtype.size());
        assert_eq!(recvbuf.len(), count * dtype.size());
        Ok(LocalPending {
            mpl: self,
            sendbuf,
            recvbuf,
            dtype,
            op,
            comm,
        })
    }

    fn allgather_word(&self, word: u32, recv: &mut [u32], comm: CommId) -> Result<(), MplError> {
        let (_, outcome) = self.collective(comm, Payload::Gather { word });
        match outcome {
            Outcome::Words(words) => {
                recv.copy_from_slice(&words);
                Ok(())
            }
            other => panic!("mismatched outcome: {other:?}"),
        }
    }

    fn broadcast_word(&self, word: &mut u32, root: usize, comm: CommId) -> Result<(), MplError> {
        let my_comm_rank = self.comm_rank(comm)?;
        let (_, outcome) = self.collective(
            comm,
            Payload::Bcast {
                word: (my_comm_rank == root).then_some(*word),
            },
        );
        match outcome {
            Outcome::Word(value) => {
                *word = value;
                Ok(())
            }
            other => panic!("mismatched outcome: {other:?}"),
        }
    }

    fn comm_create(&self, comm: CommId, members: &[usize]) -> Result<Option<CommId>, MplError> {
        let (my_comm_rank, outcome) = self.collective(
            comm,
            Payload::Create {
                members: members.to_vec(),
            },
        );
        match outcome {
            Outcome::Comms(assignment) => Ok(assignment[my_comm_rank]),
            other => panic!("mismatched outcome: {other:?}"),
        }
    }

    fn comm_split(&self, comm: CommId, color: i32, key: i32) -> Result<Option<CommId>, MplError> {
        let (my_comm_rank, outcome) = self.collective(comm, Payload::Split { color, key });
        match outcome {
            Outcome::Comms(assignment) => Ok(assignment[my_comm_rank]),
            other => panic!("mismatched outcome: {other:?}"),
        }
    }

    fn comm_dup(&self, comm: CommId) -> Result<CommId, MplError> {
        let (my_comm_rank, outcome) = self.collective(comm, Payload::Dup);
        match outcome {
            Outcome::Comms(assignment) => Ok(assignment[my_comm_rank].expect("dup excluded a rank")),
            other => panic!("mismatched outcome: {other:?}"),
        }
    }

    fn comm_free(&self, comm: CommId) -> Result<(), MplError> {
        let (_, outcome) = self.collective(comm, Payload::Free);
        match outcome {
            Outcome::Unit => Ok(()),
            other => panic!("mismatched outcome: {other:?}"),
        }
    }
}

/// Wrapper injecting a deterministic transport failure. Every rank must be
/// built with the same plan so the cluster fails in lock-step instead of
/// deadlocking at a half-entered rendezvous.
pub struct FlakyMpl {
    inner: LocalMpl,
    fail_call: &'static str,
    countdown: std::cell::Cell<usize>,
}

/// An `n`-rank cluster whose `fail_call` entry point fails after `after`
/// successful calls (per rank).
pub fn flaky_cluster(n: usize, fail_call: &'static str, after: usize) -> Vec<FlakyMpl> {
    cluster(n)
        .into_iter()
        .map(|inner| FlakyMpl {
            inner,
            fail_call,
            countdown: std::cell::Cell::new(after),
        })
        .collect()
}

impl FlakyMpl {
    fn trip(&self, call: &'static str) -> Result<(), MplError> {
        if call == self.fail_call {
            let remaining = self.countdown.get();
            if remaining == 0 {
                return Err(MplError { call, code: 42 });
            }
            self.countdown.set(remaining - 1);
        }
        Ok(())
    }
}

impl Mpl for FlakyMpl {
    type Comm = CommId;
    type Pending<'a> = LocalPending<'a> where Self: 'a;

    fn init(&self) -> Result<(), MplError> {
        self.inner.init()
    }

    fn init_thread(&self, required: ThreadLevel) -> Result<ThreadLevel, MplError> {
        self.inner.init_thread(required)
    }

    fn finalize(&self) -> Result<(), MplError> {
        self.inner.finalize()
    }

    fn comm_world(&self) -> CommId {
        self.inner.comm_world()
    }

    fn comm_size(&self, comm: CommId) -> Result<usize, MplError> {
        self.inner.comm_size(comm)
    }

    fn comm_rank(&self, comm: CommId) -> Result<usize, MplError> {
        self.inner.comm_rank(comm)
    }

    fn allreduce(
        &self,
        sendbuf: &[u8],
        recvbuf: &mut [u8],
        count: usize,
        dtype: Datatype,
        op: ReduceOp,
        comm: CommId,
    ) -> Result<(), MplError> {
        self.trip("allreduce")?;
        self.inner.allreduce(sendbuf, recvbuf, count, dtype, op, comm)
    }

    fn iallreduce<'a>(
        &'a self,
        sendbuf: &'a [u8],
        recvbuf: &'a mut [u8],
        count: usize,
        dtype: Datatype,
        op: ReduceOp,
        comm: CommId,
    ) -> Result<LocalPending<'a>, MplError> {
        self.trip("iallreduce")?;
        self.inner.iallreduce(sendbuf, recvbuf, count, dtype, op, comm)
    }

    fn allgather_word(&self, word: u32, recv: &mut [u32], comm: CommId) -> Result<(), MplError> {
        self.trip("allgather_word")?;
        self.inner.allgather_word(word, recv, comm)
    }

    fn broadcast_word(&self, word: &mut u32, root: usize, comm: CommId) -> Result<(), MplError> {
        self.trip("broadcast_word")?;
        self.inner.broadcast_word(word, root, comm)
    }

    fn comm_create(&self, comm: CommId, members: &[usize]) -> Result<Option<CommId>, MplError> {
        self.inner.comm_create(comm, members)
    }

    fn comm_split(&self, comm: CommId, color: i32, key: i32) -> Result<Option<CommId>, MplError> {
        self.inner.comm_split(comm, color, key)
    }

    fn comm_dup(&self, comm: CommId) -> Result<CommId, MplError> {
        self.inner.comm_dup(comm)
    }

    fn comm_free(&self, comm: CommId) -> Result<(), MplError> {
        self.inner.comm_free(comm)
    }
}

/// Run one closure per rank, each on its own thread with its own layer
/// instance, and collect the results in rank order.
pub fn run_cluster<M, R, F>(mpls: Vec<M>, settings: Settings, f: F) -> Vec<R>
where
    M: Mpl + Send,
    R: Send,
    F: Fn(usize, &mut Hear<M>) -> R + Sync,
{
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    std::thread::scope(|scope| {
        let f = &f;
        let joins: Vec<_> = mpls
            .into_iter()
            .enumerate()
            .map(|(rank, mpl)| {
                scope.spawn(move || {
                    let mut hear = Hear::init(mpl, settings).expect("layer init failed");
                    let out = f(rank, &mut hear);
                    hear.finalize().expect("finalize failed");
                    out
                })
            })
            .collect();
        joins
            .into_iter()
            .map(|join| join.join().expect("rank thread panicked"))
            .collect()
    })
}
