//! A small library for ~~hating on~~ evaluating the correctness of the
//! `buddy_slab` allocators.
//!
//! An [`Evaluator`] drives a [`Subject`] through a sequence of arbitrary
//! operations. Every allocation is painted with the id of the operation that
//! produced it, and the paint is verified before the allocation is freed.

use std::fmt::Debug;

use arbitrary::{Arbitrary, Unstructured};
use buddy_slab::{
    AddressError, AllocError, AllocInitError, ArenaConfig, BlockAddr, BuddyArena, ObjectAddr,
    SlabCache, SlabError,
};

#[derive(Arbitrary)]
enum AllocatorOpTag {
    Alloc,
    Dealloc,
}

#[derive(Clone, Debug)]
pub enum AllocatorOp<R> {
    Alloc(R),
    Dealloc(usize),
}

impl<'a, R: Arbitrary<'a>> Arbitrary<'a> for AllocatorOp<R> {
    fn arbitrary(u: &mut Unstructured<'a>) -> arbitrary::Result<Self> {
        let tag = AllocatorOpTag::arbitrary(u)?;

        let op = match tag {
            AllocatorOpTag::Alloc => AllocatorOp::Alloc(R::arbitrary(u)?),
            AllocatorOpTag::Dealloc => AllocatorOp::Dealloc(usize::arbitrary(u)?),
        };

        Ok(op)
    }
}

pub trait Subject {
    /// The argument of an allocation.
    type Request: for<'a> Arbitrary<'a> + Clone + Debug;
    /// The address of an allocation.
    type Handle: Copy + Debug;
    type AllocError;
    type DeallocError: Debug;

    fn allocate(&mut self, request: &Self::Request) -> Result<Self::Handle, Self::AllocError>;

    /// Returns the memory of a live allocation.
    fn bytes_mut(&mut self, handle: Self::Handle) -> &mut [u8];

    fn deallocate(&mut self, handle: Self::Handle) -> Result<(), Self::DeallocError>;

    /// Returns `true` if the subject holds no allocations.
    fn is_idle(&self) -> bool;
}

/// A list of allocated blocks.
pub struct Blocks<H> {
    blocks: Vec<Block<H>>,
}

impl<H> Default for Blocks<H> {
    fn default() -> Self {
        Blocks { blocks: Vec::new() }
    }
}

impl<H> Blocks<H> {
    pub fn new() -> Blocks<H> {
        Blocks::default()
    }

    pub fn push(&mut self, block: Block<H>) {
        self.blocks.push(block);
    }

    pub fn remove_modulo(&mut self, idx: usize) -> Option<Block<H>> {
        let len = self.blocks.len();
        (len != 0).then(|| self.blocks.swap_remove(idx % len))
    }
}

impl<H> IntoIterator for Blocks<H> {
    type Item = Block<H>;

    type IntoIter = std::vec::IntoIter<Block<H>>;

    fn into_iter(self) -> Self::IntoIter {
        self.blocks.into_iter()
    }
}

/// An allocation made by a subject.
#[derive(Copy, Clone, Debug)]
pub struct Block<H> {
    handle: H,
    // The unique ID of the last operation that wrote to this allocation.
    id: u64,
}

fn paint(bytes: &mut [u8], id: u64) {
    let id_bytes = id.to_le_bytes().into_iter().cycle();

    for (byte, value) in bytes.iter_mut().zip(id_bytes) {
        *byte = value;
    }
}

impl<H: Copy> Block<H> {
    /// Creates a block from `handle` and paints it according to `id`.
    pub fn init<S: Subject<Handle = H>>(subject: &mut S, handle: H, id: u64) -> Block<H> {
        let mut b = Block { handle, id };
        b.paint(subject, id);
        b
    }

    pub fn handle(&self) -> H {
        self.handle
    }

    /// "Paints" the memory of `self` with the value of `id`.
    pub fn paint<S: Subject<Handle = H>>(&mut self, subject: &mut S, id: u64) {
        paint(subject.bytes_mut(self.handle), id);
        self.id = id;
    }

    /// Verifies that the memory of `self` has not been overwritten.
    pub fn verify<S: Subject<Handle = H>>(&self, subject: &mut S) -> bool {
        let id_bytes = self.id.to_le_bytes().into_iter().cycle();

        subject
            .bytes_mut(self.handle)
            .iter()
            .zip(id_bytes)
            .all(|(byte, value)| *byte == value)
    }
}

/// Why an evaluation failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailureKind {
    /// An allocation's paint was overwritten while it was live.
    Corrupted,
    /// The subject refused to free a live allocation.
    DeallocRejected,
    /// The subject still held allocations after everything was freed.
    Leaked,
}

#[derive(Clone, Debug)]
pub struct Failed<R> {
    pub kind: FailureKind,
    pub completed: Vec<AllocatorOp<R>>,
    /// The operation that failed, or `None` if the failure was found during
    /// teardown.
    pub failed_op: Option<AllocatorOp<R>>,
}

pub struct Evaluator<S: Subject> {
    subject: S,
}

impl<S: Subject> Evaluator<S> {
    pub fn new(subject: S) -> Evaluator<S> {
        Evaluator { subject }
    }

    pub fn into_subject(self) -> S {
        self.subject
    }

    pub fn evaluate<I>(&mut self, ops: I) -> Result<(), Failed<S::Request>>
    where
        I: IntoIterator<Item = AllocatorOp<S::Request>>,
    {
        let mut completed = Vec::new();
        let mut blocks = Blocks::new();

        for (op_id, op) in ops.into_iter().enumerate() {
            let op_id = op_id as u64;
            let failure = match &op {
                AllocatorOp::Alloc(request) => {
                    if let Ok(handle) = self.subject.allocate(request) {
                        blocks.push(Block::init(&mut self.subject, handle, op_id));
                    }

                    None
                }

                AllocatorOp::Dealloc(raw_idx) => match blocks.remove_modulo(*raw_idx) {
                    Some(mut block) if block.verify(&mut self.subject) => {
                        block.paint(&mut self.subject, op_id);
                        self.subject
                            .deallocate(block.handle())
                            .err()
                            .map(|_| FailureKind::DeallocRejected)
                    }
                    Some(_) => Some(FailureKind::Corrupted),
                    None => None,
                },
            };

            if let Some(kind) = failure {
                return Err(Failed {
                    kind,
                    completed,
                    failed_op: Some(op),
                });
            }

            completed.push(op);
        }

        for block in blocks {
            let kind = if !block.verify(&mut self.subject) {
                Some(FailureKind::Corrupted)
            } else if self.subject.deallocate(block.handle()).is_err() {
                Some(FailureKind::DeallocRejected)
            } else {
                None
            };

            if let Some(kind) = kind {
                return Err(Failed {
                    kind,
                    completed,
                    failed_op: None,
                });
            }
        }

        if !self.subject.is_idle() {
            return Err(Failed {
                kind: FailureKind::Leaked,
                completed,
                failed_op: None,
            });
        }

        Ok(())
    }
}

/// A block order which implements `Arbitrary`.
///
/// Orders are drawn slightly past the largest supported arena so that
/// oversized requests are exercised too.
#[derive(Copy, Clone, Debug)]
pub struct ArbOrder(pub usize);

impl Arbitrary<'_> for ArbOrder {
    fn arbitrary(u: &mut Unstructured<'_>) -> arbitrary::Result<Self> {
        Ok(ArbOrder(usize::from(u8::arbitrary(u)? % 16)))
    }
}

pub struct BuddySubject(BuddyArena);

impl BuddySubject {
    pub fn new(config: ArenaConfig) -> Result<Self, AllocInitError> {
        let arena = BuddyArena::try_new(config)?;
        Ok(BuddySubject(arena))
    }
}

impl Subject for BuddySubject {
    type Request = ArbOrder;
    type Handle = BlockAddr;
    type AllocError = AllocError;
    type DeallocError = AddressError;

    fn allocate(&mut self, request: &ArbOrder) -> Result<BlockAddr, AllocError> {
        self.0.allocate(request.0)
    }

    fn bytes_mut(&mut self, handle: BlockAddr) -> &mut [u8] {
        self.0
            .block_mut(handle)
            .expect("handle does not refer to an allocated block")
    }

    fn deallocate(&mut self, handle: BlockAddr) -> Result<(), AddressError> {
        self.0.release(handle)
    }

    fn is_idle(&self) -> bool {
        self.0.is_idle()
    }
}

pub struct SlabSubject {
    arena: BuddyArena,
    cache: SlabCache,
}

impl SlabSubject {
    pub fn new(config: ArenaConfig, obj_size: usize) -> Result<Self, AllocInitError> {
        let arena = BuddyArena::try_new(config)?;
        let cache = SlabCache::new(&arena, "hater", obj_size)?;

        Ok(SlabSubject { arena, cache })
    }

    /// Destroys the cache and returns `true` if the arena is idle afterwards.
    pub fn teardown(self) -> bool {
        let SlabSubject { mut arena, cache } = self;
        cache.destroy(&mut arena).is_ok() && arena.is_idle()
    }
}

impl Subject for SlabSubject {
    type Request = ();
    type Handle = ObjectAddr;
    type AllocError = SlabError;
    type DeallocError = SlabError;

    fn allocate(&mut self, _: &()) -> Result<ObjectAddr, SlabError> {
        self.cache.allocate(&mut self.arena)
    }

    fn bytes_mut(&mut self, handle: ObjectAddr) -> &mut [u8] {
        self.cache
            .object_mut(&mut self.arena, handle)
            .expect("handle does not refer to a live object")
    }

    fn deallocate(&mut self, handle: ObjectAddr) -> Result<(), SlabError> {
        self.cache.free(&mut self.arena, handle)
    }

    fn is_idle(&self) -> bool {
        let stats = self.cache.stats();
        stats.full == 0 && stats.partial == 0
    }
}
