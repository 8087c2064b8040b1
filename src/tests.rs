use core::{fmt::Debug, marker::PhantomData};

use quickcheck::{Arbitrary, Gen, QuickCheck};

use crate::{
    AllocInitError, ArenaConfig, BlockAddr, BuddyArena, Global, ObjectAddr, SlabCache,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

trait QcAllocator: Sized {
    type Params: Arbitrary + Debug;
    type Request: Arbitrary + Debug;
    type Handle: Copy + Debug;

    fn with_params(params: Self::Params) -> Result<Self, AllocInitError>;

    fn allocate(&mut self, request: &Self::Request) -> Option<Self::Handle>;

    fn bytes_mut(&mut self, handle: Self::Handle) -> &mut [u8];

    fn deallocate(&mut self, handle: Self::Handle);

    /// Checks the allocator's internal invariants, panicking on violation.
    fn assert_consistent(&self);

    /// Returns all memory to the backing arena and reports whether the arena
    /// is back to a single free root block.
    fn teardown(self) -> bool;
}

// Buddy ======================================================================

#[derive(Clone, Debug)]
struct BuddyParams {
    page_size: usize,
    max_order: usize,
}

impl Arbitrary for BuddyParams {
    fn arbitrary(g: &mut Gen) -> Self {
        BuddyParams {
            page_size: 1 << (4 + usize::arbitrary(g) % 5),
            max_order: usize::arbitrary(g) % 7,
        }
    }

    fn shrink(&self) -> Box<dyn Iterator<Item = Self>> {
        let page_size = self.page_size;
        Box::new(
            (0..self.max_order)
                .rev()
                .map(move |max_order| BuddyParams {
                    page_size,
                    max_order,
                }),
        )
    }
}

#[derive(Clone, Debug)]
struct OrderRequest {
    order: usize,
}

impl Arbitrary for OrderRequest {
    fn arbitrary(g: &mut Gen) -> Self {
        // Occasionally ask for more than the arena can hold.
        OrderRequest {
            order: usize::arbitrary(g) % 8,
        }
    }
}

impl QcAllocator for BuddyArena<Global> {
    type Params = BuddyParams;
    type Request = OrderRequest;
    type Handle = BlockAddr;

    fn with_params(params: Self::Params) -> Result<Self, AllocInitError> {
        BuddyArena::try_new(ArenaConfig::new(params.page_size, params.max_order))
    }

    fn allocate(&mut self, request: &Self::Request) -> Option<BlockAddr> {
        let res = BuddyArena::allocate(self, request.order);

        if request.order > self.max_order() {
            assert!(res.is_err(), "allocated a block beyond the max order");
        }

        res.ok()
    }

    fn bytes_mut(&mut self, handle: BlockAddr) -> &mut [u8] {
        self.block_mut(handle).unwrap()
    }

    fn deallocate(&mut self, handle: BlockAddr) {
        self.release(handle).unwrap();
    }

    fn assert_consistent(&self) {
        BuddyArena::assert_consistent(self);
    }

    fn teardown(self) -> bool {
        self.is_idle() && self.free_blocks(self.max_order()) == 1
    }
}

// Slab =======================================================================

#[derive(Clone, Debug)]
struct SlabParams {
    obj_size: usize,
    max_order: usize,
}

impl Arbitrary for SlabParams {
    fn arbitrary(g: &mut Gen) -> Self {
        SlabParams {
            obj_size: 1 + usize::arbitrary(g) % 256,
            max_order: usize::arbitrary(g) % 4,
        }
    }
}

#[derive(Debug)]
struct SlabHarness {
    arena: BuddyArena,
    cache: SlabCache,
}

impl QcAllocator for SlabHarness {
    type Params = SlabParams;
    type Request = ();
    type Handle = ObjectAddr;

    fn with_params(params: Self::Params) -> Result<Self, AllocInitError> {
        let arena = BuddyArena::try_new(ArenaConfig::new(256, params.max_order))?;
        let cache = SlabCache::new(&arena, "qc", params.obj_size)?;

        Ok(SlabHarness { arena, cache })
    }

    fn allocate(&mut self, _: &()) -> Option<ObjectAddr> {
        self.cache.allocate(&mut self.arena).ok()
    }

    fn bytes_mut(&mut self, handle: ObjectAddr) -> &mut [u8] {
        self.cache.object_mut(&mut self.arena, handle).unwrap()
    }

    fn deallocate(&mut self, handle: ObjectAddr) {
        self.cache.free(&mut self.arena, handle).unwrap();
    }

    fn assert_consistent(&self) {
        self.cache.assert_consistent();
        self.arena.assert_consistent();
    }

    fn teardown(self) -> bool {
        let SlabHarness { mut arena, cache } = self;
        let stats = cache.stats();
        if stats.full != 0 || stats.partial != 0 {
            return false;
        }

        cache.destroy(&mut arena).unwrap();
        arena.is_idle()
    }
}

// Properties =================================================================

enum AllocatorOpTag {
    Allocate,
    Free,
}

#[derive(Clone, Debug)]
enum AllocatorOp<R: Arbitrary> {
    /// Allocate with the given request.
    Allocate { request: R },
    /// Free an existing allocation.
    ///
    /// Given `n` outstanding allocations, the allocation to free is at index
    /// `index % n`.
    Free { index: usize },
}

impl<R: Arbitrary> Arbitrary for AllocatorOp<R> {
    fn arbitrary(g: &mut Gen) -> Self {
        match g
            .choose(&[AllocatorOpTag::Allocate, AllocatorOpTag::Free])
            .unwrap()
        {
            AllocatorOpTag::Allocate => AllocatorOp::Allocate {
                request: R::arbitrary(g),
            },
            AllocatorOpTag::Free => AllocatorOp::Free {
                index: usize::arbitrary(g),
            },
        }
    }
}

type OpId = u32;

trait Prop {
    /// The allocator to test for this property.
    type Allocator: QcAllocator;

    /// Examines a fresh allocation.
    fn post_allocate(
        allocator: &mut Self::Allocator,
        op_id: OpId,
        handle: <Self::Allocator as QcAllocator>::Handle,
    ) -> bool {
        let _ = (allocator, op_id, handle);
        true
    }

    /// Examines an allocation about to be freed.
    fn pre_deallocate(
        allocator: &mut Self::Allocator,
        op_id: OpId,
        handle: <Self::Allocator as QcAllocator>::Handle,
    ) -> bool {
        let _ = (allocator, op_id, handle);
        true
    }

    /// Examines the allocator after every operation.
    fn post_op(allocator: &Self::Allocator) -> bool {
        let _ = allocator;
        true
    }
}

struct AllocatorChecker<P: Prop> {
    allocator: P::Allocator,
    allocations: Vec<(OpId, <P::Allocator as QcAllocator>::Handle)>,
    num_ops: u32,
}

impl<P: Prop> AllocatorChecker<P> {
    fn new(
        params: <P::Allocator as QcAllocator>::Params,
        capacity: usize,
    ) -> Result<Self, AllocInitError> {
        Ok(AllocatorChecker {
            allocator: P::Allocator::with_params(params)?,
            allocations: Vec::with_capacity(capacity),
            num_ops: 0,
        })
    }

    fn do_op(&mut self, op: AllocatorOp<<P::Allocator as QcAllocator>::Request>) -> bool {
        let op_id = self.num_ops;
        self.num_ops += 1;

        match op {
            AllocatorOp::Allocate { request } => {
                if let Some(handle) = self.allocator.allocate(&request) {
                    if !P::post_allocate(&mut self.allocator, op_id, handle) {
                        return false;
                    }

                    self.allocations.push((op_id, handle));
                }
            }

            AllocatorOp::Free { index } => {
                if self.allocations.is_empty() {
                    return true;
                }

                let index = index % self.allocations.len();
                let (id, handle) = self.allocations.swap_remove(index);

                if !P::pre_deallocate(&mut self.allocator, id, handle) {
                    return false;
                }

                self.allocator.deallocate(handle);
            }
        }

        P::post_op(&self.allocator)
    }

    fn run(mut self, ops: Vec<AllocatorOp<<P::Allocator as QcAllocator>::Request>>) -> bool {
        if !ops.into_iter().all(|op| self.do_op(op)) {
            return false;
        }

        // Free any outstanding allocations.
        for (id, handle) in core::mem::take(&mut self.allocations) {
            if !P::pre_deallocate(&mut self.allocator, id, handle) {
                return false;
            }

            self.allocator.deallocate(handle);
        }

        self.allocator.assert_consistent();
        self.allocator.teardown()
    }
}

const MAX_TESTS: u64 = 100;

/// Every allocation is painted with the id of the operation that made it; the
/// paint must be intact when it is freed.
struct MutuallyExclusive<A: QcAllocator> {
    phantom: PhantomData<A>,
}

fn paint(bytes: &mut [u8], op_id: OpId) {
    for (b, p) in bytes.iter_mut().zip(op_id.to_le_bytes().iter().cycle()) {
        *b = *p;
    }
}

fn verify(bytes: &[u8], op_id: OpId) -> bool {
    bytes
        .iter()
        .zip(op_id.to_le_bytes().iter().cycle())
        .all(|(b, p)| b == p)
}

impl<A: QcAllocator> Prop for MutuallyExclusive<A> {
    type Allocator = A;

    fn post_allocate(allocator: &mut A, op_id: OpId, handle: A::Handle) -> bool {
        paint(allocator.bytes_mut(handle), op_id);
        true
    }

    fn pre_deallocate(allocator: &mut A, op_id: OpId, handle: A::Handle) -> bool {
        verify(allocator.bytes_mut(handle), op_id)
    }
}

/// The allocator's bookkeeping is consistent after every operation.
struct Consistent<A: QcAllocator> {
    phantom: PhantomData<A>,
}

impl<A: QcAllocator> Prop for Consistent<A> {
    type Allocator = A;

    fn post_op(allocator: &A) -> bool {
        allocator.assert_consistent();
        true
    }
}

fn check<P: Prop>(
    params: <P::Allocator as QcAllocator>::Params,
    ops: Vec<AllocatorOp<<P::Allocator as QcAllocator>::Request>>,
) -> bool {
    let checker: AllocatorChecker<P> = AllocatorChecker::new(params, ops.len()).unwrap();
    checker.run(ops)
}

#[test]
fn buddy_allocations_are_mutually_exclusive() {
    init_tracing();
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(check::<MutuallyExclusive<BuddyArena<Global>>> as fn(_, _) -> bool);
}

#[test]
fn buddy_bookkeeping_is_consistent() {
    init_tracing();
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(check::<Consistent<BuddyArena<Global>>> as fn(_, _) -> bool);
}

#[test]
fn slab_allocations_are_mutually_exclusive() {
    init_tracing();
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(check::<MutuallyExclusive<SlabHarness>> as fn(_, _) -> bool);
}

#[test]
fn slab_bookkeeping_is_consistent() {
    init_tracing();
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(check::<Consistent<SlabHarness>> as fn(_, _) -> bool);
}

// Version sync ================================================================
#[test]
fn html_root_url() {
    version_sync::assert_html_root_url_updated!("src/lib.rs");
}
