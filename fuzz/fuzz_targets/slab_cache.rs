#![no_main]
use arbitrary::{Arbitrary, Unstructured};
use buddy_slab::ArenaConfig;
use buddy_slab_hater::{AllocatorOp, Evaluator, SlabSubject};
use libfuzzer_sys::fuzz_target;

const PAGE_SIZE: usize = 1024;
const MAX_ORDER: usize = 6;

#[derive(Clone, Debug)]
struct Args {
    obj_size: usize,
    ops: Vec<AllocatorOp<()>>,
}

impl Arbitrary<'_> for Args {
    fn arbitrary(un: &mut Unstructured) -> arbitrary::Result<Args> {
        let obj_size = 1 + usize::arbitrary(un)? % PAGE_SIZE;
        let ops = Vec::arbitrary(un)?;

        Ok(Args { obj_size, ops })
    }
}

fuzz_target!(|args: Args| {
    let config = ArenaConfig::new(PAGE_SIZE, MAX_ORDER);
    let subject = match SlabSubject::new(config, args.obj_size) {
        Ok(s) => s,
        Err(_) => return,
    };

    let mut eval = Evaluator::new(subject);
    eval.evaluate(args.ops).unwrap();
    assert!(eval.into_subject().teardown());
});
