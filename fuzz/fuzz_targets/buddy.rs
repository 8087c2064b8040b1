#![no_main]
use arbitrary::{Arbitrary, Unstructured};
use buddy_slab::ArenaConfig;
use buddy_slab_hater::{AllocatorOp, ArbOrder, BuddySubject, Evaluator};
use libfuzzer_sys::fuzz_target;

const MAX_PAGE_SHIFT: u8 = 12;
const MAX_ORDER: u8 = 12;

#[derive(Clone, Debug)]
struct Args {
    config: ArenaConfig,
    ops: Vec<AllocatorOp<ArbOrder>>,
}

impl Arbitrary<'_> for Args {
    fn arbitrary(un: &mut Unstructured) -> arbitrary::Result<Args> {
        // Page sizes run from 16 bytes up to 4 KiB.
        let page_shift = 4 + u8::arbitrary(un)? % (MAX_PAGE_SHIFT - 3);
        let max_order = u8::arbitrary(un)? % (MAX_ORDER + 1);
        let ops = Vec::arbitrary(un)?;

        Ok(Args {
            config: ArenaConfig::new(1 << page_shift, max_order.into()),
            ops,
        })
    }
}

fuzz_target!(|args: Args| {
    let subject = match BuddySubject::new(args.config) {
        Ok(s) => s,
        Err(_) => return,
    };

    let mut eval = Evaluator::new(subject);
    eval.evaluate(args.ops).unwrap();
});
