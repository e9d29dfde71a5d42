// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Property-based tests of the isolation core against a per-page reference model
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; the model keeps one mode per page per entity and no tables at all
//!
//! TEST_SCOPE:
//!   - Random operation sequences keep the representation check green
//!   - Table contents and the ownership ledger agree with the page model after every step
//!   - Failed operations report the same error as the model and change nothing
//!   - Pool exhaustion in the middle of an operation is invisible
//!
//! TEST_SCENARIOS:
//!   - random_sequences_follow_page_model(): every step matches the model exactly
//!   - exhaustion_is_all_or_nothing(): a budget-limited final step either fully applies or leaves no trace

use hv_isolation::{
    AddrRange, Entity, EntitySet, IsolationError, MemoryManager, MmConfig, Mode, PAddr, ShareMode, VmId, PAGE_SIZE,
};
use proptest::prelude::*;

const PAGES: u64 = 1024;
const WINDOW: AddrRange = AddrRange::new(0, PAGES * PAGE_SIZE);
const ENTITIES: [Entity; 3] = [Entity::Hypervisor, Entity::vm(0), Entity::vm(1)];

#[derive(Clone, Copy, Debug)]
enum Op {
    Map(usize, AddrRange, Mode),
    Share(usize, usize, AddrRange, ShareMode),
    Reclaim(usize, usize, AddrRange),
    ValidateAndMap(u16, AddrRange, Mode),
}

/// One mode per page for each entity in `ENTITIES`.
#[derive(Clone, Debug, PartialEq)]
struct PageModel {
    pages: Vec<Vec<Mode>>,
}

fn pages_of(range: AddrRange) -> core::ops::Range<usize> {
    (range.begin.raw() / PAGE_SIZE) as usize..(range.end.raw() / PAGE_SIZE) as usize
}

impl PageModel {
    fn new() -> Self {
        Self { pages: vec![vec![Mode::ABSENT; PAGES as usize]; ENTITIES.len()] }
    }

    fn uniform(&self, who: usize, range: AddrRange) -> Option<Mode> {
        let mut modes = self.pages[who][pages_of(range)].iter().copied();
        let first = modes.next()?;
        modes.all(|mode| mode == first).then_some(first)
    }

    fn set(&mut self, who: usize, range: AddrRange, mode: Mode) {
        // Every generated mode already carries R, which stage-1 would add anyway.
        let mode = mode.canonical();
        for page in &mut self.pages[who][pages_of(range)] {
            *page = mode;
        }
    }

    fn owned_by(&self, page: usize) -> EntitySet {
        ENTITIES.iter().enumerate().filter(|(who, _)| self.pages[*who][page].is_owned()).map(|(_, e)| *e).collect()
    }

    fn accessible_by(&self, page: usize) -> EntitySet {
        ENTITIES.iter().enumerate().filter(|(who, _)| self.pages[*who][page].is_valid()).map(|(_, e)| *e).collect()
    }

    /// Applies `op` when its preconditions hold and reports what the core should answer.
    fn apply(&mut self, op: Op) -> Result<(), IsolationError> {
        match op {
            Op::Map(who, range, mode) => {
                self.set(who, range, mode);
                Ok(())
            }
            Op::Share(from, to, range, how) => {
                let (sender, recipient) = (ENTITIES[from], ENTITIES[to]);
                if from == to {
                    return Err(IsolationError::SameEntity(sender));
                }
                let orig = self.uniform(from, range).ok_or(IsolationError::NotUniform(sender))?;
                if !orig.is_owned() {
                    return Err(IsolationError::NotOwned(sender));
                }
                if !orig.is_valid() {
                    return Err(IsolationError::NotAccessible(sender));
                }
                if orig.contains(Mode::SHARED) {
                    return Err(IsolationError::AlreadyShared(sender));
                }
                if orig.contains(Mode::D) {
                    return Err(IsolationError::DeviceMemory);
                }
                if self.uniform(to, range) != Some(Mode::ABSENT) {
                    return Err(IsolationError::AlreadyMapped(recipient));
                }
                let access = orig & Mode::RWX;
                let (kept, given) = match how {
                    ShareMode::Give => (Mode::ABSENT, orig),
                    ShareMode::Lend => (orig | Mode::INVALID, access | Mode::UNOWNED),
                    ShareMode::Share => (orig | Mode::SHARED, access | Mode::UNOWNED | Mode::SHARED),
                };
                self.set(from, range, kept);
                self.set(to, range, given);
                Ok(())
            }
            Op::Reclaim(owner, borrower, range) => {
                if owner == borrower {
                    return Err(IsolationError::SameEntity(ENTITIES[owner]));
                }
                let orig = self.uniform(owner, range).ok_or(IsolationError::NotUniform(ENTITIES[owner]))?;
                if !orig.is_owned() {
                    return Err(IsolationError::NotOwned(ENTITIES[owner]));
                }
                let lent = self.uniform(borrower, range).ok_or(IsolationError::NotUniform(ENTITIES[borrower]))?;
                if lent.is_owned() || !lent.is_valid() {
                    return Err(IsolationError::NotAccessible(ENTITIES[borrower]));
                }
                self.set(owner, range, orig - (Mode::INVALID | Mode::SHARED));
                self.set(borrower, range, Mode::ABSENT);
                Ok(())
            }
            Op::ValidateAndMap(vm, range, permissions) => {
                let who = vm as usize + 1;
                let wanted = permissions & Mode::RWX;
                let modes = &self.pages[who][pages_of(range)];
                if modes.iter().any(|mode| !mode.is_owned()) {
                    return Err(IsolationError::NotOwned(ENTITIES[who]));
                }
                if modes.iter().any(|mode| !mode.is_valid() || !mode.contains(wanted)) {
                    return Err(IsolationError::NotAccessible(ENTITIES[who]));
                }
                if self.pages[0][pages_of(range)].iter().any(|mode| mode.is_owned()) {
                    return Err(IsolationError::AlreadyMapped(Entity::Hypervisor));
                }
                self.set(0, range, wanted | Mode::R | Mode::UNOWNED | Mode::SHARED);
                for page in &mut self.pages[who][pages_of(range)] {
                    *page |= Mode::SHARED;
                }
                Ok(())
            }
        }
    }
}

fn run(mm: &MemoryManager, op: Op) -> Result<(), IsolationError> {
    match op {
        Op::Map(who, range, mode) => mm.identity_map(ENTITIES[who], range, mode),
        Op::Share(from, to, range, how) => mm.share(ENTITIES[from], ENTITIES[to], range, how),
        Op::Reclaim(owner, borrower, range) => mm.reclaim(ENTITIES[owner], ENTITIES[borrower], range),
        Op::ValidateAndMap(vm, range, permissions) => mm.validate_and_map(VmId::new(vm), range, permissions),
    }
}

/// Expands the tables back into the per-page form of the model.
fn observe(mm: &MemoryManager) -> PageModel {
    let mut model = PageModel::new();
    for (who, entity) in ENTITIES.iter().enumerate() {
        for (range, mode) in mm.dump(*entity, WINDOW).expect("dump") {
            model.set(who, range, mode);
        }
    }
    model
}

fn assert_matches(mm: &MemoryManager, model: &PageModel) -> Result<(), TestCaseError> {
    prop_assert_eq!(mm.verify(), Ok(()));
    prop_assert_eq!(&observe(mm), model);
    for page in (0..PAGES as usize).step_by(7) {
        let addr = PAddr::new(page as u64 * PAGE_SIZE);
        prop_assert_eq!(mm.owned_by(addr), Ok(model.owned_by(page)));
        prop_assert_eq!(mm.accessible_by(addr), Ok(model.accessible_by(page)));
    }
    Ok(())
}

fn manager() -> MemoryManager {
    let config = MmConfig::default().with_node_frames(64);
    let mm = MemoryManager::new(config).expect("manager");
    mm.create_vm(VmId::new(0)).expect("vm0");
    mm.create_vm(VmId::new(1)).expect("vm1");
    mm
}

fn arb_range() -> impl Strategy<Value = AddrRange> {
    let blocks = PAGES / 512;
    prop_oneof![
        4 => (0..PAGES, 1..=16u64).prop_map(|(page, len)| {
            AddrRange::new(page * PAGE_SIZE, (page + len.min(PAGES - page)) * PAGE_SIZE)
        }),
        2 => (0..blocks).prop_map(|block| AddrRange::new(block * 512 * PAGE_SIZE, (block + 1) * 512 * PAGE_SIZE)),
        1 => Just(WINDOW),
    ]
}

fn arb_mode() -> impl Strategy<Value = Mode> {
    let rw = Mode::R | Mode::W;
    prop::sample::select(vec![
        Mode::ABSENT,
        Mode::R,
        rw,
        Mode::RWX,
        Mode::R | Mode::X,
        Mode::R | Mode::D,
        rw | Mode::INVALID,
        Mode::R | Mode::UNOWNED,
        rw | Mode::SHARED,
        Mode::R | Mode::UNOWNED | Mode::SHARED,
    ])
}

fn arb_share_mode() -> impl Strategy<Value = ShareMode> {
    prop_oneof![Just(ShareMode::Give), Just(ShareMode::Lend), Just(ShareMode::Share)]
}

fn arb_op() -> impl Strategy<Value = Op> {
    let who = 0..ENTITIES.len();
    prop_oneof![
        3 => (who.clone(), arb_range(), arb_mode()).prop_map(|(who, range, mode)| Op::Map(who, range, mode)),
        3 => (who.clone(), who.clone(), arb_range(), arb_share_mode())
            .prop_map(|(from, to, range, how)| Op::Share(from, to, range, how)),
        2 => (who.clone(), who, arb_range()).prop_map(|(owner, borrower, range)| Op::Reclaim(owner, borrower, range)),
        1 => (0u16..2, arb_range(), prop::sample::select(vec![Mode::R, Mode::R | Mode::W, Mode::RWX]))
            .prop_map(|(vm, range, perms)| Op::ValidateAndMap(vm, range, perms)),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn random_sequences_follow_page_model(ops in prop::collection::vec(arb_op(), 1..24)) {
        let mm = manager();
        let mut model = PageModel::new();
        for op in ops {
            let free = mm.free_frames();
            let expected = model.apply(op);
            let rejected = expected.is_err();
            prop_assert_eq!(run(&mm, op), expected, "op {:?}", op);
            if rejected {
                prop_assert_eq!(mm.free_frames(), free);
            }
            assert_matches(&mm, &model)?;
        }
    }
}

#[cfg(feature = "failpoints")]
proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn exhaustion_is_all_or_nothing(
        setup in prop::collection::vec(arb_op(), 0..12),
        last in arb_op(),
        budget in 0usize..4,
    ) {
        let mm = manager();
        let mut model = PageModel::new();
        for op in setup {
            let _ = run(&mm, op);
            let _ = model.apply(op);
        }
        assert_matches(&mm, &model)?;

        let free = mm.free_frames();
        let mut after = model.clone();
        let expected = after.apply(last);
        mm.set_alloc_budget(Some(budget));
        let result = run(&mm, last);
        mm.set_alloc_budget(None);

        match result {
            Err(IsolationError::PoolExhausted) => {
                prop_assert!(expected.is_ok(), "exhausted before rejecting {:?}", last);
                prop_assert_eq!(mm.free_frames(), free);
                assert_matches(&mm, &model)?;
            }
            other => {
                prop_assert_eq!(other, expected);
                assert_matches(&mm, &after)?;
            }
        }
    }
}
