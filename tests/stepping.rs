//! Source level stepping scenarios: inlined callees, avoided functions,
//! code without debug information, prologue skipping, trampolines and
//! run-until.

mod common;

use common::{tid, MockDebugee};
use regex::Regex;
use stepline::address::RelocatedAddress;
use stepline::control::SiteId;
use stepline::plan::should_stop_here::StepFlags;
use stepline::plan::PlanKind;
use stepline::stop::{StopReason, Vote};
use stepline::thread::{RunState, Thread};

#[test]
fn step_into_surfaces_an_inlined_callee_without_moving() {
    let mut debugee = MockDebugee::new();
    debugee.add_place("main.rs", 5, 0x1000, 0x1010);
    debugee.add_fn_range(0x1000, 0x1100);
    // frame zero is an inline expansion at the same program counter
    debugee.stop_at_inlined(
        0x1000,
        StopReason::None,
        vec![(0x1000, 0x8000), (0x1000, 0x8000), (0x2000, 0x9000)],
        1,
    );
    let mut thread = Thread::new(tid(), 1);

    let plan_id = thread
        .queue_step_into_line(StepFlags::default(), None, false, &mut debugee)
        .unwrap()
        .expect("line info is present");

    // the step is purely presentational: the resume is vetoed and the
    // debugee never moves
    assert!(!thread.will_resume(&mut debugee, RunState::Stepping).unwrap());

    // the faked stop still finishes the step and reports it
    assert!(thread.should_stop(&mut debugee).unwrap());
    assert_eq!(thread.should_report_stop(), Vote::Yes);
    let info = thread.stop_info(&mut debugee).unwrap();
    assert_eq!(info.reason, StopReason::PlanComplete { plan: plan_id });

    thread.destroy(&mut debugee);
}

#[test]
fn step_into_avoids_functions_matching_the_pattern() {
    let mut debugee = MockDebugee::new();
    debugee.add_place("main.rs", 5, 0x1000, 0x1010);
    debugee.add_fn_range(0x1000, 0x1100);
    debugee.add_fn_name(0x5000, 0x5100, "core::fmt::write");
    debugee.stop_at(0x1000, StopReason::None, vec![(0x1000, 0x8000)]);
    let mut thread = Thread::new(tid(), 1);

    let avoid = Regex::new("^core::").unwrap();
    thread
        .queue_step_into_line(StepFlags::default(), Some(avoid), false, &mut debugee)
        .unwrap()
        .expect("line info is present");

    assert!(thread.will_resume(&mut debugee, RunState::Stepping).unwrap());
    thread.did_resume();

    // landed in an avoided function: an automatic step out takes over
    debugee.stop_at(
        0x5000,
        StopReason::Trace,
        vec![(0x5000, 0x7000), (0x1008, 0x8000)],
    );
    assert!(!thread.should_stop(&mut debugee).unwrap());
    assert_eq!(thread.plans().top().kind(), PlanKind::StepOut);
    assert_eq!(debugee.internal_site_count(), 1);

    thread.destroy(&mut debugee);
}

#[test]
fn step_into_leaves_code_without_debug_info() {
    let mut debugee = MockDebugee::new();
    debugee.add_place("main.rs", 5, 0x1000, 0x1010);
    debugee.add_fn_range(0x1000, 0x1100);
    debugee.mark_no_debug_info(0x5000, 0x5100);
    debugee.stop_at(0x1000, StopReason::None, vec![(0x1000, 0x8000)]);
    let mut thread = Thread::new(tid(), 1);

    let mut flags = StepFlags::default();
    flags.insert(StepFlags::AVOID_NO_DEBUG);
    thread
        .queue_step_into_line(flags, None, false, &mut debugee)
        .unwrap()
        .expect("line info is present");

    assert!(thread.will_resume(&mut debugee, RunState::Stepping).unwrap());
    thread.did_resume();

    // the callee is opaque, step back out instead of presenting it
    debugee.stop_at(
        0x5000,
        StopReason::Trace,
        vec![(0x5000, 0x7000), (0x1008, 0x8000)],
    );
    assert!(!thread.should_stop(&mut debugee).unwrap());
    assert_eq!(thread.plans().top().kind(), PlanKind::StepOut);

    thread.destroy(&mut debugee);
}

#[test]
fn step_into_runs_past_the_callee_prologue() {
    let mut debugee = MockDebugee::new();
    debugee.add_place("main.rs", 5, 0x1000, 0x1010);
    debugee.add_fn_range(0x1000, 0x1100);
    debugee.add_fn_range(0x5000, 0x5100);
    debugee.set_prologue(0x5000, 8);
    debugee.stop_at(0x1000, StopReason::None, vec![(0x1000, 0x8000)]);
    let mut thread = Thread::new(tid(), 1);

    let plan_id = thread
        .queue_step_into_line(StepFlags::default(), None, false, &mut debugee)
        .unwrap()
        .expect("line info is present");

    assert!(thread.will_resume(&mut debugee, RunState::Stepping).unwrap());
    thread.did_resume();

    // entering the callee on its first instruction: run to the end of the
    // prologue before showing the frame
    debugee.stop_at(
        0x5000,
        StopReason::Trace,
        vec![(0x5000, 0x7000), (0x1008, 0x8000)],
    );
    assert!(!thread.should_stop(&mut debugee).unwrap());
    assert_eq!(thread.plans().top().kind(), PlanKind::RunToAddress);
    assert_eq!(debugee.internal_site_count(), 1);

    assert!(thread.will_resume(&mut debugee, RunState::Running).unwrap());
    thread.did_resume();
    debugee.stop_at(
        0x5008,
        StopReason::Breakpoint { site: SiteId(0) },
        vec![(0x5008, 0x7000), (0x1008, 0x8000)],
    );
    assert!(thread.should_stop(&mut debugee).unwrap());
    assert_eq!(debugee.internal_site_count(), 0);
    let info = thread.stop_info(&mut debugee).unwrap();
    assert_eq!(info.reason, StopReason::PlanComplete { plan: plan_id });

    thread.destroy(&mut debugee);
}

#[test]
fn step_into_crosses_a_linker_trampoline() {
    let mut debugee = MockDebugee::new();
    debugee.add_place("main.rs", 5, 0x1000, 0x1010);
    debugee.add_fn_range(0x1000, 0x1100);
    debugee.add_trampoline(0x4000, 0x6000);
    debugee.stop_at(0x1000, StopReason::None, vec![(0x1000, 0x8000)]);
    let mut thread = Thread::new(tid(), 1);

    thread
        .queue_step_into_line(StepFlags::default(), None, false, &mut debugee)
        .unwrap()
        .expect("line info is present");

    assert!(thread.will_resume(&mut debugee, RunState::Stepping).unwrap());
    thread.did_resume();

    // landed on a PLT stub: a step through plan arms the dispatch target
    // and a backstop at the return address
    debugee.stop_at(
        0x4000,
        StopReason::Trace,
        vec![(0x4000, 0x7000), (0x1008, 0x8000)],
    );
    assert!(!thread.should_stop(&mut debugee).unwrap());
    assert_eq!(thread.plans().top().kind(), PlanKind::StepThrough);
    assert_eq!(debugee.internal_site_count(), 2);

    assert!(thread.will_resume(&mut debugee, RunState::Running).unwrap());
    thread.did_resume();
    debugee.stop_at(
        0x6000,
        StopReason::Breakpoint { site: SiteId(0) },
        vec![(0x6000, 0x7000), (0x1008, 0x8000)],
    );
    assert!(thread.should_stop(&mut debugee).unwrap());
    assert_eq!(debugee.internal_site_count(), 0);
    let info = thread.stop_info(&mut debugee).unwrap();
    assert!(matches!(info.reason, StopReason::PlanComplete { .. }));

    thread.destroy(&mut debugee);
}

#[test]
fn step_until_ignores_hits_in_deeper_activations() {
    let mut debugee = MockDebugee::new();
    debugee.stop_at(0x1000, StopReason::None, vec![(0x1000, 0x8000), (0x2000, 0x9000)]);
    let mut thread = Thread::new(tid(), 1);

    let plan_id = thread
        .queue_step_until(
            vec![RelocatedAddress::from(0x1050_usize)],
            false,
            &mut debugee,
        )
        .unwrap()
        .expect("plan must be accepted");
    // one site per target address plus the frame return backstop
    assert_eq!(debugee.internal_site_count(), 2);
    let target_site = SiteId(0);

    assert!(thread.will_resume(&mut debugee, RunState::Running).unwrap());
    thread.did_resume();

    // recursion reaches the address in a younger activation: not a hit
    debugee.stop_at(
        0x1050,
        StopReason::Breakpoint { site: target_site },
        vec![(0x1050, 0x7000), (0x1020, 0x8000), (0x2000, 0x9000)],
    );
    assert!(!thread.should_stop(&mut debugee).unwrap());

    assert!(thread.will_resume(&mut debugee, RunState::Running).unwrap());
    thread.did_resume();

    // the same address in the starting frame finishes the plan
    debugee.stop_at(
        0x1050,
        StopReason::Breakpoint { site: target_site },
        vec![(0x1050, 0x8000), (0x2000, 0x9000)],
    );
    assert!(thread.should_stop(&mut debugee).unwrap());
    assert_eq!(thread.should_report_stop(), Vote::Yes);
    assert_eq!(debugee.internal_site_count(), 0);
    let info = thread.stop_info(&mut debugee).unwrap();
    assert_eq!(info.reason, StopReason::PlanComplete { plan: plan_id });

    thread.destroy(&mut debugee);
}
