use daplink::flashing::{
    FlashError, FlashFunction, FlashProgress, FlashSequencer, InjectedFailure, ProgressEvent,
    Routine, SequencerOptions, SimulatedFlash,
};
use daplink::lock::DapLock;
use daplink_target::Registry;
use pretty_assertions::assert_eq;
use std::cell::RefCell;
use std::rc::Rc;
use test_case::test_case;

const TEST_BOARD: &str = include_str!("test_board.yaml");

fn registry() -> Registry {
    let mut registry = Registry::new();
    registry
        .add_target_from_yaml(TEST_BOARD.as_bytes())
        .expect("Failed to parse the test board.");
    registry
}

#[test]
fn reprogramming_does_not_erase_again() {
    let registry = registry();
    let target = registry.get_target_by_board_id("fff0").unwrap();
    let mut flash = SimulatedFlash::for_target(target);
    let data = vec![0x5a; 0x100];

    let mut sequencer = FlashSequencer::new(target, &mut flash, SequencerOptions::default());
    sequencer.program(0x0, &data).unwrap();
    sequencer.program(0x0, &data).unwrap();
    sequencer.finish().unwrap();
    drop(sequencer);

    assert_eq!(flash.erased_sectors(), &[0x0]);
    assert_eq!(flash.programmed_pages(), &[(0x0, 0x100), (0x0, 0x100)]);
    assert_eq!(flash.contents(0x0, 0x100), data);
}

#[test]
fn small_chunks_erase_each_sector_once() {
    let registry = registry();
    let target = registry.get_target_by_board_id("fff0").unwrap();
    let mut flash = SimulatedFlash::for_target(target);

    let mut sequencer = FlashSequencer::new(target, &mut flash, SequencerOptions::default());
    for address in (0x0..0x800).step_by(0x40) {
        sequencer.program(address, &[0; 0x40]).unwrap();
    }
    sequencer.finish().unwrap();
    drop(sequencer);

    assert_eq!(flash.erased_sectors(), &[0x0, 0x400]);
    assert_eq!(flash.counters().init, 1);
    assert_eq!(flash.counters().uninit, 1);
    assert_eq!(flash.counters().finish, 1);
}

#[test_case(Routine::EraseSector, InjectedFailure::Code(2); "erase failure")]
#[test_case(Routine::ProgramPage, InjectedFailure::Code(2); "program failure")]
#[test_case(Routine::ProgramPage, InjectedFailure::Timeout; "program timeout")]
#[test_case(Routine::EraseSector, InjectedFailure::LockedUp; "erase lockup")]
fn uninit_once_after_failure(routine: Routine, failure: InjectedFailure) {
    let registry = registry();
    let target = registry.get_target_by_board_id("fff0").unwrap();
    let mut flash = SimulatedFlash::for_target(target);
    flash.inject_failure(routine, 2, failure);

    let mut sequencer = FlashSequencer::new(target, &mut flash, SequencerOptions::default());
    assert!(sequencer.program(0x0, &[0; 0x800]).is_err());
    assert!(!sequencer.is_session_open());
    sequencer.finish().unwrap();
    drop(sequencer);

    assert_eq!(flash.counters().uninit, 1);
    assert_eq!(flash.uninit_calls(), &[FlashFunction::Program]);
    assert!(!flash.is_initialized());
}

#[test]
fn lock_rejects_second_session() {
    let registry = registry();
    let target = registry.get_target_by_board_id("fff0").unwrap();
    let lock = DapLock::new();
    let mut first_flash = SimulatedFlash::for_target(target);
    let mut second_flash = SimulatedFlash::for_target(target);

    let mut first = FlashSequencer::new(target, &mut first_flash, SequencerOptions::default())
        .with_lock(lock.clone());
    let mut second = FlashSequencer::new(target, &mut second_flash, SequencerOptions::default())
        .with_lock(lock.clone());

    first.program(0x0, &[0; 4]).unwrap();
    assert_eq!(lock.current_holder().as_deref(), Some("program"));

    let error = second.program(0x0, &[0; 4]).unwrap_err();
    assert!(matches!(error.error, FlashError::TargetBusy { .. }));

    first.finish().unwrap();
    assert!(!lock.is_locked());

    second.program(0x0, &[0; 4]).unwrap();
    second.finish().unwrap();
    drop(second);

    assert_eq!(second_flash.counters().init, 1);
}

#[test]
fn abort_stops_at_page_boundary() {
    let registry = registry();
    let target = registry.get_target_by_board_id("fff0").unwrap();
    let mut flash = SimulatedFlash::for_target(target);

    let sequencer = FlashSequencer::new(target, &mut flash, SequencerOptions::default());
    let abort = sequencer.abort_handle();
    let handle = abort.clone();
    let mut sequencer = sequencer.with_progress(FlashProgress::new(move |event| {
        if let ProgressEvent::PageProgrammed { .. } = event {
            handle.abort();
        }
    }));

    let error = sequencer.program(0x0, &[0; 0x800]).unwrap_err();
    assert_eq!(error.address, 0x200);
    assert!(matches!(error.error, FlashError::Aborted));

    abort.reset();
    sequencer.program(0x0, &[0; 4]).unwrap();
    sequencer.finish().unwrap();
    drop(sequencer);

    assert_eq!(flash.programmed_pages(), &[(0x0, 0x200), (0x0, 0x4)]);
    assert_eq!(flash.counters().uninit, 2);
}

#[test]
fn progress_events() {
    let registry = registry();
    let target = registry.get_target_by_board_id("fff0").unwrap();
    let mut flash = SimulatedFlash::for_target(target);
    let events = Rc::new(RefCell::new(vec![]));
    let sink = events.clone();

    let mut sequencer = FlashSequencer::new(target, &mut flash, SequencerOptions::default())
        .with_progress(FlashProgress::new(move |event| {
            sink.borrow_mut().push(match event {
                ProgressEvent::SectorErased { address, size, .. } => {
                    format!("erase {address:#x} {size:#x}")
                }
                ProgressEvent::PageProgrammed { address, size, .. } => {
                    format!("page {address:#x} {size:#x}")
                }
                other => format!("{other:?}"),
            })
        }));
    sequencer.download(0x1000_0000, &[1; 0x300]).unwrap();
    drop(sequencer);

    assert_eq!(
        *events.borrow(),
        vec![
            "SessionStarted { region: 268435456..268437504 }".to_string(),
            "erase 0x10000000 0x800".to_string(),
            "page 0x10000000 0x200".to_string(),
            "page 0x10000200 0x100".to_string(),
            "SessionFinished".to_string(),
        ]
    );
}

#[test]
fn erase_all_uses_chip_erase_once_per_algorithm() {
    let registry = registry();
    let target = registry.get_target_by_board_id("fff0").unwrap();
    let mut flash = SimulatedFlash::for_target(target);
    flash.write_contents(0x1000_0000, &[0; 4]);

    let mut sequencer = FlashSequencer::new(target, &mut flash, SequencerOptions::default());
    sequencer.erase_all().unwrap();
    drop(sequencer);

    // Both regions share the algorithm, so the first chip erase covers both.
    assert_eq!(flash.counters().erase_chip, 1);
    assert_eq!(flash.init_calls(), &[(0x0, FlashFunction::Erase)]);
    assert_eq!(flash.uninit_calls(), &[FlashFunction::Erase]);
    assert_eq!(flash.contents(0x1000_0000, 4), vec![0xff; 4]);
}

#[test]
fn unmapped_address_uses_default_region() {
    let registry = registry();
    let target = registry.get_target_by_board_id("fff0").unwrap();
    let mut flash = SimulatedFlash::for_target(target);

    let mut sequencer = FlashSequencer::new(target, &mut flash, SequencerOptions::default());
    sequencer.program(0x0800_0000, &[0; 4]).unwrap();
    sequencer.finish().unwrap();
    drop(sequencer);

    assert_eq!(flash.init_calls(), &[(0x0, FlashFunction::Program)]);
    assert_eq!(flash.erased_sectors(), &[0x0800_0000]);
}
