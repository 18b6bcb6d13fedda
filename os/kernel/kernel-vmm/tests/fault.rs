mod common;

use common::{TestManager, boot};
use kernel_info::memory::{KERNEL_AREA_START, USER_START};
use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress};
use kernel_vmm::fault::PAGE_FAULT_VECTOR;
use kernel_vmm::{
    AddressSpace, ExecutionUnit, FaultOutcome, FaultRejection, PageFaultError, TrapFrame, VmFlags,
};
use std::sync::Arc;

const PAGE: u64 = 4096;

fn trap(error: PageFaultError, user: bool) -> TrapFrame {
    TrapFrame {
        vector: PAGE_FAULT_VECTOR,
        error_code: error.with_user(user).into_bits(),
        rip: if user { USER_START + 0x10 } else { 0xffff_ffff_8000_0100 },
        cs: if user { 0x23 } else { 0x08 },
        ..TrapFrame::default()
    }
}

fn read() -> PageFaultError {
    PageFaultError::new()
}

fn write() -> PageFaultError {
    PageFaultError::new().with_write(true)
}

/// A CPU running a fresh user space.
fn running(mm: &TestManager) -> (Arc<AddressSpace>, ExecutionUnit) {
    let space = mm.create_address_space().unwrap();
    let mut cpu = ExecutionUnit::new();
    mm.switch(&mut cpu, space.clone());
    (space, cpu)
}

#[test]
fn first_touch_maps_one_zeroed_page() {
    let mm = boot();
    let (space, cpu) = running(&mm);
    let base = mm.allocate(&space, 2 * PAGE, VmFlags::user_data(), None).unwrap();

    let before = mm.frames().free_frames();
    let outcome = mm.handle_page_fault(&cpu, &trap(write(), true), base + 0x123);
    assert_eq!(outcome, FaultOutcome::Resolved);
    // One data page plus the PDPT, PD and PT of an empty user half.
    assert_eq!(mm.frames().free_frames(), before - 4);

    let t = mm.translate(&space, base).unwrap();
    assert!(mm.mapper().page(t.pa).iter().all(|&b| b == 0));
    assert!(t.entry.user_access() && t.entry.writable() && t.entry.no_execute());
    assert!(!t.entry.global_translation());
    assert!(mm.translate(&space, base + PAGE).is_none(), "only the faulting page");

    // The neighbouring page reuses the tables.
    let before = mm.frames().free_frames();
    assert_eq!(
        mm.handle_page_fault(&cpu, &trap(read(), true), base + PAGE),
        FaultOutcome::Resolved
    );
    assert_eq!(mm.frames().free_frames(), before - 1);
}

#[test]
fn resolved_page_is_left_alone_by_a_stale_fault() {
    let mm = boot();
    let (space, cpu) = running(&mm);
    let base = mm.allocate(&space, PAGE, VmFlags::user_data(), None).unwrap();
    mm.handle_page_fault(&cpu, &trap(read(), true), base);
    let mapped = mm.translate(&space, base).unwrap();
    let before = mm.frames().free_frames();

    // A second CPU that faulted on the same page before the first one
    // finished arrives here afterwards.
    assert_eq!(
        mm.handle_page_fault(&cpu, &trap(write(), true), base),
        FaultOutcome::Resolved
    );
    assert_eq!(mm.translate(&space, base), Some(mapped));
    assert_eq!(mm.frames().free_frames(), before);
}

#[test]
fn write_to_read_only_area_maps_nothing() {
    let mm = boot();
    let (space, cpu) = running(&mm);
    let base = mm
        .allocate(&space, PAGE, VmFlags::read_only().with_user(true), None)
        .unwrap();
    let before = mm.frames().free_frames();

    assert_eq!(
        mm.handle_page_fault(&cpu, &trap(write(), true), base),
        FaultOutcome::Terminate(FaultRejection::WriteToReadOnly)
    );
    assert!(mm.translate(&space, base).is_none());
    assert_eq!(mm.frames().free_frames(), before);

    // Reading is fine, and a later write to the now present page is still refused.
    assert_eq!(
        mm.handle_page_fault(&cpu, &trap(read(), true), base),
        FaultOutcome::Resolved
    );
    assert!(!mm.translate(&space, base).unwrap().entry.writable());
    assert_eq!(
        mm.handle_page_fault(&cpu, &trap(write().with_present(true), true), base),
        FaultOutcome::Terminate(FaultRejection::WriteToReadOnly)
    );
}

#[test]
fn protection_faults_on_present_pages_are_rejected() {
    let mm = boot();
    let (space, cpu) = running(&mm);
    let base = mm.allocate(&space, PAGE, VmFlags::user_data(), None).unwrap();
    mm.handle_page_fault(&cpu, &trap(read(), true), base);

    assert_eq!(
        mm.handle_page_fault(&cpu, &trap(read().with_instruction_fetch(true).with_present(true), true), base),
        FaultOutcome::Terminate(FaultRejection::ExecuteNonExecutable)
    );
    assert_eq!(
        mm.handle_page_fault(&cpu, &trap(read().with_present(true), true), base),
        FaultOutcome::Terminate(FaultRejection::ProtectionViolation)
    );
}

#[test]
fn user_code_cannot_touch_kernel_only_areas() {
    let mm = boot();
    let (space, cpu) = running(&mm);
    let base = mm.allocate(&space, PAGE, VmFlags::kernel_data(), None).unwrap();

    assert_eq!(
        mm.handle_page_fault(&cpu, &trap(read(), true), base),
        FaultOutcome::Terminate(FaultRejection::ProtectionViolation)
    );
    // The kernel may touch it.
    assert_eq!(
        mm.handle_page_fault(&cpu, &trap(write(), false), base),
        FaultOutcome::Resolved
    );
    let t = mm.translate(&space, base).unwrap();
    assert!(!t.entry.user_access());
    // Lower-half pages belong to this space alone and must not survive a
    // switch to another one.
    assert!(!t.entry.global_translation());
    let other = mm.create_address_space().unwrap();
    assert!(mm.translate(&other, base).is_none());
}

#[test]
fn unmapped_access_terminates_users_and_stops_the_kernel() {
    let mm = boot();
    let (_space, cpu) = running(&mm);
    let nowhere = VirtualAddress::new(USER_START + 0x1000_0000);

    assert_eq!(
        mm.handle_page_fault(&cpu, &trap(read(), true), nowhere),
        FaultOutcome::Terminate(FaultRejection::Unmapped)
    );
    assert_eq!(
        mm.handle_page_fault(&cpu, &trap(read(), false), nowhere),
        FaultOutcome::Fatal(FaultRejection::Unmapped)
    );
    assert_eq!(
        mm.handle_page_fault(&cpu, &trap(read(), false), VirtualAddress::new(KERNEL_AREA_START)),
        FaultOutcome::Fatal(FaultRejection::Unmapped)
    );
}

#[test]
fn reserved_bit_is_always_fatal() {
    let mm = boot();
    let (space, cpu) = running(&mm);
    let base = mm.allocate(&space, PAGE, VmFlags::user_data(), None).unwrap();
    assert_eq!(
        mm.handle_page_fault(&cpu, &trap(read().with_reserved_bit(true).with_present(true), true), base),
        FaultOutcome::Fatal(FaultRejection::ReservedBit)
    );
}

#[test]
fn kernel_half_faults_resolve_in_the_kernel_space() {
    let mm = boot();
    let (space, cpu) = running(&mm);
    let buffer = mm
        .allocate(mm.kernel_space(), 4 * PAGE, VmFlags::kernel_data(), None)
        .unwrap();

    // The CPU is in a user space, but the address belongs to the kernel.
    assert_eq!(
        mm.handle_page_fault(&cpu, &trap(write(), false), buffer + 2 * PAGE),
        FaultOutcome::Resolved
    );
    let via_kernel = mm.translate(mm.kernel_space(), buffer + 2 * PAGE).unwrap();
    assert!(via_kernel.entry.global_translation());
    assert_eq!(mm.translate(&space, buffer + 2 * PAGE), Some(via_kernel));

    // Spaces created afterwards see it too.
    let later = mm.create_address_space().unwrap();
    assert_eq!(mm.translate(&later, buffer + 2 * PAGE), Some(via_kernel));
}

#[test]
fn without_a_current_space_low_faults_go_to_the_kernel_space() {
    let mm = boot();
    let idle = ExecutionUnit::new();
    assert_eq!(
        mm.handle_page_fault(&idle, &trap(read(), false), VirtualAddress::new(USER_START)),
        FaultOutcome::Fatal(FaultRejection::Unmapped)
    );
}

#[test]
fn out_of_memory_rejects_the_fault() {
    let mm = boot();
    let (space, cpu) = running(&mm);
    let base = mm.allocate(&space, PAGE, VmFlags::user_data(), None).unwrap();
    let hoarded: Vec<PhysicalPage<Size4K>> = std::iter::from_fn(|| mm.frames().alloc_4k()).collect();

    assert_eq!(
        mm.handle_page_fault(&cpu, &trap(read(), true), base),
        FaultOutcome::Terminate(FaultRejection::OutOfMemory)
    );
    assert!(mm.translate(&space, base).is_none());

    for f in hoarded {
        mm.frames().release(f).unwrap();
    }
    assert_eq!(
        mm.handle_page_fault(&cpu, &trap(read(), true), base),
        FaultOutcome::Resolved
    );
}

#[test]
fn freeing_an_area_returns_its_pages() {
    let mm = boot();
    let (space, cpu) = running(&mm);
    let base = mm.allocate(&space, 2 * PAGE, VmFlags::user_data(), None).unwrap();
    mm.handle_page_fault(&cpu, &trap(write(), true), base);
    let frame = PhysicalPage::<Size4K>::containing(mm.translate(&space, base).unwrap().pa);
    assert!(mm.frames().is_allocated(frame));

    mm.free(&space, base).unwrap();
    assert!(mm.translate(&space, base).is_none());
    assert!(!mm.frames().is_allocated(frame));
    assert!(mm.mmu().was_invalidated(base));
    assert_eq!(
        mm.handle_page_fault(&cpu, &trap(read(), true), base),
        FaultOutcome::Terminate(FaultRejection::Unmapped)
    );
}

#[test]
fn racing_faults_on_one_page_map_it_once() {
    let mm = boot();
    let space = mm.create_address_space().unwrap();
    let base = mm.allocate(&space, PAGE, VmFlags::user_data(), None).unwrap();
    let before = mm.frames().free_frames();

    std::thread::scope(|s| {
        for _ in 0..4 {
            let (mm, space) = (&mm, &space);
            s.spawn(move || {
                let mut cpu = ExecutionUnit::new();
                mm.switch(&mut cpu, space.clone());
                assert_eq!(
                    mm.handle_page_fault(&cpu, &trap(write(), true), base),
                    FaultOutcome::Resolved
                );
            });
        }
    });

    assert_eq!(mm.frames().free_frames(), before - 4);
    assert!(mm.translate(&space, base).is_some());
}
