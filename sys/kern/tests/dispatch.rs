// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end tests of the syscall boundary, driven through simulated
//! register files at both process widths.

mod common;

use abi::{
    CapPerms, CapabilityMeta, CapabilityPointerDescriptor, DriverNum,
    ErrorCode, ProcessWord, Sysnum, SyscallReturn,
};
use grant_kern::arch::sim::SavedState;
use grant_kern::config::UPCALL_QUEUE_LEN;
use grant_kern::err::GrantError;
use grant_kern::grant::Grant;
use grant_kern::kernel::{Kernel, Trace};
use grant_kern::process::ProcessMemory;
use grant_kern::syscalls::Outcome;

use common::*;

const T1: (u64, u64) = (0x2000_0101, 0x11);
const T2: (u64, u64) = (0x2000_0201, 0x22);

fn check_command_routing<W: ProcessWord>() {
    let (ram, flash) = (ram(RAM_LEN), flash());
    let echo = Echo::new();
    let mut k = Kernel::new();
    k.register_driver(ECHO, &echo).unwrap();
    let p = k.create_process(memory(&ram, &flash)).unwrap();

    let ret = call::<W>(&k, p, Sysnum::Command, [4, cmd::EXISTS as u64, 0, 0]);
    assert_eq!(ret, SyscallReturn::Success);

    let ret = call::<W>(&k, p, Sysnum::Command, [9, 0, 0, 0]);
    assert_eq!(ret, SyscallReturn::Failure(ErrorCode::NoDevice));

    let ret = call::<W>(&k, p, Sysnum::Command, [4, 77, 0, 0]);
    assert_eq!(ret, SyscallReturn::Failure(ErrorCode::NoSupport));

    // Nobody touched the echo grant: command 0 doesn't enter it.
    assert!(!k.process(p).unwrap().has_grant(ECHO));
}

#[test]
fn command_routing_32() {
    check_command_routing::<u32>();
}

#[test]
fn command_routing_64() {
    check_command_routing::<u64>();
}

fn check_resubscribe<W: ProcessWord>() {
    let (ram, flash) = (ram(RAM_LEN), flash());
    let echo = Echo::new();
    let mut k = Kernel::new();
    k.register_driver(ECHO, &echo).unwrap();
    let p = k.create_process(memory(&ram, &flash)).unwrap();

    let ret = call::<W>(&k, p, Sysnum::Subscribe, [4, 1, T1.0, T1.1]);
    assert_eq!(ret, SyscallReturn::SuccessPair(0, 0));

    // An upcall fired for T1 but not yet delivered...
    let ret = call::<W>(&k, p, Sysnum::Command, [4, cmd::FIRE as u64, 1, 5]);
    assert_eq!(ret, SyscallReturn::Success);
    assert_eq!(k.process(p).unwrap().pending_upcalls(), 1);

    // ...goes away when T2 replaces it.
    let ret = call::<W>(&k, p, Sysnum::Subscribe, [4, 1, T2.0, T2.1]);
    assert_eq!(
        ret,
        SyscallReturn::SuccessPair(T1.0 as usize, T1.1 as usize)
    );
    assert_eq!(k.process(p).unwrap().pending_upcalls(), 0);

    let ret = call::<W>(&k, p, Sysnum::Command, [4, cmd::FIRE as u64, 1, 6]);
    assert_eq!(ret, SyscallReturn::Success);

    let (mut s, outcome) = syscall::<W>(&k, p, Sysnum::Yield, [0; 4]);
    assert_eq!(outcome, Outcome::Yielded { delivered: true });
    assert_eq!(s.regs()[0], word::<W>(1));
    let frame = s.take_upcall().unwrap();
    assert_eq!(frame.fn_ptr, word::<W>(T2.0));
    assert_eq!(frame.appdata, word::<W>(T2.1));
    assert_eq!(frame.args, [6, 2, 0].map(word::<W>));

    // Exactly once.
    let (mut s, outcome) = syscall::<W>(&k, p, Sysnum::Yield, [0; 4]);
    assert_eq!(outcome, Outcome::Yielded { delivered: false });
    assert_eq!(s.regs()[0], word::<W>(0));
    assert!(s.take_upcall().is_none());
}

#[test]
fn resubscribe_delivers_only_to_the_new_target_32() {
    check_resubscribe::<u32>();
}

#[test]
fn resubscribe_delivers_only_to_the_new_target_64() {
    check_resubscribe::<u64>();
}

#[test]
fn firing_an_empty_slot_does_nothing() {
    let (ram, flash) = (ram(RAM_LEN), flash());
    let echo = Echo::new();
    let mut k = Kernel::new();
    k.register_driver(ECHO, &echo).unwrap();
    let p = k.create_process(memory(&ram, &flash)).unwrap();

    let ret = call::<u32>(&k, p, Sysnum::Command, [4, cmd::FIRE as u64, 0, 1]);
    assert_eq!(ret, SyscallReturn::Success);
    let process = k.process(p).unwrap();
    assert_eq!(process.pending_upcalls(), 0);
    assert_eq!(process.dropped_upcalls(), 0);

    // Subscribing and then withdrawing leaves the slot empty again.
    call::<u32>(&k, p, Sysnum::Subscribe, [4, 0, T1.0, T1.1]);
    let ret = call::<u32>(&k, p, Sysnum::Subscribe, [4, 0, 0, 0]);
    assert_eq!(
        ret,
        SyscallReturn::SuccessPair(T1.0 as usize, T1.1 as usize)
    );
    call::<u32>(&k, p, Sysnum::Command, [4, cmd::FIRE as u64, 0, 1]);
    assert_eq!(k.process(p).unwrap().pending_upcalls(), 0);

    // The kernel side of firing is just as quiet, even for processes and
    // drivers it has never heard of.
    assert_eq!(k.fire(ECHO, p, abi::SubscribeNum(0), [0; 3]), Ok(()));
    let unknown = DriverNum(99);
    assert_eq!(k.fire(unknown, p, abi::SubscribeNum(0), [0; 3]), Ok(()));
}

#[test]
fn subscribe_checks_slot_and_driver() {
    let (ram, flash) = (ram(RAM_LEN), flash());
    let echo = Echo::new();
    let mut k = Kernel::new();
    k.register_driver(ECHO, &echo).unwrap();
    let p = k.create_process(memory(&ram, &flash)).unwrap();

    let ret = call::<u32>(&k, p, Sysnum::Subscribe, [4, 2, T1.0, T1.1]);
    assert_eq!(ret, SyscallReturn::Failure(ErrorCode::NoSupport));

    let ret = call::<u32>(&k, p, Sysnum::Subscribe, [5, 0, T1.0, T1.1]);
    assert_eq!(ret, SyscallReturn::Failure(ErrorCode::NoDevice));

    // A subscribe number too wide to be one at all.
    let ret = call::<u64>(&k, p, Sysnum::Subscribe, [4, 1 << 40, T1.0, 0]);
    assert_eq!(ret, SyscallReturn::Failure(ErrorCode::NoSupport));
}

#[test]
fn allow_readonly_bounds() {
    let (ram, flash) = (ram(RAM_LEN), flash());
    let echo = Echo::new();
    let mut k = Kernel::new();
    k.register_driver(ECHO, &echo).unwrap();
    let p = k.create_process(memory(&ram, &flash)).unwrap();

    let ret = call::<u32>(&k, p, Sysnum::AllowReadOnly, [4, 0, 0x2000, 16]);
    assert_eq!(
        ret,
        SyscallReturn::SuccessDescriptor(CapabilityPointerDescriptor::null())
    );

    let ret = call::<u32>(&k, p, Sysnum::AllowReadOnly, [4, 0, 0x2000, 0x2000]);
    assert_eq!(ret, SyscallReturn::Failure(ErrorCode::Invalid));

    // The refused allow didn't disturb the slot.
    let ret = call::<u32>(&k, p, Sysnum::AllowReadOnly, [4, 0, 0x2100, 8]);
    assert_eq!(
        ret,
        SyscallReturn::SuccessDescriptor(CapabilityPointerDescriptor::new(
            0x2000, 16
        ))
    );

    // No such slot.
    let ret = call::<u32>(&k, p, Sysnum::AllowReadOnly, [4, 1, 0x2000, 16]);
    assert_eq!(ret, SyscallReturn::Failure(ErrorCode::NoSupport));

    // Wraps the 32-bit address space.
    let ret =
        call::<u32>(&k, p, Sysnum::AllowReadOnly, [4, 0, 0xFFFF_FFF0, 0x20]);
    assert_eq!(ret, SyscallReturn::Failure(ErrorCode::Invalid));
}

#[test]
fn invalid_driver_is_refused_before_validation() {
    let (ram, flash) = (ram(RAM_LEN), flash());
    let echo = Echo::new();
    let mut k = Kernel::new();
    k.register_driver(ECHO, &echo).unwrap();
    let p = k.create_process(memory(&ram, &flash)).unwrap();

    let ret = call::<u32>(&k, p, Sysnum::AllowReadOnly, [9, 0, 0, 0x10]);
    assert_eq!(ret, SyscallReturn::Failure(ErrorCode::NoDevice));
}

#[test]
fn grant_memory_is_not_shareable() {
    let (ram, flash) = (ram(RAM_LEN), flash());
    let echo = Echo::new();
    let mut k = Kernel::new();
    k.register_driver(ECHO, &echo).unwrap();
    let p = k.create_process(memory(&ram, &flash)).unwrap();

    // Allocate the grant, then try to share it.
    call::<u32>(&k, p, Sysnum::Subscribe, [4, 0, T1.0, T1.1]);
    let kbrk = k.process(p).unwrap().kernel_break() as u64;
    assert!(kbrk < (RAM_START + RAM_LEN) as u64);

    for class in [Sysnum::AllowReadOnly, Sysnum::AllowReadWrite] {
        let ret = call::<u32>(&k, p, class, [4, 0, kbrk, 8]);
        assert_eq!(ret, SyscallReturn::Failure(ErrorCode::Invalid));
    }
    // Nor is the free space between the breaks.
    let ret = call::<u32>(&k, p, Sysnum::AllowReadWrite, [4, 0, 0x27F0, 0x20]);
    assert_eq!(ret, SyscallReturn::Failure(ErrorCode::Invalid));
}

#[test]
fn flash_is_readable_but_not_writable() {
    let (ram, flash) = (ram(RAM_LEN), flash());
    let echo = Echo::new();
    let mut k = Kernel::new();
    k.register_driver(ECHO, &echo).unwrap();
    let p = k.create_process(memory(&ram, &flash)).unwrap();

    let base = FLASH_START as u64 + 4;
    let ret = call::<u32>(&k, p, Sysnum::AllowReadWrite, [4, 0, base, 4]);
    assert_eq!(ret, SyscallReturn::Failure(ErrorCode::Denied));

    let ret = call::<u32>(&k, p, Sysnum::AllowReadOnly, [4, 0, base, 4]);
    assert!(ret.is_success());
    let ret = call::<u32>(&k, p, Sysnum::Command, [4, cmd::SUM as u64, 0, 0]);
    assert_eq!(ret, SyscallReturn::SuccessValue(4 + 5 + 6 + 7));
}

#[test]
fn capability_permissions() {
    let (ram, flash) = (ram(RAM_LEN), flash());
    let echo = Echo::new();
    let mut k = Kernel::new();
    k.register_driver(ECHO, &echo).unwrap();
    let p = k.create_process(memory(&ram, &flash)).unwrap();

    let allow = |class, cap: CapabilityMeta| {
        let mut s = SavedState::<u64>::syscall(class, [4, 0, 0x2000, 16])
            .with_capability(2, cap);
        k.handle_syscall(p, &mut s);
        s.decode_return().unwrap()
    };

    let readonly = CapabilityMeta::new(0x2000, 0x100, CapPerms::DEFAULT_R);
    assert_eq!(
        allow(Sysnum::AllowReadWrite, readonly),
        SyscallReturn::Failure(ErrorCode::Denied)
    );
    assert!(allow(Sysnum::AllowReadOnly, readonly).is_success());

    let untagged = CapabilityMeta {
        tag: false,
        ..CapabilityMeta::new(0x2000, 0x100, CapPerms::DEFAULT_RW)
    };
    assert_eq!(
        allow(Sysnum::AllowReadWrite, untagged),
        SyscallReturn::Failure(ErrorCode::Invalid)
    );

    let narrow = CapabilityMeta::new(0x2000, 8, CapPerms::DEFAULT_RW);
    assert_eq!(
        allow(Sysnum::AllowReadWrite, narrow),
        SyscallReturn::Failure(ErrorCode::Invalid)
    );

    let rw = CapabilityMeta::new(0x1F00, 0x200, CapPerms::DEFAULT_RW);
    assert!(allow(Sysnum::AllowReadWrite, rw).is_success());

    // Swapping it out hands the capability back.
    let ret = allow(Sysnum::AllowReadWrite, rw);
    assert_eq!(
        ret,
        SyscallReturn::SuccessDescriptor(
            CapabilityPointerDescriptor::new(0x2000, 16).with_capability(rw)
        )
    );
}

#[test]
fn shared_buffers_are_revalidated_on_use() {
    let (ram, flash) = (ram(RAM_LEN), flash());
    let echo = Echo::new();
    let mut k = Kernel::new();
    k.register_driver(ECHO, &echo).unwrap();
    let p = k.create_process(memory(&ram, &flash)).unwrap();

    let ret =
        call::<u32>(&k, p, Sysnum::AllowReadWrite, [4, 0, 0x2700, 0x40]);
    assert!(ret.is_success());
    let fill = [4, cmd::FILL as u64, 0xA5, 0];
    let ret = call::<u32>(&k, p, Sysnum::Command, fill);
    assert_eq!(ret, SyscallReturn::SuccessValue(0x40));
    let off = 0x2700 - RAM_START;
    assert!(ram[off..off + 0x40].iter().all(|c| c.get() == 0xA5));
    assert_eq!(ram[off + 0x40].get(), 0);

    // The process gives the memory back; the allow no longer holds.
    k.set_app_break(p, 0x2000).unwrap();
    let ret = call::<u32>(&k, p, Sysnum::Command, fill);
    assert_eq!(ret, SyscallReturn::Failure(ErrorCode::Invalid));
    assert!(ram[off..off + 0x40].iter().all(|c| c.get() == 0xA5));
}

#[test]
fn the_break_cannot_reach_grants() {
    let (ram, flash) = (ram(RAM_LEN), flash());
    let echo = Echo::new();
    let mut k = Kernel::new();
    k.register_driver(ECHO, &echo).unwrap();
    let p = k.create_process(memory(&ram, &flash)).unwrap();
    call::<u32>(&k, p, Sysnum::Subscribe, [4, 0, T1.0, T1.1]);

    let kbrk = k.process(p).unwrap().kernel_break();
    assert!(k.set_app_break(p, kbrk).is_ok());
    assert!(k.set_app_break(p, kbrk + 1).is_err());
    assert!(k.set_app_break(p, RAM_START - 1).is_err());
}

#[test]
fn restarted_processes_get_fresh_grants() {
    let (ram, flash) = (ram(RAM_LEN), flash());
    let nine: Grant<Counter, 0, 0, 0> = Grant::new(DriverNum(9));
    let mut k = Kernel::new();
    let old = k.create_process(memory(&ram, &flash)).unwrap();

    nine.enter(&k, old, |c, _| c.fired = 5).unwrap();
    let used = k.process(old).unwrap().grant_memory_used();
    assert!(used > 0);

    let new = k.restart(old).unwrap();
    assert_eq!(
        nine.enter(&k, old, |_, _| ()),
        Err(GrantError::NoSuchGrant)
    );
    assert_eq!(k.process(new).unwrap().grant_memory_used(), 0);
    assert_eq!(nine.enter(&k, new, |c, _| c.fired), Ok(0));
    assert_eq!(k.process(new).unwrap().grant_memory_used(), used);

    // Syscalls from the old incarnation are refused too.
    let ret = call::<u32>(&k, old, Sysnum::Command, [4, 0, 0, 0]);
    assert_eq!(ret, SyscallReturn::Failure(ErrorCode::Fail));
}

#[test]
fn terminated_processes_lose_their_grants() {
    let (ram, flash) = (ram(RAM_LEN), flash());
    let echo = Echo::new();
    let mut k = Kernel::new();
    k.register_driver(ECHO, &echo).unwrap();
    let p = k.create_process(memory(&ram, &flash)).unwrap();
    echo.grant.enter(&k, p, |c, _| c.fired = 1).unwrap();

    let mem = k.terminate(p).unwrap();
    assert_eq!(
        echo.grant.enter(&k, p, |_, _| ()),
        Err(GrantError::NoSuchGrant)
    );
    assert_eq!(echo.grant.each(&k, |_, _, _| ()), 0);

    // The memory can go straight back into service.
    let q = k.create_process(mem).unwrap();
    assert_eq!(echo.grant.enter(&k, q, |c, _| c.fired), Ok(0));
}

#[test]
fn reentry_is_refused_and_harmless() {
    let (ram, flash) = (ram(RAM_LEN), flash());
    let echo = Echo::new();
    let other: Grant<Counter, 0, 0, 0> = Grant::new(DriverNum(9));
    let mut k = Kernel::new();
    k.register_driver(ECHO, &echo).unwrap();
    let p = k.create_process(memory(&ram, &flash)).unwrap();

    let r = echo.grant.enter(&k, p, |c, _| {
        c.fired = 7;
        let inner = echo.grant.enter(&k, p, |c, _| c.fired = 99);
        assert_eq!(inner, Err(GrantError::AlreadyEntered));
        // A different grant of the same process is fine.
        other.enter(&k, p, |o, _| o.fired = 3).unwrap();
        // So is the kernel's own view of it, from a syscall.
        let ret = call::<u32>(&k, p, Sysnum::Subscribe, [4, 0, T1.0, T1.1]);
        assert_eq!(ret, SyscallReturn::Failure(ErrorCode::Busy));
        c.fired
    });
    assert_eq!(r, Ok(7));
    assert_eq!(echo.grant.enter(&k, p, |c, _| c.fired), Ok(7));
    assert_eq!(other.enter(&k, p, |c, _| c.fired), Ok(3));

    // And the guard let go.
    let ret = call::<u32>(&k, p, Sysnum::Command, [4, cmd::FIRED as u64, 0, 0]);
    assert_eq!(ret, SyscallReturn::SuccessValue(7));
}

#[test]
fn grants_come_from_the_top_in_first_use_order() {
    let (ram, flash) = (ram(RAM_LEN), flash());
    let echo = Echo::new();
    let nine: Grant<Counter, 0, 0, 0> = Grant::new(DriverNum(9));
    let mut k = Kernel::new();
    k.register_driver(ECHO, &echo).unwrap();
    let p = k.create_process(memory(&ram, &flash)).unwrap();
    let top = RAM_START + RAM_LEN;
    // The process scribbles over everything it will ever be able to see.
    for c in &ram {
        c.set(0xFF);
    }

    nine.enter(&k, p, |_, _| ()).unwrap();
    let after_nine = k.process(p).unwrap().kernel_break();
    assert!(after_nine < top);
    call::<u32>(&k, p, Sysnum::Subscribe, [4, 0, T1.0, T1.1]);
    let after_echo = k.process(p).unwrap().kernel_break();
    assert!(after_echo < after_nine);
    assert_eq!(k.process(p).unwrap().grant_count(), 2);

    // Grant data starts out zeroed regardless.
    assert_eq!(nine.enter(&k, p, |c, _| c.total), Ok(0));
    assert_eq!(echo.grant.enter(&k, p, |c, _| c.total), Ok(0));
}

#[test]
fn one_region_per_driver_and_process() {
    let (ram, flash) = (ram(RAM_LEN), flash());
    let echo = Echo::new();
    let mut k = Kernel::new();
    k.register_driver(ECHO, &echo).unwrap();
    let p = k.create_process(memory(&ram, &flash)).unwrap();

    let shape = echo.grant.enter(&k, p, |_, kd| {
        (kd.num_upcalls(), kd.num_allow_ro(), kd.num_allow_rw())
    });
    assert_eq!(shape, Ok((2, 1, 1)));
    let process = k.process(p).unwrap();
    assert_eq!(process.grant_count(), 1);
    let kbrk = process.kernel_break();
    let used = process.grant_memory_used();

    // Every way in reuses what the first entry allocated.
    for (class, args) in [
        (Sysnum::Subscribe, [4, 0, T1.0, T1.1]),
        (Sysnum::AllowReadOnly, [4, 0, 0x2000, 16]),
        (Sysnum::AllowReadWrite, [4, 0, 0x2100, 16]),
        (Sysnum::Command, [4, cmd::FIRE as u64, 0, 0]),
    ] {
        assert!(call::<u32>(&k, p, class, args).is_success());
    }
    echo.grant.enter(&k, p, |c, _| c.fired += 1).unwrap();

    let process = k.process(p).unwrap();
    assert_eq!(process.grant_count(), 1);
    assert_eq!(process.kernel_break(), kbrk);
    assert_eq!(process.grant_memory_used(), used);
    // Both increments landed in the same place.
    assert_eq!(echo.grant.enter(&k, p, |c, _| c.fired), Ok(2));
}

#[cfg(target_pointer_width = "64")]
#[test]
fn replies_too_wide_for_the_caller_change_nothing() {
    const HIGH: u64 = 0x1_0000_0000;
    let (low, high) = (ram(RAM_LEN), ram(RAM_LEN));
    let echo = Echo::new();
    let mut k = Kernel::new();
    k.register_driver(ECHO, &echo).unwrap();
    let p = k
        .create_process(ProcessMemory::ram_only(&low, RAM_START, APP_BRK))
        .unwrap();
    let q = k
        .create_process(ProcessMemory::ram_only(
            &high,
            HIGH as usize,
            HIGH as usize + 0x800,
        ))
        .unwrap();

    // A target that only a 64-bit view of the process can name, with an
    // upcall queued for it...
    let wide = (HIGH + 0x101, 0x11);
    let ret = call::<u64>(&k, p, Sysnum::Subscribe, [4, 1, wide.0, wide.1]);
    assert_eq!(ret, SyscallReturn::SuccessPair(0, 0));
    let ret = call::<u32>(&k, p, Sysnum::Command, [4, cmd::FIRE as u64, 1, 0]);
    assert_eq!(ret, SyscallReturn::Success);

    // ...can't be handed back through 32-bit registers. Replacing it from
    // there fails and leaves both the target and the queue alone.
    let ret = call::<u32>(&k, p, Sysnum::Subscribe, [4, 1, T1.0, T1.1]);
    assert_eq!(ret, SyscallReturn::Failure(ErrorCode::Size));
    assert_eq!(k.process(p).unwrap().pending_upcalls(), 1);
    let ret = call::<u64>(&k, p, Sysnum::Subscribe, [4, 1, T1.0, T1.1]);
    assert_eq!(
        ret,
        SyscallReturn::SuccessPair(wide.0 as usize, wide.1 as usize)
    );

    // Likewise a buffer shared from above 4 GiB.
    for c in &high[0x10..0x20] {
        c.set(1);
    }
    let shared = [4, 0, HIGH + 0x10, 16];
    let ret = call::<u64>(&k, q, Sysnum::AllowReadOnly, shared);
    assert!(ret.is_success());
    let ret = call::<u32>(&k, q, Sysnum::AllowReadOnly, [4, 0, 0, 0]);
    assert_eq!(ret, SyscallReturn::Failure(ErrorCode::Size));
    let ret = call::<u32>(&k, q, Sysnum::Command, [4, cmd::SUM as u64, 0, 0]);
    assert_eq!(ret, SyscallReturn::SuccessValue(16));
    let ret = call::<u64>(&k, q, Sysnum::AllowReadOnly, [4, 0, 0, 0]);
    assert_eq!(
        ret,
        SyscallReturn::SuccessDescriptor(CapabilityPointerDescriptor::new(
            (HIGH + 0x10) as usize,
            16
        ))
    );
}

#[test]
fn out_of_grant_memory() {
    let (ram, flash) = (ram(0x100), flash());
    let echo = Echo::new();
    let mut k = Kernel::new();
    k.register_driver(ECHO, &echo).unwrap();
    let mem = ProcessMemory::ram_only(&ram, RAM_START, RAM_START + 0xF0)
        .with_flash(&flash, FLASH_START);
    let p = k.create_process(mem).unwrap();

    let ret = call::<u32>(&k, p, Sysnum::Subscribe, [4, 0, T1.0, T1.1]);
    assert_eq!(ret, SyscallReturn::Failure(ErrorCode::NoMem));
    assert_eq!(k.process(p).unwrap().grant_count(), 0);
    let refused = Trace::GrantRefused {
        process: p,
        driver: ECHO,
        error: GrantError::OutOfGrantMemory,
    };
    if cfg!(not(feature = "no-trace")) {
        assert!(k.trace().iter().any(|e| e.payload == refused));
    }
}

#[test]
fn full_queue_drops_and_counts() {
    let (ram, flash) = (ram(RAM_LEN), flash());
    let echo = Echo::new();
    let mut k = Kernel::new();
    k.register_driver(ECHO, &echo).unwrap();
    let p = k.create_process(memory(&ram, &flash)).unwrap();
    call::<u32>(&k, p, Sysnum::Subscribe, [4, 0, T1.0, T1.1]);

    let fire = [4, cmd::FIRE as u64, 0, 0];
    for _ in 0..UPCALL_QUEUE_LEN {
        assert!(call::<u32>(&k, p, Sysnum::Command, fire).is_success());
    }
    let ret = call::<u32>(&k, p, Sysnum::Command, fire);
    assert_eq!(ret, SyscallReturn::Failure(ErrorCode::NoMem));

    let process = k.process(p).unwrap();
    assert_eq!(process.pending_upcalls(), UPCALL_QUEUE_LEN);
    assert_eq!(process.dropped_upcalls(), 1);

    // Queue order is firing order.
    for n in 1..=UPCALL_QUEUE_LEN {
        let (mut s, _) = syscall::<u32>(&k, p, Sysnum::Yield, [0; 4]);
        assert_eq!(s.take_upcall().unwrap().args[1], n as u32);
    }
}

#[cfg(target_pointer_width = "64")]
#[test]
fn upcalls_too_wide_for_the_process_are_dropped() {
    let (ram, flash) = (ram(RAM_LEN), flash());
    let echo = Echo::new();
    let mut k = Kernel::new();
    k.register_driver(ECHO, &echo).unwrap();
    let p = k.create_process(memory(&ram, &flash)).unwrap();
    call::<u32>(&k, p, Sysnum::Subscribe, [4, 0, T1.0, T1.1]);

    k.fire(ECHO, p, abi::SubscribeNum(0), [1 << 40, 0, 0]).unwrap();
    k.fire(ECHO, p, abi::SubscribeNum(0), [1, 0, 0]).unwrap();

    // The first is skipped, the second delivered.
    let (mut s, outcome) = syscall::<u32>(&k, p, Sysnum::Yield, [0; 4]);
    assert_eq!(outcome, Outcome::Yielded { delivered: true });
    assert_eq!(s.take_upcall().unwrap().args, [1, 0, 0]);
    assert_eq!(k.process(p).unwrap().dropped_upcalls(), 1);
}

#[test]
fn each_visits_allocated_unentered_grants() {
    let (ram_a, ram_b, ram_c) = (ram(RAM_LEN), ram(RAM_LEN), ram(RAM_LEN));
    let flash = flash();
    let echo = Echo::new();
    let mut k = Kernel::new();
    k.register_driver(ECHO, &echo).unwrap();
    let a = k.create_process(memory(&ram_a, &flash)).unwrap();
    let b = k
        .create_process(ProcessMemory::ram_only(&ram_b, 0x4000, 0x4800))
        .unwrap();
    let c = k
        .create_process(ProcessMemory::ram_only(&ram_c, 0x8_0000, 0x8_0800))
        .unwrap();

    echo.grant.enter(&k, a, |_, _| ()).unwrap();
    echo.grant.enter(&k, b, |_, _| ()).unwrap();

    let mut seen = Vec::new();
    let n = echo.grant.each(&k, |id, cnt, _| {
        cnt.fired += 10;
        seen.push(id);
    });
    assert_eq!(n, 2);
    assert_eq!(seen, [a, b]);
    // Never allocates.
    assert!(!k.process(c).unwrap().has_grant(ECHO));

    let n = echo.grant.enter(&k, a, |_, _| echo.grant.each(&k, |_, _, _| ()));
    assert_eq!(n, Ok(1));
    assert_eq!(echo.grant.enter(&k, b, |cnt, _| cnt.fired), Ok(10));
}

#[test]
fn malformed_syscalls_are_answered() {
    let (ram, flash) = (ram(RAM_LEN), flash());
    let echo = Echo::new();
    let mut k = Kernel::new();
    k.register_driver(ECHO, &echo).unwrap();
    let p = k.create_process(memory(&ram, &flash)).unwrap();

    let mut s = SavedState::<u32>::raw(42, [1, 2, 3, 4]);
    k.handle_syscall(p, &mut s);
    assert_eq!(
        s.decode_return(),
        Some(SyscallReturn::Failure(ErrorCode::NoSupport))
    );

    // Only the no-wait flavour of yield exists.
    let (s, outcome) = syscall::<u32>(&k, p, Sysnum::Yield, [1, 0, 0, 0]);
    assert_eq!(
        outcome,
        Outcome::Returned(SyscallReturn::Failure(ErrorCode::NoSupport))
    );
    assert_eq!(
        s.decode_return(),
        Some(SyscallReturn::Failure(ErrorCode::NoSupport))
    );

    // Command arguments that don't fit a 32-bit kernel are only possible
    // from a 64-bit process on one.
    if usize::BITS == 32 {
        let ret = call::<u64>(&k, p, Sysnum::Command, [4, 0, 1 << 40, 0]);
        assert_eq!(ret, SyscallReturn::Failure(ErrorCode::Invalid));
    }

    if cfg!(not(feature = "no-trace")) {
        assert_eq!(
            k.trace().last().map(|e| e.payload),
            Some(Trace::Returned {
                process: p,
                variant: abi::ReturnVariant::Failure,
            })
        );
    }
}
