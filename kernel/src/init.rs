//! Kernel entry point: brings up paging, the heap, the GDT/TSS/IDT, the
//! remapped 8259 PIC and PIT, and the syscall MSRs, then loads the initrd's
//! `init` binary as the first user process and falls into the idle loop.
//!
//! Every interrupt that can arrive after this point - the timer tick, page
//! faults, and the PIC's remapped hardware IRQs - enters through a naked
//! trampoline pair built the same way [`libkernel::syscall::syscall_entry`] and
//! [`libkernel::syscall::syscall_trampoline`] are: a tiny `asm!` stub saves the
//! general-purpose registers into a [`RegisterFrame`] on the interrupt stack
//! and calls into ordinary Rust, which always finishes by asking the
//! scheduler what to run next.

#![no_std]
#![no_main]
#![feature(abi_x86_interrupt)]
#![feature(allocator_api)]
#![feature(alloc_error_handler)]
#![feature(naked_functions)]
#![allow(static_mut_refs)]

extern crate alloc;

use amd64::interrupts::{IntTrapGate, InterruptDesciptorTable, InterruptStackFrame, PfErrCode, Ssdt};
use amd64::registers::cr2_read;
use amd64::segmentation::{
    cs_write, fs_write, gs_write, lgdt, ltr, CodeSegDesc, DataSegDesc, SegSel, SysSegDesc, TaskStateSeg,
};
use amd64::{hlt_loop, ports, PrivLvl};

use perception_abi::{Message, ProcessFlags};

use libkernel::core_dump;
use libkernel::ipc::{message, shared_memory};
use libkernel::mm::paging::{self, PhysAddr};
use libkernel::state::{self, Kernel};
use libkernel::task::lifecycle;
use libkernel::task::process::Pid;
use libkernel::task::scheduler::Scheduler;
use libkernel::task::thread::RegisterFrame;
use libkernel::{boot, bootboot, cfg, heap, mm, println, syscall};

/// Selector of the kernel code segment, GDT index 1.
const KERNEL_CS: SegSel = SegSel::new_gdt(PrivLvl::Ring0, 1);
/// Selector of the kernel data/stack segment, GDT index 2. Also the STAR-MSR
/// derived `sysret` kernel stack selector (`KERNEL_CS + 8`).
const KERNEL_SS: SegSel = SegSel::new_gdt(PrivLvl::Ring0, 2);
/// Selector of the user data/stack segment, GDT index 3. `sysret` derives
/// this and `USER_CS` from `STAR`'s upper half, so the ordering here is load
/// bearing - see [`libkernel::syscall::install`].
const USER_SS: SegSel = SegSel::new_gdt(PrivLvl::Ring3, 3);
/// Selector of the user code segment, GDT index 4.
const USER_CS: SegSel = SegSel::new_gdt(PrivLvl::Ring3, 4);
/// Selector of the TSS descriptor, GDT indices 5-6 (a system descriptor is
/// two quadwords wide).
const TSS_SEL: SegSel = SegSel::new_gdt(PrivLvl::Ring0, 5);

const PIC1_CMD: u16 = 0x20;
const PIC1_DATA: u16 = 0x21;
const PIC2_CMD: u16 = 0xA0;
const PIC2_DATA: u16 = 0xA1;
/// Vector IRQ0 is remapped to; IRQ0-7 land on `PIC_VECTOR_BASE..+8`, IRQ8-15
/// on `PIC_VECTOR_BASE+8..+16`. Chosen past the CPU's 32 reserved exception
/// vectors.
const PIC_VECTOR_BASE: u8 = 32;

/// PIT channel 0 reload value for a roughly 1kHz tick: `1_193_182 / 1000`.
const PIT_DIVISOR: u16 = 1193;
/// Microseconds [`timer_tick_trampoline`] advances the kernel clock by on
/// every tick, matching [`PIT_DIVISOR`].
const TICK_MICROS: u64 = 1000;

#[repr(align(16))]
struct IstStack([u8; 16 * 1024]);

static mut TIMER_IST: IstStack = IstStack([0; 16 * 1024]);
static mut PAGE_FAULT_IST: IstStack = IstStack([0; 16 * 1024]);
static mut DOUBLE_FAULT_IST: IstStack = IstStack([0; 16 * 1024]);
static mut IDLE_STACK: IstStack = IstStack([0; 16 * 1024]);

static mut TSS: TaskStateSeg = TaskStateSeg::new([core::ptr::null_mut(); 3], [core::ptr::null_mut(); 7]);
static mut IDT: InterruptDesciptorTable = InterruptDesciptorTable::empty();
static mut GDT: [u64; 7] = [0; 7];

#[no_mangle]
pub extern "C" fn _start() -> ! {
    unsafe { boot::bring_up() };

    heap::init();
    cfg::init_boot_cfg(unsafe { bootboot::env_cfg_as_str() });
    message::init();

    unsafe {
        build_gdt_and_tss();
        build_idt();
    }
    remap_pic();
    program_pit();
    syscall::install(syscall_entry_addr());

    let idle_stack_top = unsafe { IDLE_STACK.0.as_mut_ptr().add(IDLE_STACK.0.len()) } as u64;
    state::lock().scheduler.init(paging::kernel_pml4(), idle_loop as u64, idle_stack_top);

    spawn_init_process();

    unsafe { amd64::interrupts::sti() };
    hlt_loop();
}

/// `syscall::syscall_entry` is private to its module; this indirection keeps
/// `init` from needing to know its exact path beyond what `syscall::install`
/// already expects (a bare function pointer cast to `u64`).
fn syscall_entry_addr() -> u64 {
    libkernel::syscall::syscall_entry as u64
}

/// Builds the GDT (null, kernel code/data, user data/code, TSS descriptor)
/// and the TSS (IST stacks for the timer tick, page fault and double
/// fault, plus the ring-0 stack the CPU loads on any privilege-raising
/// interrupt without its own IST slot), loads them, and reloads every
/// segment register to match.
///
/// # Safety
/// Must run once, before interrupts are enabled and before any IST-using
/// gate is live in the IDT.
unsafe fn build_gdt_and_tss() {
    let idle_stack_top = IDLE_STACK.0.as_mut_ptr().add(IDLE_STACK.0.len());
    let timer_ist_top = TIMER_IST.0.as_mut_ptr().add(TIMER_IST.0.len());
    let page_fault_ist_top = PAGE_FAULT_IST.0.as_mut_ptr().add(PAGE_FAULT_IST.0.len());
    let double_fault_ist_top = DOUBLE_FAULT_IST.0.as_mut_ptr().add(DOUBLE_FAULT_IST.0.len());

    TSS = TaskStateSeg::new(
        [idle_stack_top, core::ptr::null_mut(), core::ptr::null_mut()],
        [
            core::ptr::null_mut(),
            timer_ist_top,
            page_fault_ist_top,
            double_fault_ist_top,
            core::ptr::null_mut(),
            core::ptr::null_mut(),
            core::ptr::null_mut(),
        ],
    );

    let kernel_code = CodeSegDesc::default() | CodeSegDesc::DPL_RING0;
    let kernel_data = DataSegDesc::default();
    // DataSegDesc has no DPL flags of its own (long mode ignores a data
    // segment's DPL for anything but the stack-switch check on an
    // interrupt), so the ring-3 bits are set directly at their shared bit
    // position with CodeSegDesc::DPL_RING3.
    let user_data = unsafe { DataSegDesc::from_bits_unchecked(DataSegDesc::default().bits() | CodeSegDesc::DPL_RING3.bits()) };
    let user_code = CodeSegDesc::default() | CodeSegDesc::DPL_RING3;

    let tss_desc = SysSegDesc::new(
        core::ptr::addr_of_mut!(TSS) as *mut u8,
        TaskStateSeg::LIMIT,
        Ssdt::AvlTss,
        PrivLvl::Ring0,
        false,
    );
    let tss_bits = tss_desc.to_bits();

    GDT = [
        0,
        kernel_code.bits(),
        kernel_data.bits(),
        user_data.bits(),
        user_code.bits(),
        tss_bits[0],
        tss_bits[1],
    ];

    lgdt(core::ptr::slice_from_raw_parts_mut(GDT.as_mut_ptr(), GDT.len()));
    cs_write(KERNEL_CS);
    reload_data_segments(KERNEL_SS.to_bits());
    fs_write(KERNEL_SS);
    gs_write(KERNEL_SS);
    ltr(TSS_SEL);
}

/// Reloads `ds`, `es` and `ss` to `selector`. `amd64::segmentation` only
/// exposes reloads for `cs` (the far-return trick), `fs` and `gs` (the
/// base-bearing ones); the other three are plain `mov`s.
unsafe fn reload_data_segments(selector: u16) {
    core::arch::asm!(
        "mov ds, {0:x}",
        "mov es, {0:x}",
        "mov ss, {0:x}",
        in(reg) selector,
    );
}

/// Populates every fault vector with a diverging printing handler, wires up
/// the three IST-backed fast paths (timer tick, page fault, double fault)
/// and the remapped PIC's fifteen hardware IRQ vectors, then loads the IDT.
///
/// # Safety
/// Must run after [`build_gdt_and_tss`] (the IST indices it installs refer
/// to the TSS it just built) and before `sti`.
unsafe fn build_idt() {
    macro_rules! gate {
        ($target:expr, $ist:expr) => {
            IntTrapGate::new($target as u64, KERNEL_CS, $ist, Ssdt::InterruptGate, PrivLvl::Ring0)
        };
    }

    IDT.div_by_zero_fault = gate!(div_by_zero_fault, 0);
    IDT.debug = gate!(debug_trap, 0);
    IDT.break_point_trap = gate!(breakpoint_trap, 0);
    IDT.invalid_opcode_fault = gate!(invalid_opcode_fault_entry, 0);
    IDT.device_not_available_fault = gate!(device_not_available_fault, 0);
    IDT.double_fault_abort = gate!(double_fault_abort, 3);
    IDT.invalid_tss_fault = gate!(invalid_tss_fault, 0);
    IDT.segment_not_present_fault = gate!(segment_not_present_fault, 0);
    IDT.stack_fault = gate!(stack_fault, 0);
    IDT.general_protection_fault = gate!(general_protection_fault_entry, 0);
    IDT.page_fault = gate!(page_fault_entry, 2);
    IDT.alignment_check_fault = gate!(alignment_check_fault, 0);

    IDT.interrupts[0] = gate!(timer_tick_entry, 1);
    IDT.interrupts[1] = gate!(irq1_entry, 0);
    IDT.interrupts[2] = gate!(irq2_entry, 0);
    IDT.interrupts[3] = gate!(irq3_entry, 0);
    IDT.interrupts[4] = gate!(irq4_entry, 0);
    IDT.interrupts[5] = gate!(irq5_entry, 0);
    IDT.interrupts[6] = gate!(irq6_entry, 0);
    IDT.interrupts[7] = gate!(irq7_entry, 0);
    IDT.interrupts[8] = gate!(irq8_entry, 0);
    IDT.interrupts[9] = gate!(irq9_entry, 0);
    IDT.interrupts[10] = gate!(irq10_entry, 0);
    IDT.interrupts[11] = gate!(irq11_entry, 0);
    IDT.interrupts[12] = gate!(irq12_entry, 0);
    IDT.interrupts[13] = gate!(irq13_entry, 0);
    IDT.interrupts[14] = gate!(irq14_entry, 0);
    IDT.interrupts[15] = gate!(irq15_entry, 0);

    amd64::interrupts::lidt(core::ptr::addr_of!(IDT));
}

/// Remaps the 8259 PIC pair so IRQ0-7 land on vectors 32-39 and IRQ8-15 on
/// 40-47 (clear of the CPU's reserved exception vectors), then masks every
/// line except IRQ0 (timer) and IRQ1 (keyboard).
fn remap_pic() {
    unsafe {
        let mask1 = ports::in8(PIC1_DATA);
        let mask2 = ports::in8(PIC2_DATA);
        let _ = (mask1, mask2);

        ports::out8(PIC1_CMD, 0x11);
        io_wait();
        ports::out8(PIC2_CMD, 0x11);
        io_wait();
        ports::out8(PIC1_DATA, PIC_VECTOR_BASE);
        io_wait();
        ports::out8(PIC2_DATA, PIC_VECTOR_BASE + 8);
        io_wait();
        ports::out8(PIC1_DATA, 4);
        io_wait();
        ports::out8(PIC2_DATA, 2);
        io_wait();
        ports::out8(PIC1_DATA, 0x01);
        io_wait();
        ports::out8(PIC2_DATA, 0x01);
        io_wait();

        ports::out8(PIC1_DATA, 0b1111_1100);
        ports::out8(PIC2_DATA, 0b1111_1111);
    }
}

fn io_wait() {
    unsafe { ports::out8(0x80, 0) };
}

/// Acknowledges a hardware interrupt so the PIC will raise further ones on
/// the same or lower-priority lines.
fn send_eoi(irq: u8) {
    unsafe {
        if irq >= 8 {
            ports::out8(PIC2_CMD, 0x20);
        }
        ports::out8(PIC1_CMD, 0x20);
    }
}

/// Programs PIT channel 0 for mode 3 (square wave), period [`PIT_DIVISOR`]
/// counts, driving the vector-32 timer interrupt.
fn program_pit() {
    unsafe {
        ports::out8(0x43, 0x36);
        ports::out8(0x40, (PIT_DIVISOR & 0xff) as u8);
        ports::out8(0x40, (PIT_DIVISOR >> 8) as u8);
    }
}

extern "C" fn idle_loop() -> ! {
    loop {
        unsafe { amd64::interrupts::sti_hlt() };
    }
}

/// Fixed virtual address, in every freshly created process, of the one
/// read-only page carrying this boot's [`BootInfo`]. Chosen far above any
/// ordinary small executable's load addresses so it never collides with a
/// `PT_LOAD` segment.
const BOOT_INFO_VA: u64 = 0x0000_7000_0000_0000;

/// What the kernel hands the first process in lieu of a real boot-loader
/// module chain: the physical location of the whole initrd blob, which for
/// this system is both "the first process's own ELF image" (the kernel
/// discards the fact once it has loaded it) and, separately, the ISO-9660
/// filesystem image the storage manager mounts. The first process reads
/// this page at [`BOOT_INFO_VA`] via the `rdi` argument its first thread is
/// started with, which carries that same address.
#[repr(C)]
struct BootInfo {
    initrd_phys_base: u64,
    initrd_size: u64,
}

/// Loads the initrd's `init` binary's `PT_LOAD` segments into a fresh
/// process's address space and starts its first thread at the ELF entry
/// point, with [`BOOT_INFO_VA`] mapped read-only to a page describing the
/// initrd's own physical extent.
fn spawn_init_process() {
    let (initrd, initrd_phys_base, initrd_size) = unsafe {
        let bb = &*bootboot::BOOTBOOT;
        let ptr = paging::phys_to_virt(bb.initrd_ptr);
        (core::slice::from_raw_parts(ptr, bb.initrd_size as usize), bb.initrd_ptr, bb.initrd_size)
    };

    let elf = match elf_rs::Elf::from_bytes(initrd).expect("init.rs: initrd is not a valid ELF file") {
        elf_rs::Elf::Elf64(elf) => elf,
        elf_rs::Elf::Elf32(_) => panic!("init.rs: init binary must be 64 bit"),
    };

    let mut kernel = state::lock();
    let pid = lifecycle::create_process(&mut kernel, b"init", ProcessFlags::LAUNCHER)
        .expect("init.rs: failed to create init process");

    for ph in elf.program_headers() {
        if ph.ph_type() != elf_rs::ProgramType::LOAD {
            continue;
        }

        let va_start = ph.vaddr() & !(paging::PTE_MAPPED_SIZE - 1);
        let va_end = (ph.vaddr() + ph.memsz() + paging::PTE_MAPPED_SIZE - 1) & !(paging::PTE_MAPPED_SIZE - 1);
        let writable = ph.flags() & 0b10 != 0;

        kernel
            .processes
            .get_mut(pid)
            .unwrap()
            .address_space
            .reserve_at(va_start, va_end - va_start)
            .expect("init.rs: init segment overlaps reserved range");

        let (p_offset, p_filesz) = (ph.offset() as usize, ph.filesz() as usize);
        let file_bytes = &elf.as_bytes()[p_offset..p_offset + p_filesz];
        let file_off = (ph.vaddr() - va_start) as usize;

        let mut page = va_start;
        while page < va_end {
            let frame: PhysAddr = mm::frame::acquire().expect("init.rs: out of memory loading init");
            let mut alloc_frame = || mm::frame::acquire().ok();
            unsafe {
                kernel
                    .processes
                    .get(pid)
                    .unwrap()
                    .address_space
                    .page_table
                    .map(page, frame, true, writable, true, false, &mut alloc_frame)
                    .expect("init.rs: failed to map init segment page");
            }

            let dst = unsafe { core::slice::from_raw_parts_mut(paging::phys_to_virt(frame), paging::PTE_MAPPED_SIZE as usize) };
            let page_off_in_seg = (page - va_start) as usize;
            for i in 0..dst.len() {
                let seg_off = page_off_in_seg + i;
                dst[i] = if seg_off >= file_off && seg_off - file_off < file_bytes.len() {
                    file_bytes[seg_off - file_off]
                } else {
                    0
                };
            }

            page += paging::PTE_MAPPED_SIZE;
        }
    }

    kernel
        .processes
        .get_mut(pid)
        .unwrap()
        .address_space
        .reserve_at(BOOT_INFO_VA, paging::PTE_MAPPED_SIZE)
        .expect("init.rs: boot info page collides with a loaded segment");
    let boot_info_frame: PhysAddr = mm::frame::acquire().expect("init.rs: out of memory allocating boot info page");
    {
        let mut alloc_frame = || mm::frame::acquire().ok();
        unsafe {
            kernel
                .processes
                .get(pid)
                .unwrap()
                .address_space
                .page_table
                .map(BOOT_INFO_VA, boot_info_frame, true, false, true, false, &mut alloc_frame)
                .expect("init.rs: failed to map boot info page");
        }
    }
    let boot_info = unsafe { &mut *(paging::phys_to_virt(boot_info_frame) as *mut BootInfo) };
    boot_info.initrd_phys_base = initrd_phys_base;
    boot_info.initrd_size = initrd_size;

    let entry = elf.header().entry_point();
    lifecycle::create_thread(&mut kernel, pid, entry, BOOT_INFO_VA).expect("init.rs: failed to start init thread");
}

extern "x86-interrupt" fn div_by_zero_fault(frame: InterruptStackFrame) -> ! {
    println!("fatal: divide-by-zero at rip={:#x}", frame.rip);
    hlt_loop();
}

extern "x86-interrupt" fn debug_trap(_frame: InterruptStackFrame) {
    println!("debug trap");
}

extern "x86-interrupt" fn breakpoint_trap(_frame: InterruptStackFrame) {
    println!("breakpoint trap");
}

extern "x86-interrupt" fn device_not_available_fault(_frame: InterruptStackFrame) {
    println!("device-not-available fault (fpu lazy restore is not yet wired up)");
}

extern "x86-interrupt" fn double_fault_abort(frame: InterruptStackFrame, err_code: u64) -> ! {
    println!("fatal: double fault at rip={:#x} err={:#x}", frame.rip, err_code);
    hlt_loop();
}

extern "x86-interrupt" fn invalid_tss_fault(frame: InterruptStackFrame, err_code: u64) -> ! {
    println!("fatal: invalid tss at rip={:#x} err={:#x}", frame.rip, err_code);
    hlt_loop();
}

extern "x86-interrupt" fn segment_not_present_fault(frame: InterruptStackFrame, err_code: u64) -> ! {
    println!("fatal: segment not present at rip={:#x} err={:#x}", frame.rip, err_code);
    hlt_loop();
}

extern "x86-interrupt" fn stack_fault(frame: InterruptStackFrame, err_code: u64) -> ! {
    println!("fatal: stack fault at rip={:#x} err={:#x}", frame.rip, err_code);
    hlt_loop();
}

extern "x86-interrupt" fn alignment_check_fault(frame: InterruptStackFrame, err_code: u64) {
    println!("alignment check fault at rip={:#x} err={:#x}", frame.rip, err_code);
}

/// Copies `*frame` into the currently scheduled thread's saved registers, if
/// any thread is scheduled. The idle loop runs with no thread selected, so
/// this is a no-op while idling.
fn save_current_frame(kernel: &mut Kernel, frame: &RegisterFrame) {
    if let Some(tid) = kernel.scheduler.current {
        kernel.threads.get_mut(tid).unwrap().registers = *frame;
    }
}

/// Delivers a kernel-originated message: sender `0`, which no real process
/// is ever allocated as.
fn deliver_kernel_message(kernel: &mut Kernel, target: Pid, message_id: u64) {
    if !kernel.processes.contains(target) {
        return;
    }
    let msg = Message::new(message_id, 0);
    let _ = message::send(kernel, target, target, msg);
}

/// True if `frame` was taken while running ring-3 code: the low two bits of
/// a selector carry its RPL, and `cs` on an interrupt/exception frame always
/// reflects the privilege level that was actually executing.
fn is_user_mode(frame: &RegisterFrame) -> bool {
    frame.cs & 0b11 != 0
}

extern "C" fn invalid_opcode_fault_trampoline(frame: &mut RegisterFrame) {
    let mut kernel = state::lock();

    if !is_user_mode(frame) {
        println!("fatal: invalid opcode in the kernel at rip={:#x}", frame.rip);
        hlt_loop();
    }

    let tid = kernel.scheduler.current.expect("invalid opcode fault from ring 3 with no thread scheduled");
    let process = kernel.threads.get(tid).unwrap().process;
    save_current_frame(&mut kernel, frame);

    println!("invalid opcode at rip={:#x} pid={:?}, terminating process", frame.rip, process);
    core_dump::print_core_dump(&kernel, process, frame);
    lifecycle::terminate_process(&mut kernel, process);

    *frame = Scheduler::schedule_next(&mut kernel);
}

extern "C" fn general_protection_fault_trampoline(frame: &mut RegisterFrame, err_code: u64) {
    let mut kernel = state::lock();

    if !is_user_mode(frame) {
        println!("fatal: general protection fault in the kernel at rip={:#x} err={:#x}", frame.rip, err_code);
        hlt_loop();
    }

    let tid = kernel.scheduler.current.expect("general protection fault from ring 3 with no thread scheduled");
    let process = kernel.threads.get(tid).unwrap().process;
    save_current_frame(&mut kernel, frame);

    println!(
        "general protection fault at rip={:#x} err={:#x} pid={:?}, terminating process",
        frame.rip, err_code, process
    );
    core_dump::print_core_dump(&kernel, process, frame);
    lifecycle::terminate_process(&mut kernel, process);

    *frame = Scheduler::schedule_next(&mut kernel);
}

extern "C" fn timer_tick_trampoline(frame: &mut RegisterFrame) {
    send_eoi(0);

    let mut kernel = state::lock();
    save_current_frame(&mut kernel, frame);

    let now = kernel.timers.now() + TICK_MICROS;
    let fired = kernel.timers.advance(now);
    for (pid, message_id) in fired {
        deliver_kernel_message(&mut kernel, pid, message_id);
    }

    *frame = Scheduler::schedule_next(&mut kernel);
}

extern "C" fn page_fault_trampoline(frame: &mut RegisterFrame, err_code: u64) {
    let cr2 = cr2_read() as u64;

    let mut kernel = state::lock();
    let tid = match kernel.scheduler.current {
        Some(tid) => tid,
        None => {
            println!("fatal: page fault with no thread scheduled, addr={:#x} err={:#x}", cr2, err_code);
            hlt_loop();
        }
    };
    let process = kernel.threads.get(tid).unwrap().process;
    save_current_frame(&mut kernel, frame);

    if !shared_memory::page_fault(&mut kernel, process, tid, cr2) {
        println!(
            "unhandled page fault addr={:#x} err={:?} pid={:?}, terminating process",
            cr2,
            PfErrCode::from_bits_truncate(err_code),
            process,
        );
        core_dump::print_core_dump(&kernel, process, frame);
        lifecycle::terminate_process(&mut kernel, process);
    }

    *frame = Scheduler::schedule_next(&mut kernel);
}

extern "C" fn irq_trampoline(frame: &mut RegisterFrame, irq: u64) {
    send_eoi(irq as u8);
    let vector = PIC_VECTOR_BASE + irq as u8;

    let mut kernel = state::lock();
    save_current_frame(&mut kernel, frame);

    let targets: alloc::vec::Vec<(Pid, u64)> = kernel
        .processes
        .iter()
        .flat_map(|(pid, process)| {
            process
                .interrupt_subscriptions
                .iter()
                .filter(move |&&(v, _)| v == vector)
                .map(move |&(_, message_id)| (pid, message_id))
        })
        .collect();

    for (pid, message_id) in targets {
        deliver_kernel_message(&mut kernel, pid, message_id);
    }

    *frame = Scheduler::schedule_next(&mut kernel);
}

/// Pushes the general-purpose registers a [`RegisterFrame`] needs, in the
/// exact order its `#[repr(C)]` layout expects once the hardware-pushed
/// `rip, cs, rflags, rsp, ss` tail sits above them; pops them back off in
/// the opposite order before `iretq`. Matches
/// [`libkernel::syscall::syscall_entry`]'s save/restore sequence - the frame's
/// first field (`rax`) must end up at the lowest address, so it is pushed
/// last.
macro_rules! push_gprs {
    () => {
        "push r15", "push r14", "push r13", "push r12", "push r11", "push r10",
        "push r9", "push r8", "push rbp", "push rdi", "push rsi", "push rdx",
        "push rcx", "push rbx", "push rax",
    };
}

macro_rules! pop_gprs {
    () => {
        "pop rax", "pop rbx", "pop rcx", "pop rdx", "pop rsi", "pop rdi",
        "pop rbp", "pop r8", "pop r9", "pop r10", "pop r11", "pop r12",
        "pop r13", "pop r14", "pop r15",
    };
}

#[naked]
unsafe extern "C" fn timer_tick_entry() -> ! {
    core::arch::asm!(
        push_gprs!(),
        "mov rdi, rsp",
        "call {trampoline}",
        pop_gprs!(),
        "iretq",
        trampoline = sym timer_tick_trampoline,
        options(noreturn),
    );
}

/// The CPU pushes a page-fault error code below `rip`, which `push_gprs`
/// would otherwise clobber whichever register it landed in. Left in place
/// on the stack and read by displacement instead, then dropped before
/// `iretq` (which expects only the standard `rip, cs, rflags, rsp, ss`
/// tail).
#[naked]
unsafe extern "C" fn page_fault_entry() -> ! {
    core::arch::asm!(
        push_gprs!(),
        "mov rdi, rsp",
        "mov rsi, [rsp + 15 * 8]",
        "call {trampoline}",
        pop_gprs!(),
        "add rsp, 8",
        "iretq",
        trampoline = sym page_fault_trampoline,
        options(noreturn),
    );
}

#[naked]
unsafe extern "C" fn invalid_opcode_fault_entry() -> ! {
    core::arch::asm!(
        push_gprs!(),
        "mov rdi, rsp",
        "call {trampoline}",
        pop_gprs!(),
        "iretq",
        trampoline = sym invalid_opcode_fault_trampoline,
        options(noreturn),
    );
}

/// Same error-code handling as [`page_fault_entry`]: the CPU-pushed code is
/// read off the stack by displacement and dropped before `iretq`.
#[naked]
unsafe extern "C" fn general_protection_fault_entry() -> ! {
    core::arch::asm!(
        push_gprs!(),
        "mov rdi, rsp",
        "mov rsi, [rsp + 15 * 8]",
        "call {trampoline}",
        pop_gprs!(),
        "add rsp, 8",
        "iretq",
        trampoline = sym general_protection_fault_trampoline,
        options(noreturn),
    );
}

macro_rules! irq_entry {
    ($name:ident, $irq:literal, $trampoline:path) => {
        #[naked]
        unsafe extern "C" fn $name() -> ! {
            core::arch::asm!(
                push_gprs!(),
                "mov rdi, rsp",
                "mov rsi, {irq}",
                "call {trampoline}",
                pop_gprs!(),
                "iretq",
                irq = const $irq,
                trampoline = sym $trampoline,
                options(noreturn),
            );
        }
    };
}

irq_entry!(irq1_entry, 1, irq_trampoline);
irq_entry!(irq2_entry, 2, irq_trampoline);
irq_entry!(irq3_entry, 3, irq_trampoline);
irq_entry!(irq4_entry, 4, irq_trampoline);
irq_entry!(irq5_entry, 5, irq_trampoline);
irq_entry!(irq6_entry, 6, irq_trampoline);
irq_entry!(irq7_entry, 7, irq_trampoline);
irq_entry!(irq8_entry, 8, irq_trampoline);
irq_entry!(irq9_entry, 9, irq_trampoline);
irq_entry!(irq10_entry, 10, irq_trampoline);
irq_entry!(irq11_entry, 11, irq_trampoline);
irq_entry!(irq12_entry, 12, irq_trampoline);
irq_entry!(irq13_entry, 13, irq_trampoline);
irq_entry!(irq14_entry, 14, irq_trampoline);
irq_entry!(irq15_entry, 15, irq_trampoline);

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    println!("{}", info);
    hlt_loop();
}
