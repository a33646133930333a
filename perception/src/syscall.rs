//! The user-space half of the `syscall`/`sysret` convention the kernel's
//! `kernel::syscall` module installs: number in `rax`, arguments spread
//! across `rbx, r12, rdx, rsi, rdi, r8, r9, r10` (this kernel's own
//! register ABI, not the SysV one - `rcx`/`r11` are skipped because
//! `syscall` itself clobbers them with the return `rip`/`rflags`, and
//! `r10` carries an eighth argument where `SendMessage` needs it for the
//! fifth payload word), primary result in `rax` with one out-of-band
//! result word in `rbx`.
//!
//! Every higher-level wrapper in this crate funnels through [`raw`]; the
//! "safe" signature is a lie in the usual systems-code sense (a bad pointer
//! argument still faults the caller), but the register shuffling itself
//! can't misbehave.

use perception_abi::{Error, Syscall};

/// Raw eight-argument, two-result syscall. `a1..a8` land in `rbx, r12, rdx,
/// rsi, rdi, r8, r9, r10`; unused trailing arguments should be passed as
/// `0`. The two results come back in `rax` (status) and `rbx` (one
/// out-of-band result word), matching `kernel::syscall::set_ret`.
#[inline]
#[allow(clippy::too_many_arguments)]
pub fn raw(call: Syscall, a1: u64, a2: u64, a3: u64, a4: u64, a5: u64, a6: u64, a7: u64, a8: u64) -> (i64, u64) {
    let status: i64;
    let out: u64;
    unsafe {
        core::arch::asm!(
            "syscall",
            inlateout("rax") call as u64 => status,
            inlateout("rbx") a1 => out,
            in("r12") a2,
            in("rdx") a3,
            in("rsi") a4,
            in("rdi") a5,
            in("r8") a6,
            in("r9") a7,
            in("r10") a8,
            lateout("r11") _,
            options(nostack),
        );
    }
    (status, out)
}

/// Calls `call` and discards the out-of-band result word, converting the
/// primary status to a `Result`.
#[inline]
#[allow(clippy::too_many_arguments)]
pub fn call0(call: Syscall, a1: u64, a2: u64, a3: u64, a4: u64, a5: u64, a6: u64, a7: u64, a8: u64) -> Result<(), Error> {
    let (status, _) = raw(call, a1, a2, a3, a4, a5, a6, a7, a8);
    to_result(status)
}

/// Calls `call` and keeps the out-of-band result word alongside the status.
#[inline]
#[allow(clippy::too_many_arguments)]
pub fn call1(call: Syscall, a1: u64, a2: u64, a3: u64, a4: u64, a5: u64, a6: u64, a7: u64, a8: u64) -> Result<u64, Error> {
    let (status, out) = raw(call, a1, a2, a3, a4, a5, a6, a7, a8);
    to_result(status).map(|()| out)
}

#[inline]
fn to_result(status: i64) -> Result<(), Error> {
    let err = Error::from_retval(status);
    if err.is_ok() {
        Ok(())
    } else {
        Err(err)
    }
}
