//! # Page-Fault Resolution
//!
//! Entry point from the `#PF` handler and from the system-call layer.
//!
//! A fault on a registered page loads it, unless it is a write to a
//! read-only page. A fault on an unregistered page grows the stack if the
//! address is a plausible push below the stack pointer inside the stack
//! envelope. Anything else terminates the faulting process. A fault the
//! kernel itself cannot explain halts the kernel.

use crate::addresses::{PAGE_SIZE, UserAddress, UserPage};
use crate::error::{Severity, VmError};
use crate::hal::FaultRegisters;
use crate::page::PageKind;
use crate::space::AddressSpace;
use bitfield_struct::bitfield;
use log::{debug, error};

/// Page-fault error code layout (x86).
///
/// Reference: Intel SDM Vol. 3A, §4.7 "Page-Fault Exceptions".
#[bitfield(u32)]
pub struct FaultCode {
    /// 0 = non-present page.
    /// 1 = protection violation (page present but access disallowed).
    pub present: bool, // bit 0

    /// 0 = read.
    /// 1 = write.
    pub write: bool, // bit 1

    /// 0 = supervisor.
    /// 1 = user mode.
    pub user: bool, // bit 2

    #[bits(29)]
    __: u32,
}

/// What the interrupt handler must do after a fault.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FaultOutcome {
    /// The page is mapped; restart the faulting instruction.
    Resolved,
    /// Kill the current process with exit status -1.
    TerminateProcess(VmError),
}

/// A decoded page fault.
#[derive(Debug, Clone, Copy)]
pub struct Fault {
    pub address: UserAddress,
    pub code: FaultCode,
    /// The user stack pointer at the time of the fault. For faults taken in
    /// kernel mode this is the value saved on entry to the system call.
    pub user_esp: UserAddress,
}

/// Handle a hardware page fault.
///
/// The fault address register is read before interrupts are re-enabled;
/// another fault taken once interrupts are on would overwrite it.
///
/// # Panics
/// On a fault in kernel context that no user page explains.
pub fn page_fault(
    regs: &impl FaultRegisters,
    space: &mut AddressSpace,
    code: FaultCode,
    user_esp: UserAddress,
) -> FaultOutcome {
    let address = regs.fault_address();
    regs.enable_interrupts();
    handle(
        space,
        Fault {
            address,
            code,
            user_esp,
        },
    )
}

/// Resolve a decoded fault.
///
/// # Panics
/// If resolution fails with a system-fatal error.
pub fn handle(space: &mut AddressSpace, fault: Fault) -> FaultOutcome {
    space.record_fault();

    let result = if space.config().is_user(fault.address) {
        resolve(space, fault.address, fault.code.write(), fault.user_esp, false)
    } else if fault.code.user() {
        Err(VmError::ProtectionViolation(fault.address))
    } else {
        Err(VmError::KernelInvariantViolation("kernel page fault outside user space"))
    };

    match result {
        Ok(()) => FaultOutcome::Resolved,
        Err(err) if err.severity() == Severity::System => {
            panic!("page fault at {} ({:?}): {err}", fault.address, fault.code);
        }
        Err(err) => {
            error!(
                "page fault at {} ({:?}) terminates space {:?}: {err}",
                fault.address,
                fault.code,
                space.id()
            );
            FaultOutcome::TerminateProcess(err)
        }
    }
}

/// Bring the page containing `addr` into memory.
///
/// With `left_pinned` the frame stays pinned after installation; the caller
/// releases it with [`AddressSpace::unpin`].
///
/// # Errors
/// - [`VmError::ProtectionViolation`] for a write to a read-only page or an
///   unregistered address outside the stack-growth envelope.
/// - Any error of loading the page.
pub fn resolve(
    space: &mut AddressSpace,
    addr: UserAddress,
    write: bool,
    esp: UserAddress,
    left_pinned: bool,
) -> Result<(), VmError> {
    let page = addr.page();
    if let Some(entry) = space.find_entry(addr) {
        if write && !entry.writable() {
            return Err(VmError::ProtectionViolation(addr));
        }
        return space.load_page(page, left_pinned);
    }

    if !space.config().may_grow_stack(addr, esp) {
        return Err(VmError::ProtectionViolation(addr));
    }
    space.add_entry(page, PageKind::Stack, None, 0, true)?;
    debug!("stack grows to {page:?} (esp {esp})");
    space.load_page(page, left_pinned)
}

/// Pages touched by the buffer `[addr, addr + len)`.
fn buffer_pages(addr: UserAddress, len: usize) -> Option<(UserPage, u64)> {
    if len == 0 {
        return Some((addr.page(), 0));
    }
    let last = addr.checked_add(len as u64 - 1)?;
    let count = (last.page().base().as_u64() - addr.page().base().as_u64()) / PAGE_SIZE as u64 + 1;
    Some((addr.page(), count))
}

/// Fault in and pin every page of a user buffer before the kernel touches it.
///
/// On error every pin taken so far is released again.
///
/// # Errors
/// - [`VmError::ProtectionViolation`] for a null pointer, a buffer reaching
///   into kernel space, or any page that cannot be resolved for the access.
pub fn verify_and_pin(
    space: &mut AddressSpace,
    addr: UserAddress,
    len: usize,
    write: bool,
    esp: UserAddress,
) -> Result<(), VmError> {
    if addr.is_null() {
        return Err(VmError::ProtectionViolation(addr));
    }
    let (first, count) = buffer_pages(addr, len).ok_or(VmError::ProtectionViolation(addr))?;
    let end = first
        .checked_add_pages(count)
        .ok_or(VmError::ProtectionViolation(addr))?;
    if end.base() > space.config().user_top {
        return Err(VmError::ProtectionViolation(addr));
    }

    for i in 0..count {
        let page = first.checked_add_pages(i).ok_or(VmError::ProtectionViolation(addr))?;
        let at = if i == 0 { addr } else { page.base() };
        if let Err(err) = resolve(space, at, write, esp, true) {
            unpin_pages(space, first, i);
            return Err(err);
        }
    }
    Ok(())
}

/// Release the pins taken by [`verify_and_pin`].
///
/// # Errors
/// [`VmError::NotMapped`] or [`VmError::KernelInvariantViolation`] if a page
/// of the buffer is not pinned.
pub fn unpin_buffer(space: &AddressSpace, addr: UserAddress, len: usize) -> Result<(), VmError> {
    let (first, count) = buffer_pages(addr, len).ok_or(VmError::ProtectionViolation(addr))?;
    for i in 0..count {
        let page = first.checked_add_pages(i).ok_or(VmError::ProtectionViolation(addr))?;
        space.unpin(page.base())?;
    }
    Ok(())
}

fn unpin_pages(space: &AddressSpace, first: UserPage, count: u64) {
    for page in (0..count).filter_map(|i| first.checked_add_pages(i)) {
        if let Err(err) = space.unpin(page.base()) {
            error!("unwinding buffer pin at {page:?}: {err}");
        }
    }
}
