//! Classification of raw KVM exit reasons.
//!
//! The executor dispatches I/O exits directly; everything else is bucketed
//! here into the handful of classes the supervisor cares about. `Debug`
//! exits are swallowed by the executor (single-stepping), `Shutdown` ends
//! one vCPU's loop cleanly, and the error classes are fatal to that vCPU.

use kvm_ioctls::VcpuExit;

/// Coarse classification of a kernel exit reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    /// Port I/O access, routed through the PIO cache.
    PortIo,
    /// Memory-mapped I/O access, routed through the MMIO cache.
    Mmio,
    /// Single-step or breakpoint checkpoint. Not an error.
    Debug,
    /// Clean guest stop (halt, shutdown, or a guest-requested system
    /// event). Terminates only this vCPU's loop.
    Shutdown,
    /// The kernel could not continue executing the guest.
    InternalError,
    /// The guest raised an exception the kernel could not deliver.
    Exception,
    /// An exit reason this build does not handle.
    Unknown,
}

/// Classify a raw exit.
pub fn classify(exit: &VcpuExit<'_>) -> ExitClass {
    match exit {
        VcpuExit::IoIn(..) | VcpuExit::IoOut(..) => ExitClass::PortIo,
        VcpuExit::MmioRead(..) | VcpuExit::MmioWrite(..) => ExitClass::Mmio,
        VcpuExit::Debug(_) => ExitClass::Debug,
        VcpuExit::Hlt | VcpuExit::Shutdown | VcpuExit::SystemEvent(..) => ExitClass::Shutdown,
        VcpuExit::InternalError | VcpuExit::FailEntry(..) => ExitClass::InternalError,
        VcpuExit::Exception => ExitClass::Exception,
        _ => ExitClass::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_exits_classify_by_space() {
        let mut byte = [0u8];
        assert_eq!(classify(&VcpuExit::IoIn(0x3f8, &mut byte)), ExitClass::PortIo);
        assert_eq!(classify(&VcpuExit::IoOut(0x3f8, &[0u8])), ExitClass::PortIo);
        assert_eq!(
            classify(&VcpuExit::MmioRead(0xfee0_0000, &mut byte)),
            ExitClass::Mmio,
        );
        assert_eq!(
            classify(&VcpuExit::MmioWrite(0xfee0_0000, &[0u8])),
            ExitClass::Mmio,
        );
    }

    #[test]
    fn halt_and_shutdown_are_clean_stops() {
        assert_eq!(classify(&VcpuExit::Hlt), ExitClass::Shutdown);
        assert_eq!(classify(&VcpuExit::Shutdown), ExitClass::Shutdown);
    }

    #[test]
    fn failure_reasons_are_fatal_classes() {
        assert_eq!(classify(&VcpuExit::InternalError), ExitClass::InternalError);
        assert_eq!(
            classify(&VcpuExit::FailEntry(0, 0)),
            ExitClass::InternalError,
        );
        assert_eq!(classify(&VcpuExit::Exception), ExitClass::Exception);
    }

    #[test]
    fn unrecognized_exit_is_unknown() {
        assert_eq!(classify(&VcpuExit::IrqWindowOpen), ExitClass::Unknown);
    }
}
