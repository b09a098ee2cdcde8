//! The per-vCPU executor and its pause rendezvous.
//!
//! Each vCPU is driven by one dedicated host thread that owns the KVM vCPU
//! handle for its entire lifetime — the blocking `KVM_RUN` call is always
//! issued from that same thread, never routed through a shared pool. The
//! executor loop is:
//!
//! 1. flush dirty cached register state into the kernel handle,
//! 2. park if a pause is requested (announcing quiescence only after the
//!    flush, so a snapshot never races an in-flight exit),
//! 3. enter `KVM_RUN`, retrying on `EINTR`/`EAGAIN`,
//! 4. dispatch the exit through the [`crate::machine::Model`].
//!
//! # Breaking out of the kernel
//!
//! A pauser cannot wait for a blocked vCPU to exit on its own. The
//! two-phase protocol is: set the pause flag, then send a directed
//! real-time signal to the executor thread. The signal handler sets the
//! handle's immediate-exit flag, which forces the in-flight (or
//! about-to-start) `KVM_RUN` to return `EINTR` without losing the pending
//! exit; the executor's retry path observes the flag and parks. The
//! immediate-exit flag — not the signal itself — is what closes the window
//! between the executor's pause check and its entry into the kernel. Only
//! after the executor has flushed state and announced quiescence does
//! `pause()` return; device and register state may be touched only then.

use std::cell::Cell;
use std::sync::{Arc, Condvar, Mutex, OnceLock};

use kvm_bindings::{kvm_guest_debug, kvm_regs, kvm_sregs, KVM_GUESTDBG_ENABLE, KVM_GUESTDBG_SINGLESTEP};
use kvm_ioctls::{VcpuExit, VcpuFd, VmFd};
use log::{debug, info};
use thiserror::Error;
use vmm_sys_util::signal::{register_signal_handler, SIGRTMIN};

use crate::exits::{self, ExitClass};
use crate::io::IoError;
use crate::machine::Model;
use crate::pause::PauseError;

/// Offset from `SIGRTMIN` of the executor preemption signal.
const KICK_SIGNAL_OFFSET: libc::c_int = 0;

/// The directed signal used to break an executor out of `KVM_RUN`.
pub(crate) fn kick_signal() -> libc::c_int {
    SIGRTMIN() + KICK_SIGNAL_OFFSET
}

thread_local! {
    /// The vCPU handle owned by this thread, visible to the signal
    /// handler. Null outside an executor's run loop.
    static ACTIVE_VCPU: Cell<*const VcpuFd> = const { Cell::new(std::ptr::null()) };
}

extern "C" fn kick_handler(
    _num: libc::c_int,
    _info: *mut libc::siginfo_t,
    _ctx: *mut libc::c_void,
) {
    let fd = ACTIVE_VCPU.with(Cell::get);
    if !fd.is_null() {
        // Only an atomic store into the shared run page; async-signal-safe.
        unsafe { (*(fd as *mut VcpuFd)).set_kvm_immediate_exit(1) };
    }
}

/// Register the process-wide preemption signal handler. Idempotent.
pub fn register_kick_handler() -> Result<(), VcpuError> {
    static REGISTERED: OnceLock<Result<(), vmm_sys_util::errno::Error>> = OnceLock::new();
    REGISTERED
        .get_or_init(|| register_signal_handler(kick_signal(), kick_handler))
        .clone()
        .map_err(VcpuError::Signal)
}

/// Marks the current thread as the kick target while alive.
struct KickTarget;

impl KickTarget {
    fn install(fd: &VcpuFd) -> Self {
        ACTIVE_VCPU.with(|cell| cell.set(fd as *const VcpuFd));
        Self
    }
}

impl Drop for KickTarget {
    fn drop(&mut self) {
        ACTIVE_VCPU.with(|cell| cell.set(std::ptr::null()));
    }
}

/// Errors fatal to one vCPU's execution loop.
#[derive(Error, Debug)]
pub enum VcpuError {
    /// Creating the kernel vCPU failed.
    #[error("failed to create vCPU: {0}")]
    Create(#[source] kvm_ioctls::Error),

    /// Reading register state from the kernel failed.
    #[error("failed to get registers: {0}")]
    GetRegs(#[source] kvm_ioctls::Error),

    /// Writing register state into the kernel failed.
    #[error("failed to set registers: {0}")]
    SetRegs(#[source] kvm_ioctls::Error),

    /// Configuring single-stepping failed.
    #[error("failed to configure guest debug: {0}")]
    GuestDebug(#[source] kvm_ioctls::Error),

    /// Installing the preemption signal handler failed.
    #[error("failed to register preemption signal handler: {0}")]
    Signal(#[source] vmm_sys_util::errno::Error),

    /// `KVM_RUN` failed with a non-retryable error.
    #[error("vCPU run failed: {0}")]
    Run(#[source] kvm_ioctls::Error),

    /// The kernel reported an emulation failure.
    #[error("kernel reported an internal error")]
    InternalError,

    /// The guest raised an exception the kernel could not deliver.
    #[error("guest raised an unhandled exception")]
    Exception,

    /// An exit reason this build does not handle.
    #[error("unhandled exit: {0}")]
    UnhandledExit(String),

    /// I/O dispatch for an exit failed.
    #[error("I/O dispatch failed: {0}")]
    Io(#[from] IoError),
}

#[derive(Debug, Default)]
struct RunFlags {
    /// Whether the executor is between its pause check and its next park.
    /// The executor counts as running from creation; it reports paused
    /// only from inside the loop, after flushing state.
    running: bool,
    /// Manual pause flag.
    manual: bool,
    /// Nested automatic pause count.
    auto: usize,
}

impl RunFlags {
    fn pause_requested(&self) -> bool {
        self.manual || self.auto > 0
    }
}

/// The pause rendezvous shared between one executor and its pausers.
///
/// The counting semantics mirror [`crate::pause::PauseState`]; the extra
/// machinery is the `running` flag and the paused/resume condition pair
/// that implement the two-phase "announce intent → await quiescence
/// acknowledgement" protocol.
#[derive(Debug)]
pub struct RunState {
    flags: Mutex<RunFlags>,
    /// Signalled by the executor once it has parked (or exited).
    paused_ev: Condvar,
    /// Signalled by the last unpause.
    resume_ev: Condvar,
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

impl RunState {
    pub fn new() -> Self {
        Self {
            flags: Mutex::new(RunFlags {
                running: true,
                ..Default::default()
            }),
            paused_ev: Condvar::new(),
            resume_ev: Condvar::new(),
        }
    }

    /// Request a pause and block until the executor is quiescent.
    ///
    /// `kick` delivers the preemption to the executor's thread; it is
    /// invoked only by the request that initiates the pause, while later
    /// nested requests just wait. Does not return until the executor has
    /// flushed its state and parked (or its loop has exited).
    pub fn pause(&self, manual: bool, kick: impl FnOnce()) -> Result<(), PauseError> {
        let mut flags = self.flags.lock().expect("run state poisoned");

        if manual {
            if flags.manual {
                return Err(PauseError::AlreadyPaused);
            }
            flags.manual = true;
        } else {
            flags.auto += 1;
        }

        if flags.running {
            if manual || flags.auto == 1 {
                kick();
            }
            while flags.running {
                flags = self.paused_ev.wait(flags).expect("run state poisoned");
            }
        }
        Ok(())
    }

    /// Drop one pause request; the executor resumes only when the last
    /// outstanding request (manual or automatic) is gone.
    pub fn unpause(&self, manual: bool) -> Result<(), PauseError> {
        let mut flags = self.flags.lock().expect("run state poisoned");

        if manual {
            if !flags.manual {
                return Err(PauseError::NotPaused);
            }
            flags.manual = false;
        } else {
            if flags.auto == 0 {
                return Err(PauseError::NotPaused);
            }
            flags.auto -= 1;
        }

        if !flags.pause_requested() {
            self.resume_ev.notify_all();
        }
        Ok(())
    }

    /// Whether a pause request is currently outstanding.
    pub fn pause_requested(&self) -> bool {
        self.flags
            .lock()
            .expect("run state poisoned")
            .pause_requested()
    }

    /// Executor side: if a pause is requested, announce quiescence and
    /// block until every request is dropped. Returns whether it parked.
    ///
    /// Callers must have flushed all architectural state first; the
    /// `paused_ev` broadcast is the pauser's licence to read it.
    fn park_if_requested(&self) -> bool {
        let mut flags = self.flags.lock().expect("run state poisoned");
        if !flags.pause_requested() {
            return false;
        }
        while flags.pause_requested() {
            flags.running = false;
            self.paused_ev.notify_all();
            flags = self.resume_ev.wait(flags).expect("run state poisoned");
        }
        flags.running = true;
        true
    }

    /// Executor side: the loop has exited; wake any pauser still waiting
    /// for quiescence.
    fn mark_stopped(&self) {
        let mut flags = self.flags.lock().expect("run state poisoned");
        flags.running = false;
        self.paused_ev.notify_all();
    }
}

/// Lazily-populated view of the kernel's register state.
///
/// Reads are served from the cache once fetched; writes are buffered and
/// flushed into the kernel before the next guest entry. The cache is
/// dropped whenever the guest may have run (after every exit and across
/// pause/resume boundaries).
#[derive(Debug, Default)]
struct RegCache {
    regs: Option<kvm_regs>,
    sregs: Option<kvm_sregs>,
    dirty_regs: bool,
    dirty_sregs: bool,
}

impl RegCache {
    fn flush(&mut self, fd: &VcpuFd) -> Result<(), VcpuError> {
        if self.dirty_regs {
            let regs = self.regs.as_ref().expect("dirty without value");
            fd.set_regs(regs).map_err(VcpuError::SetRegs)?;
            self.dirty_regs = false;
        }
        if self.dirty_sregs {
            let sregs = self.sregs.as_ref().expect("dirty without value");
            fd.set_sregs(sregs).map_err(VcpuError::SetRegs)?;
            self.dirty_sregs = false;
        }
        Ok(())
    }

    fn invalidate(&mut self) {
        if !self.dirty_regs {
            self.regs = None;
        }
        if !self.dirty_sregs {
            self.sregs = None;
        }
    }
}

/// One virtual CPU: the kernel handle, its register cache, and the pause
/// rendezvous. Exclusively owned by its executor thread once started.
pub struct Vcpu {
    id: usize,
    fd: VcpuFd,
    state: Arc<RunState>,
    cache: RegCache,
    stepping: bool,
}

impl Vcpu {
    /// Create the kernel vCPU `id` under `vm`.
    pub fn new(vm: &VmFd, id: usize) -> Result<Self, VcpuError> {
        let fd = vm.create_vcpu(id as u64).map_err(VcpuError::Create)?;
        Ok(Self {
            id,
            fd,
            state: Arc::new(RunState::new()),
            cache: RegCache::default(),
            stepping: false,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// The rendezvous shared with pausers.
    pub fn run_state(&self) -> &Arc<RunState> {
        &self.state
    }

    /// General-purpose registers, fetched from the kernel on first use.
    pub fn registers(&mut self) -> Result<kvm_regs, VcpuError> {
        if self.cache.regs.is_none() {
            self.cache.regs = Some(self.fd.get_regs().map_err(VcpuError::GetRegs)?);
        }
        Ok(self.cache.regs.expect("just populated"))
    }

    /// Buffer a register write; flushed before the next guest entry.
    pub fn set_registers(&mut self, regs: kvm_regs) {
        self.cache.regs = Some(regs);
        self.cache.dirty_regs = true;
    }

    /// Special registers, fetched from the kernel on first use.
    pub fn special_registers(&mut self) -> Result<kvm_sregs, VcpuError> {
        if self.cache.sregs.is_none() {
            self.cache.sregs = Some(self.fd.get_sregs().map_err(VcpuError::GetRegs)?);
        }
        Ok(self.cache.sregs.expect("just populated"))
    }

    /// Buffer a special-register write; flushed before the next guest
    /// entry.
    pub fn set_special_registers(&mut self, sregs: kvm_sregs) {
        self.cache.sregs = Some(sregs);
        self.cache.dirty_sregs = true;
    }

    /// Enable or disable single-stepping. While enabled, every guest
    /// instruction produces a `Debug` exit, which the executor swallows.
    pub fn set_stepping(&mut self, on: bool) -> Result<(), VcpuError> {
        let control = if on {
            KVM_GUESTDBG_ENABLE | KVM_GUESTDBG_SINGLESTEP
        } else {
            0
        };
        let dbg = kvm_guest_debug {
            control,
            ..Default::default()
        };
        self.fd.set_guest_debug(&dbg).map_err(VcpuError::GuestDebug)?;
        self.stepping = on;
        Ok(())
    }

    pub fn stepping(&self) -> bool {
        self.stepping
    }

    /// Drive this vCPU until the guest stops it or a fatal error occurs.
    ///
    /// Must be called on the thread that will own this vCPU for its entire
    /// lifetime; the kernel handle is thread-affine.
    pub fn run_loop(mut self, model: Arc<Model>) -> Result<(), VcpuError> {
        register_kick_handler()?;
        let result = self.execute(&model);
        self.state.mark_stopped();
        match &result {
            Ok(()) => info!("vcpu[{}]: exited cleanly", self.id),
            Err(e) => info!("vcpu[{}]: exited with error: {}", self.id, e),
        }
        result
    }

    fn execute(&mut self, model: &Model) -> Result<(), VcpuError> {
        let _kick_target = KickTarget::install(&self.fd);
        info!("vcpu[{}]: running", self.id);

        loop {
            // Dirty state must reach the kernel before quiescence can be
            // announced; a parked vCPU is fully flushed by construction.
            self.cache.flush(&self.fd)?;

            if self.state.park_if_requested() {
                debug!("vcpu[{}]: resumed", self.id);
                self.cache.invalidate();
            }

            match self.fd.run() {
                Err(e) if e.errno() == libc::EINTR || e.errno() == libc::EAGAIN => {
                    // Preempted (or spuriously kicked after a resume);
                    // clear the forced-exit flag and retake the loop from
                    // the top. No exit is lost: the kernel re-delivers any
                    // pending completion on the next entry.
                    self.fd.set_kvm_immediate_exit(0);
                    continue;
                }
                Err(e) => return Err(VcpuError::Run(e)),
                Ok(exit) => {
                    self.cache.invalidate();
                    match exit {
                        VcpuExit::IoIn(port, data) => model.pio_read(u64::from(port), data)?,
                        VcpuExit::IoOut(port, data) => model.pio_write(u64::from(port), data)?,
                        VcpuExit::MmioRead(addr, data) => model.mmio_read(addr, data)?,
                        VcpuExit::MmioWrite(addr, data) => model.mmio_write(addr, data)?,
                        VcpuExit::Debug(_) => {
                            debug!("vcpu[{}]: step", self.id);
                        }
                        other => match exits::classify(&other) {
                            ExitClass::Shutdown => {
                                info!("vcpu[{}]: guest stop ({:?})", self.id, other);
                                return Ok(());
                            }
                            ExitClass::InternalError => return Err(VcpuError::InternalError),
                            ExitClass::Exception => return Err(VcpuError::Exception),
                            _ => {
                                return Err(VcpuError::UnhandledExit(format!("{:?}", other)));
                            }
                        },
                    }
                }
            }
        }
    }
}
