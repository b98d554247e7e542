//! Native thread tokens and syscall interruption.
//!
//! A token identifies the OS thread parked in a blocking syscall so another
//! thread can knock it out with a signal. The interrupt signal gets a no-op
//! handler installed without `SA_RESTART`, so the parked call returns `EINTR`
//! instead of resuming.
//!
//! Token `0` means "no thread".

use std::io;
use std::sync::OnceLock;

/// Opaque OS thread token. `0` is never a live thread.
pub type NativeToken = u64;

#[cfg(target_os = "linux")]
fn interrupt_signal() -> libc::c_int {
    libc::SIGRTMAX() - 2
}

#[cfg(not(target_os = "linux"))]
fn interrupt_signal() -> libc::c_int {
    libc::SIGIO
}

extern "C" fn interrupt_handler(_signum: libc::c_int) {}

static HANDLER_INSTALLED: OnceLock<Result<libc::c_int, i32>> = OnceLock::new();

/// Install the no-op handler once; returns the signal number in use.
fn ensure_handler() -> io::Result<libc::c_int> {
    let result = HANDLER_INSTALLED.get_or_init(|| {
        let sig = interrupt_signal();
        // SAFETY: zeroed sigaction is a valid "no flags, empty mask" value; we
        // fill the handler and mask before handing it to the kernel.
        let mut act = unsafe { std::mem::zeroed::<libc::sigaction>() };
        act.sa_sigaction = interrupt_handler as extern "C" fn(libc::c_int) as libc::sighandler_t;
        act.sa_flags = 0;
        // SAFETY: act.sa_mask is a valid sigset_t owned by this frame.
        unsafe { libc::sigemptyset(&mut act.sa_mask) };
        // SAFETY: act is fully initialized; oldact may be null.
        let rc = unsafe { libc::sigaction(sig, &act, std::ptr::null_mut()) };
        if rc == 0 {
            Ok(sig)
        } else {
            Err(io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or(libc::EINVAL))
        }
    });
    match result {
        Ok(sig) => Ok(*sig),
        Err(errno) => Err(io::Error::from_raw_os_error(*errno)),
    }
}

/// Handle to the native thread facility.
#[derive(Debug, Clone, Copy)]
pub struct NativeThread;

impl NativeThread {
    /// Token for the calling thread.
    ///
    /// Also makes sure the interrupt handler is installed, so a token handed
    /// out here can always be signalled safely. If installation failed the
    /// token is `0` and callers simply never signal.
    #[must_use]
    pub fn current() -> NativeToken {
        if ensure_handler().is_err() {
            return 0;
        }
        // SAFETY: pthread_self has no preconditions.
        let me = unsafe { libc::pthread_self() };
        me as usize as NativeToken
    }

    /// Interrupt the blocking syscall the thread behind `token` is parked in.
    ///
    /// The syscall returns `EINTR`. Signalling token `0` is a no-op.
    pub fn signal(token: NativeToken) -> io::Result<()> {
        if token == 0 {
            return Ok(());
        }
        let sig = ensure_handler()?;
        // SAFETY: the token came from pthread_self() on a thread of this
        // process; callers clear it before that thread can exit the region.
        let rc = unsafe { libc::pthread_kill(token as usize as libc::pthread_t, sig) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::from_raw_os_error(rc))
        }
    }

    /// Signal number used for interruption.
    pub fn interrupt_signal() -> io::Result<i32> {
        ensure_handler()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{Duration, Instant};

    #[test]
    fn current_is_nonzero_and_stable() {
        let a = NativeThread::current();
        let b = NativeThread::current();
        assert_ne!(a, 0);
        assert_eq!(a, b);
    }

    #[test]
    fn tokens_differ_across_threads() {
        let here = NativeThread::current();
        let there = std::thread::spawn(NativeThread::current).join().unwrap();
        assert_ne!(here, there);
    }

    #[test]
    fn signalling_zero_is_a_no_op() {
        NativeThread::signal(0).unwrap();
    }

    #[test]
    fn signal_interrupts_a_parked_read() {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: fds has room for two descriptors.
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (rd, wr) = (fds[0], fds[1]);

        let token = Arc::new(AtomicU64::new(0));
        let token2 = Arc::clone(&token);
        let reader = std::thread::spawn(move || {
            token2.store(NativeThread::current(), Ordering::SeqCst);
            let mut byte = 0u8;
            // SAFETY: byte is a valid one-byte buffer.
            let rc = unsafe { libc::read(rd, (&mut byte as *mut u8).cast(), 1) };
            (rc, io::Error::last_os_error().raw_os_error())
        });

        while token.load(Ordering::SeqCst) == 0 {
            std::thread::yield_now();
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while !reader.is_finished() && Instant::now() < deadline {
            NativeThread::signal(token.load(Ordering::SeqCst)).unwrap();
            std::thread::sleep(Duration::from_millis(20));
        }
        let (rc, errno) = reader.join().unwrap();
        assert_eq!(rc, -1);
        assert_eq!(errno, Some(libc::EINTR));

        // SAFETY: both descriptors are owned by this test.
        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }

    #[test]
    fn interrupt_signal_is_reported() {
        let sig = NativeThread::interrupt_signal().unwrap();
        assert!(sig > 0);
    }
}
