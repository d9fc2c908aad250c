//! Stack capture and frame symbolisation.
//!
//! The raw walk comes from glibc's `backtrace(3)`; the bottom frames belong
//! to the allocator itself and are dropped before anything downstream sees
//! the trace. Symbol names come from `dladdr(3)` plus demangling. The
//! `unwind` cargo feature decides *when* symbolisation happens: at call-site
//! interning time (default), or lazily at dump time when the feature is off
//! and call sites carry raw addresses only. Call-site hashing always runs
//! over the raw return addresses, so both modes agree on identity.

use core::ffi::CStr;

/// Hard bound on captured stack depth.
pub const MAX_FRAMES: usize = 256;

/// Innermost frames belonging to the allocator, dropped from every capture:
/// [`capture`] itself, the call-site interning routine and the recording
/// entry point. All three are `#[inline(never)]` so the depth holds in
/// optimised builds, leaving the public allocation entry point as the first
/// retained frame.
const SKIP_FRAMES: usize = 3;

/// A symbolised frame: nearest exported symbol plus the byte offset of the
/// return address past it.
#[derive(Clone, Debug)]
pub struct Symbol {
    pub name: String,
    pub offset: u64,
}

/// Capture the current call stack into `frames`, innermost first, with the
/// allocator-internal bottom dropped. Returns the frame count.
#[inline(never)]
pub fn capture(frames: &mut [u64; MAX_FRAMES]) -> usize {
    let mut raw = [core::ptr::null_mut::<libc::c_void>(); MAX_FRAMES];
    let depth = unsafe { libc::backtrace(raw.as_mut_ptr(), MAX_FRAMES as libc::c_int) };
    let depth = depth.max(0) as usize;

    let take = depth.saturating_sub(SKIP_FRAMES);
    for (slot, addr) in frames.iter_mut().zip(&raw[depth - take..depth]) {
        *slot = *addr as u64;
    }
    take
}

/// Resolve a return address against the loaded objects' dynamic symbols.
/// `None` when the address falls outside every object or its symbol is not
/// exported.
pub fn symbolize(addr: u64) -> Option<Symbol> {
    let mut info: libc::Dl_info = unsafe { core::mem::zeroed() };
    let found = unsafe { libc::dladdr(addr as *const libc::c_void, &mut info) };
    if found == 0 || info.dli_sname.is_null() {
        return None;
    }

    let mangled = unsafe { CStr::from_ptr(info.dli_sname) }.to_string_lossy();
    let name = rustc_demangle::demangle(&mangled).to_string();
    let offset = addr.saturating_sub(info.dli_saddr as u64);

    Some(Symbol { name, offset })
}

#[cfg(test)]
mod tests {
    use super::{MAX_FRAMES, capture, symbolize};
    use serial_test::serial;

    #[test]
    #[serial]
    fn capture_sees_the_caller_chain() {
        let mut frames = [0u64; MAX_FRAMES];
        let depth = capture(&mut frames);

        assert!(depth > 0);
        assert!(depth <= MAX_FRAMES);
        assert!(frames[..depth].iter().all(|&addr| addr != 0));
    }

    #[test]
    #[serial]
    fn symbolize_tolerates_arbitrary_addresses() {
        // Not every address resolves (static binaries export almost nothing),
        // but the lookup must never misbehave on junk input.
        let _ = symbolize(0x1);
        let _ = symbolize(u64::MAX & !0xfff);

        if let Some(symbol) = symbolize(libc::getpid as usize as u64) {
            assert!(!symbol.name.is_empty());
        }
    }
}
