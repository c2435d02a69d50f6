//! Allocation critical sections and the collection safepoint
//!
//! Per thread:
//!
//! - **No-safepoint depth**: nonzero while this thread holds reserved but not
//!   yet fully formatted memory. The slow path refuses to hand off to the
//!   collector while the depth is nonzero.
//! - **Stack headroom**: the collector needs far more stack than a bump
//!   allocation. Every handoff runs through [`with_stack_headroom`], which
//!   moves to a fresh stack segment when the thread is close to its limit.
//!
//! Across threads, [`Safepoint`] keeps the registry of attached mutators.
//! A collection first closes the allocation gate (shared by slow paths from
//! obtaining memory until the object is formatted), then waits until no
//! mutator is inside a fast-path formatting window and asks every mutator to
//! retire its TLAB before allocating again.

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_utils::{Backoff, CachePadded};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};

use crate::config::HeapParameters;

thread_local! {
    static NO_SAFEPOINT_DEPTH: Cell<u32> = const { Cell::new(0) };
    static HEADROOM_RELAXED_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// True if this thread may currently reach a safepoint
#[inline]
pub fn safepoint_allowed() -> bool {
    NO_SAFEPOINT_DEPTH.with(|depth| depth.get() == 0)
}

/// Current no-safepoint nesting depth of this thread
pub fn no_safepoint_depth() -> u32 {
    NO_SAFEPOINT_DEPTH.with(|depth| depth.get())
}

/// Non-preemptible region, from memory reservation until the object is
/// fully formatted.
///
/// Guards nest. The guard is tied to the creating thread.
#[must_use = "the region ends when the guard is dropped"]
pub struct NoSafepointScope {
    _thread_bound: PhantomData<*const ()>,
}

impl NoSafepointScope {
    /// Enter the region
    #[inline(always)]
    pub fn enter() -> Self {
        NO_SAFEPOINT_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self {
            _thread_bound: PhantomData,
        }
    }
}

impl Drop for NoSafepointScope {
    #[inline(always)]
    fn drop(&mut self) {
        NO_SAFEPOINT_DEPTH.with(|depth| {
            debug_assert!(depth.get() > 0);
            depth.set(depth.get() - 1)
        });
    }
}

/// True while this thread runs a collector handoff
pub fn stack_headroom_relaxed() -> bool {
    HEADROOM_RELAXED_DEPTH.with(|depth| depth.get() != 0)
}

/// Marks the thread as inside a collector handoff.
///
/// Restored on every exit, unwinding included.
#[must_use = "the handoff ends when the guard is dropped"]
pub struct StackHeadroomGuard {
    _thread_bound: PhantomData<*const ()>,
}

impl StackHeadroomGuard {
    /// Enter a handoff until the guard drops
    pub fn relax() -> Self {
        HEADROOM_RELAXED_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self {
            _thread_bound: PhantomData,
        }
    }
}

impl Drop for StackHeadroomGuard {
    fn drop(&mut self) {
        HEADROOM_RELAXED_DEPTH.with(|depth| {
            debug_assert!(depth.get() > 0);
            depth.set(depth.get() - 1)
        });
    }
}

/// Run a collector handoff with enough stack.
///
/// If less than `collector_stack_red_zone` bytes of stack remain, `f` runs
/// on a fresh segment of `collector_stack_size` bytes.
pub fn with_stack_headroom<R>(params: &HeapParameters, f: impl FnOnce() -> R) -> R {
    let _headroom = StackHeadroomGuard::relax();
    stacker::maybe_grow(
        params.collector_stack_red_zone,
        params.collector_stack_size,
        f,
    )
}

/// A mutator as seen by collections
#[derive(Debug, Default)]
pub(crate) struct MutatorState {
    /// Set while the mutator formats memory bumped from its TLAB
    formatting: AtomicBool,
    /// Set by a collection; the TLAB must be retired before the next bump
    flush_tlab: AtomicBool,
}

impl MutatorState {
    /// Open a fast-path formatting window.
    ///
    /// `None` while a collection is in progress or after one asked for the
    /// TLAB; the caller takes the slow path instead.
    #[inline(always)]
    pub(crate) fn begin_formatting<'a>(
        &'a self,
        safepoint: &Safepoint,
    ) -> Option<FormattingWindow<'a>> {
        // Pairs with the store to `collecting` in Safepoint::stop_mutators
        self.formatting.store(true, Ordering::SeqCst);
        if safepoint.collecting.load(Ordering::SeqCst) || self.flush_tlab.load(Ordering::Relaxed) {
            self.formatting.store(false, Ordering::Release);
            return None;
        }
        Some(FormattingWindow { state: self })
    }

    /// Consume a pending TLAB flush request
    pub(crate) fn take_flush_request(&self) -> bool {
        self.flush_tlab.swap(false, Ordering::AcqRel)
    }
}

/// Open fast-path formatting window; collections wait for it to close
#[must_use = "the window closes when the guard is dropped"]
pub(crate) struct FormattingWindow<'a> {
    state: &'a MutatorState,
}

impl Drop for FormattingWindow<'_> {
    #[inline(always)]
    fn drop(&mut self) {
        self.state.formatting.store(false, Ordering::Release);
    }
}

/// Registry of attached mutators and the collection gate
#[derive(Default)]
pub(crate) struct Safepoint {
    /// Shared by slow paths, exclusive during collections
    gate: RwLock<()>,
    collecting: CachePadded<AtomicBool>,
    mutators: Mutex<Vec<Arc<CachePadded<MutatorState>>>>,
}

impl Safepoint {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a new mutator
    pub(crate) fn register(&self) -> Arc<CachePadded<MutatorState>> {
        let state = Arc::new(CachePadded::new(MutatorState::default()));
        self.mutators.lock().push(Arc::clone(&state));
        state
    }

    /// Remove a mutator registered with [`Safepoint::register`]
    pub(crate) fn unregister(&self, state: &Arc<CachePadded<MutatorState>>) {
        self.mutators
            .lock()
            .retain(|registered| !Arc::ptr_eq(registered, state));
    }

    /// Number of registered mutators
    pub(crate) fn mutator_count(&self) -> usize {
        self.mutators.lock().len()
    }

    /// Hold off collections while slow-path memory is obtained and
    /// formatted
    pub(crate) fn allocation_gate(&self) -> RwLockReadGuard<'_, ()> {
        self.gate.read()
    }

    /// Run `f` once no mutator is between reserving and formatting memory.
    ///
    /// Every mutator retires its TLAB before its next allocation.
    pub(crate) fn stop_mutators<R>(&self, f: impl FnOnce() -> R) -> R {
        debug_assert!(safepoint_allowed(), "safepoint inside a no-safepoint region");
        let _gate = self.gate.write();
        self.collecting.store(true, Ordering::SeqCst);
        let _resume = Resume(&self.collecting);

        let mutators = self.mutators.lock().clone();
        for state in &mutators {
            let backoff = Backoff::new();
            while state.formatting.load(Ordering::SeqCst) {
                backoff.snooze();
            }
            state.flush_tlab.store(true, Ordering::Release);
        }

        #[cfg(feature = "gc_logging")]
        tracing::debug!(
            target: "genheap::alloc",
            mutators = mutators.len(),
            "Mutators stopped"
        );

        f()
    }

    #[cfg(test)]
    pub(crate) fn collecting(&self) -> bool {
        self.collecting.load(Ordering::SeqCst)
    }
}

/// Reopens the fast path when a collection ends, unwinding included
struct Resume<'a>(&'a AtomicBool);

impl Drop for Resume<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_no_safepoint_scope_nests() {
        assert!(safepoint_allowed());
        {
            let _outer = NoSafepointScope::enter();
            assert!(!safepoint_allowed());
            {
                let _inner = NoSafepointScope::enter();
                assert_eq!(no_safepoint_depth(), 2);
            }
            assert_eq!(no_safepoint_depth(), 1);
        }
        assert!(safepoint_allowed());
    }

    #[test]
    fn test_headroom_restored_after_panic() {
        assert!(!stack_headroom_relaxed());
        let params = HeapParameters::small();
        let result = std::panic::catch_unwind(|| {
            with_stack_headroom(&params, || {
                assert!(stack_headroom_relaxed());
                panic!("collector failed");
            })
        });
        assert!(result.is_err());
        assert!(!stack_headroom_relaxed());
    }

    #[test]
    fn test_headroom_grows_a_small_stack() {
        fn burn(depth: usize) -> u8 {
            let frame = std::hint::black_box([depth as u8; 4096]);
            if depth == 0 {
                frame[0]
            } else {
                burn(depth - 1).wrapping_add(frame[4095])
            }
        }

        let params = HeapParameters::small();
        let handle = std::thread::Builder::new()
            .stack_size(128 * 1024)
            .spawn(move || with_stack_headroom(&params, || burn(256)))
            .unwrap();
        assert!(handle.join().is_ok());
    }

    #[test]
    fn test_counters_are_per_thread() {
        let _scope = NoSafepointScope::enter();
        let other = std::thread::spawn(safepoint_allowed).join().unwrap();
        assert!(other);
        assert!(!safepoint_allowed());
    }

    #[test]
    fn test_formatting_window_blocks_until_closed() {
        let safepoint = Arc::new(Safepoint::new());
        let state = safepoint.register();
        let window = state.begin_formatting(&safepoint).unwrap();

        let stopped = Arc::new(AtomicUsize::new(0));
        let collector = {
            let safepoint = Arc::clone(&safepoint);
            let stopped = Arc::clone(&stopped);
            std::thread::spawn(move || {
                safepoint.stop_mutators(|| stopped.fetch_add(1, Ordering::SeqCst));
            })
        };

        while !safepoint.collecting() {
            std::thread::yield_now();
        }
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(stopped.load(Ordering::SeqCst), 0);

        drop(window);
        collector.join().unwrap();
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
        assert!(!safepoint.collecting());

        // The TLAB was claimed by the collection
        assert!(state.begin_formatting(&safepoint).is_none());
        assert!(state.take_flush_request());
        assert!(state.begin_formatting(&safepoint).is_some());
    }

    #[test]
    fn test_registry() {
        let safepoint = Safepoint::new();
        let a = safepoint.register();
        let b = safepoint.register();
        assert_eq!(safepoint.mutator_count(), 2);
        safepoint.unregister(&a);
        assert_eq!(safepoint.mutator_count(), 1);
        safepoint.unregister(&b);
        assert_eq!(safepoint.mutator_count(), 0);
    }
}
