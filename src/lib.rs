//! Preloadable profiling allocator.
//!
//! pmem replaces the C allocation interface with two tightly coupled
//! halves: a segregated-fit allocator that serves small requests from
//! size-class freelists carved out of anonymous pages (and everything else
//! from page-rounded mappings), and an always-on heap profiler that charges
//! every allocation and free to the stack trace that issued it. Once the
//! accumulated alloc+free byte churn crosses a threshold, a snapshot of all
//! call sites is appended to `./pmem.<pid>.log`.
//!
//! # Usage
//!
//! Build the shared library and preload it under any dynamically linked
//! program:
//!
//! ```bash
//! cargo build --release
//! LD_PRELOAD=target/release/libpmem.so ./your-program
//! ```
//!
//! Build with frame pointers for the most useful traces:
//!
//! ```bash
//! RUSTFLAGS="-C force-frame-pointers=yes" cargo build --release
//! ```
//!
//! # Configuration
//!
//! Everything is fixed at build time:
//!
//! - `PMEM_CHURN_THRESH` (env var, bytes, default 1 MiB): dump threshold.
//! - `unwind` cargo feature (default on): symbolise frames when a call
//!   site is first interned. Building with `--no-default-features` keeps
//!   raw addresses and symbolises at dump time instead.

pub mod api;
pub mod error;
pub mod lock;
pub mod mem;
pub mod prof;
pub mod table;
pub mod unwind;

pub use error::{Error, Result};
