//! Call coalescing for expensive keyed operations.
//!
//! When a burst of callers all need the same thing at once (the classic
//! cache-miss thundering herd), [`Group`] runs the operation once and hands
//! every overlapping caller the same outcome. Nothing is cached: once a call
//! completes and its waiters are released, the next caller for that key
//! starts a fresh execution.
//!
//! [`Group`] coordinates blocking callers across threads; [`AsyncGroup`] is
//! its task-based counterpart for futures.
//!
//! # Examples
//!
//! ```
//! use coalesce::Group;
//!
//! let lookups: Group<String, String, String> = Group::new();
//! let value = lookups.work("user:42".to_owned(), || {
//!     // load from the backing store
//!     Ok("Ada".to_owned())
//! });
//! assert_eq!(value, Ok("Ada".to_owned()));
//! ```

mod async_group;
mod group;

pub use async_group::AsyncGroup;
pub use group::Group;
