//! Lock-free concurrent building blocks: a Treiber stack and a
//! Michael–Scott queue.
//!
//! Both collections avoid the classic ABA problem without a native
//! double-word CAS: instead of packing a pointer and an update counter
//! into one atomic word, nodes are reclaimed through epoch-based memory
//! reclamation ([`crossbeam_epoch`]). A thread may never observe a freed
//! node's memory reused while it still holds a reference to it, which
//! gives the same ABA-safety a tagged-pointer scheme provides, without
//! requiring a 128-bit atomic on 64-bit targets.

mod queue;
mod stack;

pub use queue::LockFreeQueue;
pub use stack::LockFreeStack;
