//! Metadata server cache core.
//!
//! One [`MdsNode`] per server process holds the partially replicated
//! namespace, the per-object lock state machines and the ownership
//! topology. Everything is driven by three entry points: client requests
//! ([`MdsNode::submit`]), peer messages ([`MdsNode::proc_message`]) and the
//! logical clock ([`MdsNode::tick`]). No entry point ever blocks; a step
//! that needs a peer records a waiter and returns.

// Panics in the cache core leave peers with dangling replicas and frozen
// subtrees; every failure is propagated as an MdsError instead.
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

/// Unwrap a `Flow::Ready`, returning any other flow to the caller.
macro_rules! step {
    ($e:expr) => {
        match $e {
            $crate::mds::Flow::Ready(v) => v,
            $crate::mds::Flow::Blocked(k) => return Ok($crate::mds::Flow::Blocked(k)),
            $crate::mds::Flow::Forward(n) => return Ok($crate::mds::Flow::Forward(n)),
            $crate::mds::Flow::Pending => return Ok($crate::mds::Flow::Pending),
        }
    };
}

pub mod cache;
pub mod hasher;
pub mod locker;
pub mod messages;
pub mod migrator;
mod node;
pub mod renamer;
pub mod request;
pub mod topology;

pub use cache::{CDentry, CDir, CInode, FreezeState, MdCache};
pub use locker::{DentryLock, DentryLockState, LockFacet, LockMode, LockState, SimpleLock};
pub use messages::{ClientOp, ClientReply, ClientRequest, MdsMessage, ReplyBody};
pub use node::{Flow, MdsNode, Trace, WaitKey};
pub use request::{ActiveRequest, RequestId, RequestTracker};
pub use topology::Topology;
