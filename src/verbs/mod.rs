//! Mostly-safe wrappers of the verbs resources the engines are built from.
//!
//! Every wrapper follows the same shape: a `NonNull` newtype over the raw
//! verbs pointer, an `Arc`-held ownership body that destroys the resource on
//! drop, and a cheap cached pointer for the hot paths.

mod context;
mod cq;
mod gid;
mod mr;
mod pd;
mod qp;
mod srq;

pub use self::context::*;
pub use self::cq::*;
pub use self::gid::*;
pub use self::mr::*;
pub use self::pd::*;
pub use self::qp::*;
pub use self::srq::*;
