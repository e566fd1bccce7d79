//! Resources shared between connections.
//!
//! The only one so far is memory for queued segments. Instead of a global counter every engine is
//! handed a [`MemoryBudget`] on construction. Connections that should compete for the same memory
//! get clones of the same budget, others get separate ones.
//!
//! [`MemoryBudget`]: struct.MemoryBudget.html
mod budget;

pub use self::budget::{Charge, MemoryBudget};
