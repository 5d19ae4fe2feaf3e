//! AArch64 EL2 entry glue: the exception vector table and the trap
//! entry/exit paths that save and restore the guest register file around
//! the dispatchers in [`crate::trap`].

mod vectors;

pub use vectors::install_vectors;
