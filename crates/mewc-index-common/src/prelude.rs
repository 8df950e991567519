//! Re-exports collection types so the rest of this crate, and `mewc-index-core`,
//! compile the same way under `std` and under `no-std + alloc`.

#[cfg(feature = "std")]
mod names {
    pub use std::borrow::ToOwned;
    pub use std::boxed::Box;
    pub use std::collections::HashMap;
    pub use std::collections::HashSet;
    pub use std::collections::VecDeque;
    pub use std::string::String;
    pub use std::string::ToString;
    pub use std::sync::Arc;
    pub use std::vec;
    pub use std::vec::Vec;
}

#[cfg(not(feature = "std"))]
mod names {
    extern crate alloc;

    pub use alloc::borrow::ToOwned;
    pub use alloc::boxed::Box;
    pub use alloc::string::String;
    pub use alloc::string::ToString;
    pub use alloc::sync::Arc;
    pub use alloc::vec;
    pub use alloc::vec::Vec;
    pub use hashbrown::HashMap;
    pub use hashbrown::HashSet;
    pub use std::collections::VecDeque;
}

pub use names::*;
