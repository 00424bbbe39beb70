//! Script execution internals: the embedded interpreter, its host
//! bindings, value conversion, and the per-context worker threads.

pub mod bindings;
pub mod conversions;
pub mod handler_set;
pub mod script;
pub mod worker;
