//! Core pieces of the terminating-marker repair: the key-value store contract,
//! the typed resource model, the envelope codec and the migration pass.
//! Nothing in here performs network or filesystem I/O.

pub mod codec;
pub mod migrate;
pub mod resource;
pub mod store;
