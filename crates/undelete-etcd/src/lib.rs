//! etcd v3 backend for the repair: mutually authenticated TLS, paged prefix scans
//! and single-key puts.

pub mod etcd_store;
pub mod tls;
