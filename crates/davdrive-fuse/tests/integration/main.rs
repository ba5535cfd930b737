//! Integration tests for davdrive-fuse
//!
//! Drives `DavDriver` through its callback contract against an in-memory
//! repository and verifies caching, content transfer and namespace
//! behavior end to end.

mod common;

mod test_lookup;
mod test_namespace;
mod test_writes;
