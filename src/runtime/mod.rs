//! Host-side GPU plumbing: discovery from sysfs, device node metadata, and
//! the OCI/CDI integration built on top of them.

pub mod gpu;
pub mod oci;
