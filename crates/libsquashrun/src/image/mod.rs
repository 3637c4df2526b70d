//! Image acquisition and storage: pull into an OCI layout, unpack to a
//! rootfs, pack as squashfs, register in the repository.

pub mod metadata;
pub mod puller;
pub mod squashfs;
pub mod store;
pub mod unpacker;
