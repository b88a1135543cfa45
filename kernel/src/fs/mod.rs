//! Filesystem layer: a block cache sitting over a `BlockDevice`, and KTFS,
//! the on-disk filesystem built on top of it.

pub mod blockdev;
pub mod cache;
pub mod ktfs;
