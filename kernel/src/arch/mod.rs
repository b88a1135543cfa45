//! Architecture support. This kernel targets RISC-V (`riscv64`) only; `riscv`
//! holds the CSR-level primitives (context switch, timer, PLIC, SBI) and
//! `riscv64` the boot assembly and trap vector built on top of them.

pub mod riscv;
pub mod riscv64;

pub use riscv64::*;
