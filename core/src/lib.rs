//! Differentiable neural stack (Grefenstette et al. 2015) with feed-forward
//! and Elman-recurrent controllers, a task harness for formal-language
//! experiments and an AdamW training loop.
//!
//! Data flow: `task` → padded tensors (`dataset`) → `train` → per-step
//! `controller` → `stack` push/pop/read → logits → masked cross entropy →
//! `backward` (interleaved controller/stack reverse pass) → `adamw`.

pub mod error;
pub mod tensor;
pub mod stack;
pub mod model;
pub mod controller;
pub mod forward;
pub mod backward;
pub mod gradient;
pub mod adamw;
pub mod grammar;
pub mod task;
pub mod dataset;
pub mod config;
pub mod train;

pub use error::{Error, Result};
