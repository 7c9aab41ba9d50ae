use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

pub mod common;
pub mod controller;
pub mod engine;
pub mod fixtures;
pub mod normalize;
pub mod scorer;
pub mod tensor;
