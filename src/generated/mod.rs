// Automatically generated mod.rs
pub mod packet;
