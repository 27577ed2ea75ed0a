pub mod instructions;
pub mod signature;

pub use instructions::CallInstruction;
pub use signature::{compute_signature, verify_signature};
