pub mod engine;
pub mod material;

pub use engine::{Encoding, Recipient, SealingKey, SecretEngine, SecretError};
pub use material::{GenerationRule, RenderedMaterial};
