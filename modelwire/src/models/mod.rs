pub mod static_models;

pub use static_models::{claude_models, gemini_models, openai_models, static_models_for};
