pub mod openrouter;
pub mod yookassa;
