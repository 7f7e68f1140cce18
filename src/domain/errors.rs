//! Domain-level validation errors.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid price: {0}")]
    InvalidPrice(String),

    #[error("Invalid quantity: {0}")]
    InvalidQuantity(String),

    #[error("Quantity below exchange minimum: {quantity} < {min_qty}")]
    BelowMinQuantity { quantity: String, min_qty: String },

    #[error("Dual-limit prices cannot be made maker-safe within {0} tick shifts")]
    MakerSafetyExhausted(u32),
}
