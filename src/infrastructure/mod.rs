pub mod bingx;
pub mod exchange;
pub mod telegram;
