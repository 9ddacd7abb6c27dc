pub mod bar;
pub mod position;
pub mod symbol;
pub mod tick;
pub mod timeframe;
