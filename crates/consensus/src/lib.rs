pub mod checkpoints;
pub mod constants;
pub mod math;
pub mod money;
pub mod params;

pub use checkpoints::Checkpoints;
pub use money::{format_amount, Amount};
pub use params::{currency, Currency, Network};
