pub type Amount = u64;

pub const COIN_DECIMALS: u32 = 12;
pub const COIN: Amount = 10u64.pow(COIN_DECIMALS);

pub fn format_amount(amount: Amount) -> String {
    let whole = amount / COIN;
    let fraction = amount % COIN;
    format!("{whole}.{fraction:012}")
}
