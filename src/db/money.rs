//! NUMERIC(14,2) 列与最小货币单位 (i64) 之间的转换

use bigdecimal::{BigDecimal, ToPrimitive};

use crate::error::{AppError, AppResult};

pub fn to_minor(value: &BigDecimal) -> AppResult<i64> {
    (value * &BigDecimal::from(100))
        .round(0)
        .to_i64()
        .ok_or_else(|| AppError::validation(format!("amount {value} out of range")))
}

pub fn from_minor(minor: i64) -> BigDecimal {
    BigDecimal::from(minor) / BigDecimal::from(100)
}
