use serde::{Deserialize, Serialize};

use crate::model::{DAY_MS, Money, Ms};

/// Price breakdown for a stay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub nights: u64,
    pub accommodation_total: Money,
    pub total_price: Money,
}

/// Number of nights billed for `[check_in, check_out)`.
///
/// Partial days round up. This is the single rounding rule: previews and
/// stored reservation totals both go through it.
pub fn nights(check_in: Ms, check_out: Ms) -> u64 {
    if check_out <= check_in {
        return 0;
    }
    check_out.abs_diff(check_in).div_ceil(DAY_MS as u64)
}

/// `nights * price_per_night + cleaning_fee`. Returns `None` on overflow.
pub fn quote(price_per_night: Money, cleaning_fee: Money, check_in: Ms, check_out: Ms) -> Option<Quote> {
    let nights = nights(check_in, check_out);
    let accommodation_total = nights.checked_mul(price_per_night)?;
    let total_price = accommodation_total.checked_add(cleaning_fee)?;
    Some(Quote {
        nights,
        accommodation_total,
        total_price,
    })
}
