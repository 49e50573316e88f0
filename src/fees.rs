use crate::error::SettlementError;

/// Outcome of splitting a gross fare between the driver and the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Split {
    pub driver_net_cents: i64,
    pub platform_fee_cents: i64,
}

/// Split a gross fare into driver net and platform fee.
///
/// The fee is rounded half-up on integer minor units; the two outputs always
/// sum to `gross_cents` exactly because the net is derived by subtraction,
/// never rounded independently.
pub fn compute_settlement(
    gross_cents: i64,
    driver_percent: i64,
) -> Result<Split, SettlementError> {
    if gross_cents < 0 {
        return Err(SettlementError::InvalidAmount);
    }
    if !(0..=100).contains(&driver_percent) {
        return Err(SettlementError::InvalidAmount);
    }

    let fee_share = 100 - driver_percent;
    let scaled = gross_cents
        .checked_mul(fee_share)
        .and_then(|v| v.checked_add(50))
        .ok_or(SettlementError::AmountOverflow)?;
    let platform_fee_cents = scaled / 100;
    let driver_net_cents = gross_cents - platform_fee_cents;

    Ok(Split {
        driver_net_cents,
        platform_fee_cents,
    })
}

/// Gross fare for a booking: price per seat times seat count, checked.
pub fn gross_amount(price_per_seat_cents: i64, seats: i32) -> Result<i64, SettlementError> {
    if price_per_seat_cents <= 0 || seats <= 0 {
        return Err(SettlementError::InvalidAmount);
    }
    price_per_seat_cents
        .checked_mul(i64::from(seats))
        .ok_or(SettlementError::AmountOverflow)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ninety_ten_split_matches_expected_fare() {
        // Fare 2000 at a 90% driver share: driver 1800, platform 200.
        let split = compute_settlement(2000, 90).unwrap();
        assert_eq!(split.driver_net_cents, 1800);
        assert_eq!(split.platform_fee_cents, 200);
    }

    #[test]
    fn fee_rounds_half_up() {
        // 999 * 10% = 99.9 -> fee 100.
        let split = compute_settlement(999, 90).unwrap();
        assert_eq!(split.platform_fee_cents, 100);
        assert_eq!(split.driver_net_cents, 899);

        // 50 * 1% = 0.5 -> exactly half rounds up to 1.
        let split = compute_settlement(50, 99).unwrap();
        assert_eq!(split.platform_fee_cents, 1);
        assert_eq!(split.driver_net_cents, 49);

        // 49 * 1% = 0.49 -> rounds down to 0.
        let split = compute_settlement(49, 99).unwrap();
        assert_eq!(split.platform_fee_cents, 0);
        assert_eq!(split.driver_net_cents, 49);
    }

    #[test]
    fn split_always_sums_to_gross_exactly() {
        for gross in [0, 1, 7, 49, 50, 99, 100, 101, 999, 2000, 123_456_789] {
            for pct in [0, 1, 10, 50, 85, 90, 99, 100] {
                let split = compute_settlement(gross, pct).unwrap();
                assert_eq!(
                    split.driver_net_cents + split.platform_fee_cents,
                    gross,
                    "leaked cents at gross={gross} pct={pct}"
                );
                assert!(split.platform_fee_cents >= 0);
                assert!(split.driver_net_cents >= 0);
            }
        }
    }

    #[test]
    fn boundary_shares() {
        let split = compute_settlement(1234, 100).unwrap();
        assert_eq!(split.platform_fee_cents, 0);
        assert_eq!(split.driver_net_cents, 1234);

        let split = compute_settlement(1234, 0).unwrap();
        assert_eq!(split.platform_fee_cents, 1234);
        assert_eq!(split.driver_net_cents, 0);
    }

    #[test]
    fn rejects_bad_inputs() {
        assert!(matches!(
            compute_settlement(-1, 90),
            Err(SettlementError::InvalidAmount)
        ));
        assert!(matches!(
            compute_settlement(100, 101),
            Err(SettlementError::InvalidAmount)
        ));
        assert!(matches!(
            compute_settlement(i64::MAX, 10),
            Err(SettlementError::AmountOverflow)
        ));
    }

    #[test]
    fn gross_amount_is_checked() {
        assert_eq!(gross_amount(2500, 3).unwrap(), 7500);
        assert!(matches!(
            gross_amount(0, 2),
            Err(SettlementError::InvalidAmount)
        ));
        assert!(matches!(
            gross_amount(100, 0),
            Err(SettlementError::InvalidAmount)
        ));
        assert!(matches!(
            gross_amount(i64::MAX, 2),
            Err(SettlementError::AmountOverflow)
        ));
    }
}
