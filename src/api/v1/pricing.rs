use rust_decimal::Decimal;
use time::OffsetDateTime;

use crate::error::Error;

use super::order::{Payment, PaymentStatus};
use super::terminal::{Locker, LockerSize, PriceEntry, PricingTable, TerminalModel};

/// Elapsed storage time rounded to the nearest whole hour. Durations
/// before the drop-off clamp to zero.
pub fn duration_in_hours(start: OffsetDateTime, end: OffsetDateTime) -> i64 {
    let seconds = (end - start).whole_seconds().max(0);
    (seconds + 1800) / 3600
}

pub fn rate_for(prices: &[PriceEntry], size: LockerSize) -> Option<Decimal> {
    prices
        .iter()
        .find(|entry| entry.size == size)
        .map(|entry| entry.price)
}

/// Usage charge on top of the base price. The first `table.time` hours
/// are free of additional charges; every hour beyond bills the per-size
/// rate.
pub fn additional_fee(table: &PricingTable, size: LockerSize, hours: i64) -> Result<Decimal, Error> {
    if hours <= table.time {
        return Ok(Decimal::ZERO);
    }

    let rate = rate_for(&table.prices, size)
        .ok_or_else(|| Error::PriceNotConfigured(size.as_str().to_string()))?;

    Ok(Decimal::from(hours - table.time) * rate)
}

/// Base price of a shipment: the locker's product price when one is
/// configured, otherwise the terminal-wide base price.
pub fn base_price_for(terminal: &TerminalModel, locker: &Locker) -> Result<Decimal, Error> {
    if let Some(product) = locker.products.first() {
        return Ok(product.price);
    }

    terminal.base_price.ok_or(Error::MissingBasePrice)
}

pub fn approved_payments_total(payments: &[Payment]) -> Decimal {
    payments
        .iter()
        .filter(|payment| payment.status == PaymentStatus::Approved)
        .map(|payment| payment.amount)
        .sum()
}

/// What the receiver still owes. Overpayment never goes negative.
pub fn due_balance(total: Decimal, approved: Decimal) -> Decimal {
    (total - approved).max(Decimal::ZERO)
}

/// Full money picture for a pickup, computed at collect time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub hours: i64,
    pub base_price: Decimal,
    pub additional_fee: Decimal,
    pub total: Decimal,
    pub paid: Decimal,
    pub due: Decimal,
}

pub fn settle(
    table: &PricingTable,
    size: LockerSize,
    base_price: Decimal,
    dropped_at: OffsetDateTime,
    collected_at: OffsetDateTime,
    payments: &[Payment],
) -> Result<Settlement, Error> {
    let hours = duration_in_hours(dropped_at, collected_at);
    let additional = additional_fee(table, size, hours)?;
    let total = base_price + additional;
    let paid = approved_payments_total(payments);

    Ok(Settlement {
        hours,
        base_price,
        additional_fee: additional,
        total,
        paid,
        due: due_balance(total, paid),
    })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use time::Duration;

    use super::*;

    fn table(time: i64, small_rate: i64) -> PricingTable {
        PricingTable {
            duration: "hour".to_string(),
            time,
            prices: vec![PriceEntry {
                size: LockerSize::Small,
                price: Decimal::from(small_rate),
            }],
            operator: None,
        }
    }

    fn payment(amount: i64, status: PaymentStatus) -> Payment {
        Payment {
            amount: Decimal::from(amount),
            status,
            reference: None,
            paid_at: bson::DateTime::now(),
        }
    }

    #[test]
    fn hours_round_to_nearest() {
        let start = OffsetDateTime::UNIX_EPOCH;

        assert_eq!(duration_in_hours(start, start), 0);
        assert_eq!(duration_in_hours(start, start + Duration::minutes(29)), 0);
        assert_eq!(duration_in_hours(start, start + Duration::minutes(31)), 1);
        assert_eq!(
            duration_in_hours(start, start + Duration::hours(4) + Duration::minutes(29)),
            4
        );
        assert_eq!(
            duration_in_hours(start, start + Duration::hours(4) + Duration::minutes(31)),
            5
        );
        // clock skew never produces a negative charge
        assert_eq!(duration_in_hours(start + Duration::hours(1), start), 0);
    }

    #[test]
    fn no_additional_fee_within_the_free_window() {
        let table = table(2, 2);

        assert_eq!(
            additional_fee(&table, LockerSize::Small, 0).unwrap(),
            Decimal::ZERO
        );
        assert_eq!(
            additional_fee(&table, LockerSize::Small, 2).unwrap(),
            Decimal::ZERO
        );
    }

    #[test]
    fn additional_fee_bills_hours_past_the_window() {
        // 5 hours stored, 2 free, $2/hour: 3 billable hours
        let table = table(2, 2);

        assert_eq!(
            additional_fee(&table, LockerSize::Small, 5).unwrap(),
            Decimal::from(6)
        );
    }

    #[test]
    fn unconfigured_size_is_an_error() {
        let table = table(2, 2);

        let error = additional_fee(&table, LockerSize::Large, 5).unwrap_err();
        assert_matches!(error, Error::PriceNotConfigured(size) if size == "LARGE");
    }

    #[test]
    fn fee_is_monotonic_in_hours() {
        let table = table(2, 2);

        let mut last = Decimal::MIN;
        for hours in 0..48 {
            let fee = additional_fee(&table, LockerSize::Small, hours).unwrap();
            assert!(fee >= last);
            last = fee;
        }
    }

    #[test]
    fn only_approved_payments_count() {
        let payments = vec![
            payment(5, PaymentStatus::Approved),
            payment(3, PaymentStatus::Pending),
            payment(2, PaymentStatus::Declined),
            payment(1, PaymentStatus::Approved),
        ];

        assert_eq!(approved_payments_total(&payments), Decimal::from(6));
    }

    #[test]
    fn due_never_goes_negative() {
        assert_eq!(
            due_balance(Decimal::from(10), Decimal::from(4)),
            Decimal::from(6)
        );
        assert_eq!(
            due_balance(Decimal::from(10), Decimal::from(12)),
            Decimal::ZERO
        );
    }

    #[test]
    fn settlement_for_a_five_hour_pickup() {
        // base $5, 5 hours stored, 2 free, $2/hour extra: total $11
        let table = table(2, 2);
        let start = OffsetDateTime::UNIX_EPOCH;
        let end = start + Duration::hours(5);

        let settlement = settle(
            &table,
            LockerSize::Small,
            Decimal::from(5),
            start,
            end,
            &[payment(4, PaymentStatus::Approved)],
        )
        .unwrap();

        assert_eq!(settlement.hours, 5);
        assert_eq!(settlement.additional_fee, Decimal::from(6));
        assert_eq!(settlement.total, Decimal::from(11));
        assert_eq!(settlement.paid, Decimal::from(4));
        assert_eq!(settlement.due, Decimal::from(7));
    }
}
